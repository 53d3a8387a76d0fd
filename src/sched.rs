//! Scheduler (C5)
//!
//! Ready list, current-task pointer, tick-driven time base, and the
//! `block`/`unblock`/`add`/`remove`/`yield` contract every primitive is
//! built on. Grounded on the teacher's `task.rs` (`choose_next_running_task`,
//! `unlock_cpu_and_check_preemption`, `wait_until_woken_up`) and
//! `timer.rs`/`timeout.rs` for the tick hook's timer-draining step.
//!
//! Every method here takes either a fresh critical section (the public
//! entry points, which call [`lock_critical`] exactly once) or a borrowed
//! [`CriticalTokenRefMut`] (the internal helpers), so that a single call
//! like `tick_hook` can perform several list manipulations -- draining
//! timers, waking sleepers, rotating the run queue -- without leaving and
//! re-entering the critical section between them.
use core::cell::Cell;

use crate::{
    error::{Error, FaultKind, Result, WakeReason},
    klock::{lock_critical, CriticalCell, CriticalTokenRefMut},
    kernel_traits::KernelTraits,
    list::List,
    task::{ListTag, SchedPolicy, TaskCb, TaskId, TaskSt},
    time::{Duration, Instant, TickClock},
    timer::TimerHeap,
};

/// The scheduler singleton (§9: "Scheduler-wide mutable state ... singleton
/// with explicit `initialize` entry point"). One `'static` instance per
/// application, returned by `KernelTraits::state()`.
pub struct Scheduler<Traits: KernelTraits, const NTIMERS: usize = 16> {
    ready: CriticalCell<Traits, List>,
    /// Waiter list for `ThisThread::sleep_for`/`sleep_until` (§4.3): tasks
    /// blocked on a deadline alone, not on any synchronization primitive.
    sleepers: CriticalCell<Traits, List>,
    current: CriticalCell<Traits, Option<TaskId>>,
    clock: CriticalCell<Traits, TickClock>,
    timers: CriticalCell<Traits, TimerHeap<Traits, NTIMERS>>,
    fault_hook: Cell<fn(FaultKind) -> !>,
}

// Safety: all mutable state lives behind `CriticalCell`, which only permits
// access while holding the scheduler-wide critical section; `fault_hook`
// is a plain fn pointer, not a pointer to task-local data.
unsafe impl<Traits: KernelTraits, const NTIMERS: usize> Sync for Scheduler<Traits, NTIMERS> {}

fn default_fault_hook(kind: FaultKind) -> ! {
    log::error!("kernel fault: {kind:?}");
    panic!("kernel fault: {kind:?}");
}

impl<Traits: KernelTraits, const NTIMERS: usize> Scheduler<Traits, NTIMERS> {
    pub const fn new() -> Self {
        Self {
            ready: CriticalCell::new(List::new()),
            sleepers: CriticalCell::new(List::new()),
            current: CriticalCell::new(None),
            clock: CriticalCell::new(TickClock::new()),
            timers: CriticalCell::new(TimerHeap::new()),
            fault_hook: Cell::new(default_fault_hook),
        }
    }

    /// Install a custom fault hook (§7.1, A5). Not interrupt-safe to call
    /// concurrently with a fault; intended to be set once during boot.
    pub fn set_fault_hook(&self, hook: fn(FaultKind) -> !) {
        self.fault_hook.set(hook);
    }

    pub(crate) fn fault(&self, kind: FaultKind) -> ! {
        (self.fault_hook.get())(kind)
    }

    #[inline]
    pub fn now(&self) -> Instant {
        match lock_critical::<Traits>() {
            Ok(mut lock) => {
                let tok = lock.borrow_mut();
                self.clock.read(&*tok).now()
            }
            Err(_) => {
                // Already inside a critical section (e.g. called from
                // within another kernel API's implementation).
                let mut lock = unsafe { crate::klock::assume_critical::<Traits>() };
                let tok = lock.borrow_mut();
                let now = self.clock.read(&*tok).now();
                core::mem::forget(lock);
                now
            }
        }
    }

    #[inline]
    pub(crate) fn current(&self, tok: &CriticalTokenRefMut<'_, Traits>) -> Option<TaskId> {
        *self.current.read(&**tok)
    }

    fn task(id: TaskId) -> &'static TaskCb<Traits> {
        &Traits::task_pool()[id.index()]
    }

    /// `Scheduler::add` (§4.3): bring a `New` task into `Runnable`.
    pub fn add(&self, id: TaskId) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        if Self::task(id).state(&tok) != TaskSt::New {
            return Err(Error::Einval);
        }
        self.make_runnable(&mut tok, id);
        log::debug!("task {} added to ready queue", id.index());
        self.check_preemption(&tok);
        Ok(())
    }

    fn make_runnable(&self, tok: &mut CriticalTokenRefMut<'_, Traits>, id: TaskId) {
        let task = Self::task(id);
        task.st.replace(&mut **tok, TaskSt::Runnable);
        if let SchedPolicy::RoundRobin { quantum } = *task.policy.read(&**tok) {
            task.quantum_left.replace(&mut **tok, quantum);
        }
        let mut ready = self.ready.replace(&mut **tok, List::new());
        ready.insert::<Traits>(tok, ListTag::Ready, id);
        self.ready.replace(&mut **tok, ready);
    }

    /// After a list mutation that may have changed who should run, request a
    /// context switch if the front of the ready list now outranks whichever
    /// task would otherwise keep running.
    fn check_preemption(&self, tok: &CriticalTokenRefMut<'_, Traits>) {
        let cur_pri = match self.current(tok) {
            Some(id) if Self::task(id).state(tok) == TaskSt::Runnable => {
                Some(Self::task(id).effective_priority(tok))
            }
            _ => None,
        };
        let ready = self.ready.read(&**tok);
        let front_outranks = match (ready.front(), cur_pri) {
            (Some(front), Some(cur)) => Self::task(front).effective_priority(tok) > cur,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if front_outranks {
            log::trace!("preemption requested");
            Traits::request_context_switch();
        }
    }

    /// `Scheduler::yield` (§4.3): for round-robin tasks, move the current
    /// task behind its same-priority peers; for FIFO tasks, a no-op (FIFO
    /// tasks only yield the CPU by blocking or being preempted, per §3's
    /// ties-FIFO ordering invariant).
    pub fn yield_now(&self) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        if let Some(cur_id) = self.current(&tok) {
            let cur_task = Self::task(cur_id);
            if matches!(*cur_task.policy.read(&*tok), SchedPolicy::RoundRobin { .. }) {
                self.rotate_peer_band(&mut tok, cur_id);
            }
        }
        self.check_preemption(&tok);
        Ok(())
    }

    /// Core of every `block`/`block_until` wrapper (§4.3). Moves the current
    /// task out of the ready list into `list` under `state`, requests a
    /// context switch, and (from the port's perspective) returns only once
    /// the task has been unblocked. The wake reason is read back out after
    /// the port resumes this task.
    ///
    /// Opens and closes its own critical section; only safe to call when
    /// the precondition a primitive blocks on (count is zero, mutex is
    /// owned by someone else, ...) was just checked with no intervening
    /// `leave_critical`. A primitive that needs to check-then-block
    /// atomically (i.e. every primitive but `sleep_until`, which has no
    /// precondition to race) must instead call
    /// [`block_enqueue`](Self::block_enqueue) under the same lock as the
    /// check and [`block_resume`](Self::block_resume) after dropping it.
    pub(crate) fn block(
        &self,
        list: &'static CriticalCell<Traits, List>,
        state: TaskSt,
    ) -> WakeReason {
        let mut lock =
            lock_critical::<Traits>().unwrap_or_else(|_| self.fault(FaultKind::IllegalTransition));
        let mut tok = lock.borrow_mut();
        let id = self.block_enqueue(&mut tok, list, state, None);
        drop(lock);
        self.block_resume(id)
    }

    pub(crate) fn block_until(
        &self,
        list: &'static CriticalCell<Traits, List>,
        state: TaskSt,
        deadline: Instant,
    ) -> WakeReason {
        let mut lock =
            lock_critical::<Traits>().unwrap_or_else(|_| self.fault(FaultKind::IllegalTransition));
        let mut tok = lock.borrow_mut();
        let id = self.block_enqueue(&mut tok, list, state, Some(deadline));
        drop(lock);
        self.block_resume(id)
    }

    /// First half of `block`/`block_until`, split out so a primitive can
    /// hold the lock continuously from its failed `try_X` check through to
    /// the enqueue, instead of re-acquiring a fresh critical section in
    /// between -- closing the window where a `post`/`notify`/`raise` from
    /// interrupt context could land after the check but before this task is
    /// actually on `list` to receive it. Returns the blocked task's id, to
    /// be passed to [`block_resume`](Self::block_resume) once `tok`'s lock
    /// has been dropped.
    pub(crate) fn block_enqueue(
        &self,
        tok: &mut CriticalTokenRefMut<'_, Traits>,
        list: &'static CriticalCell<Traits, List>,
        state: TaskSt,
        deadline: Option<Instant>,
    ) -> TaskId {
        if !Traits::is_task_context() {
            self.fault(FaultKind::BlockInIsr);
        }
        let id = self.current(tok).expect("block called with no current task");
        let task = Self::task(id);

        let mut ready = self.ready.replace(&mut **tok, List::new());
        ready.remove::<Traits>(tok, id);
        self.ready.replace(&mut **tok, ready);

        task.st.replace(&mut **tok, state);
        task.deadline.replace(&mut **tok, deadline);
        task.wait_list.replace(&mut **tok, Some(list));

        let mut waiters = list.replace(&mut **tok, List::new());
        waiters.insert::<Traits>(tok, state_tag(state), id);
        list.replace(&mut **tok, waiters);

        self.current.replace(&mut **tok, None);
        Traits::request_context_switch();
        id
    }

    /// Second half of `block`/`block_until`: called after the lock passed to
    /// [`block_enqueue`](Self::block_enqueue) has been dropped, once the
    /// port has resumed `id`'s context. Picks the wake reason back up and
    /// leaves the critical section the port re-entered on this task's
    /// behalf.
    pub(crate) fn block_resume(&self, id: TaskId) -> WakeReason {
        // The port has, by the time it resumes this thread's context,
        // re-entered the critical section on its behalf (mirroring the
        // teacher's `wait_until_woken_up`, which returns with CPU Lock
        // still active).
        let mut lock = unsafe { crate::klock::assume_critical::<Traits>() };
        let tok = lock.borrow_mut();
        let task = Self::task(id);
        debug_assert_eq!(task.state(&tok), TaskSt::Runnable);
        *task.wake_reason.read(&*tok)
    }

    /// `Scheduler::unblock` (§4.3): pull `id` out of `list` and restore it
    /// to `Runnable`, recording `reason`.
    pub(crate) fn unblock(
        &self,
        tok: &mut CriticalTokenRefMut<'_, Traits>,
        list: &'static CriticalCell<Traits, List>,
        id: TaskId,
        reason: WakeReason,
    ) {
        let task = Self::task(id);
        debug_assert!(task.state(tok).is_blocked());
        let mut waiters = list.replace(&mut **tok, List::new());
        waiters.remove::<Traits>(tok, id);
        list.replace(&mut **tok, waiters);

        task.wake_reason.replace(&mut **tok, reason);
        task.deadline.replace(&mut **tok, None);
        task.wait_list.replace(&mut **tok, None);
        self.make_runnable(tok, id);
        self.check_preemption(tok);
    }

    /// `Scheduler::remove` (§4.3): the calling task invokes `hook` under a
    /// critical section (e.g. abandoning owned mutexes, posting the join
    /// semaphore), then terminates permanently.
    pub fn remove(&self, hook: impl FnOnce(&mut CriticalTokenRefMut<'_, Traits>, TaskId)) -> ! {
        let mut lock =
            lock_critical::<Traits>().unwrap_or_else(|_| self.fault(FaultKind::BlockInIsr));
        let mut tok = lock.borrow_mut();
        let id = self
            .current(&tok)
            .expect("remove called with no current task");
        hook(&mut tok, id);
        Self::task(id).st.replace(&mut *tok, TaskSt::Terminated);
        self.current.replace(&mut *tok, None);
        Traits::request_context_switch();
        drop(lock);
        unreachable!("a Terminated task must never be resumed")
    }

    /// `Thread::join` (§4.3.1, restored from `original_source/`): block the
    /// calling task until `target` terminates. `EDEADLK` if `target` is the
    /// caller itself. Returns immediately, without blocking, if `target`
    /// has already terminated.
    ///
    /// The Terminated check and the enqueue onto `target`'s join-waiter
    /// list happen under the same critical section as each other (unlike a
    /// `try_X`-then-`block` pair, which would leave a window between the
    /// check and the enqueue for `target` to terminate and find no one
    /// queued yet -- a lost wakeup `exit`'s one-time notify-all can't
    /// recover from).
    pub fn join(&self, target: TaskId) -> Result<()> {
        if !Traits::is_task_context() {
            self.fault(FaultKind::BlockInIsr);
        }
        let mut lock =
            lock_critical::<Traits>().unwrap_or_else(|_| self.fault(FaultKind::IllegalTransition));
        let mut tok = lock.borrow_mut();
        let id = self.current(&tok).expect("join called with no current task");
        if id == target {
            return Err(Error::Edeadlk);
        }
        let target_task = Self::task(target);
        if target_task.state(&tok) == TaskSt::Terminated {
            return Ok(());
        }

        let task = Self::task(id);
        let list = target_task.join_sem.waiters();

        let mut ready = self.ready.replace(&mut *tok, List::new());
        ready.remove::<Traits>(&mut tok, id);
        self.ready.replace(&mut *tok, ready);

        task.st.replace(&mut *tok, TaskSt::BlockedOnJoin);
        task.deadline.replace(&mut *tok, None);
        task.wait_list.replace(&mut *tok, Some(list));

        let mut waiters = list.replace(&mut *tok, List::new());
        waiters.insert::<Traits>(&mut tok, state_tag(TaskSt::BlockedOnJoin), id);
        list.replace(&mut *tok, waiters);

        self.current.replace(&mut *tok, None);
        Traits::request_context_switch();
        drop(lock);

        let mut lock = unsafe { crate::klock::assume_critical::<Traits>() };
        let tok = lock.borrow_mut();
        debug_assert_eq!(task.state(&tok), TaskSt::Runnable);
        match *task.wake_reason.read(&*tok) {
            WakeReason::Normal => Ok(()),
            WakeReason::Signal => Err(Error::Eintr),
            WakeReason::TimedOut => unreachable!("join never sets a deadline"),
        }
    }

    /// `ThisThread::exit` (§4.3.1/§4.5.2, restored from `original_source/`):
    /// terminate the calling task, abandoning any mutexes it still owns
    /// (§4.5.2) and waking every task blocked in [`join`](Self::join) on
    /// it, not just the first.
    pub fn exit(&self) -> ! {
        self.remove(|tok, id| {
            crate::mutex::MutexCb::abandon_all(tok, id);
            let list = Self::task(id).join_sem.waiters();
            loop {
                let mut waiters = list.replace(&mut **tok, List::new());
                match waiters.pop_front::<Traits>(tok) {
                    Some(front) => {
                        list.replace(&mut **tok, waiters);
                        self.unblock(tok, list, front, WakeReason::Normal);
                    }
                    None => {
                        list.replace(&mut **tok, waiters);
                        break;
                    }
                }
            }
        })
    }

    /// `Scheduler::tickHook` (§4.3): advance the tick, drain expired timers,
    /// wake expired sleepers, rotate the round-robin quantum. Called from
    /// interrupt context by the tick-timer ISR. Order: timers, then timed
    /// waiters, then round-robin quantum, matching the documented tick-hook
    /// precedence (§4.8, §4.3).
    pub fn tick_hook(&'static self) {
        let mut lock = match lock_critical::<Traits>() {
            Ok(l) => l,
            Err(_) => return, // re-entrant tick ISR while already locked; ignore
        };
        let mut tok = lock.borrow_mut();

        let mut clock = self.clock.replace(&mut *tok, TickClock::new());
        let now = clock.advance();
        self.clock.replace(&mut *tok, clock);

        crate::timer::drain_due::<Traits, NTIMERS>(self, &mut tok, now);

        // Wake any blocked-with-deadline task whose time has come. The task
        // pool is expected to be small (§3's sizing assumption for
        // intrusive structures), so a linear scan each tick is acceptable.
        for (i, task) in Traits::task_pool().iter().enumerate() {
            let due = match (*task.deadline.read(&*tok), task.state(&tok)) {
                (Some(d), st) if st.is_blocked() => d <= now,
                _ => false,
            };
            if due {
                let id = TaskId(i as u16);
                if let Some(list) = *task.wait_list.read(&*tok) {
                    self.unblock(&mut tok, list, id, WakeReason::TimedOut);
                }
            }
        }

        if let Some(cur) = self.current(&tok) {
            let task = Self::task(cur);
            if let SchedPolicy::RoundRobin { quantum } = *task.policy.read(&*tok) {
                let left = *task.quantum_left.read(&*tok);
                if left <= 1 {
                    task.quantum_left.replace(&mut *tok, quantum);
                    self.rotate_peer_band(&mut tok, cur);
                } else {
                    task.quantum_left.replace(&mut *tok, left - 1);
                }
            }
        }

        self.check_preemption(&tok);
    }

    fn rotate_peer_band(&self, tok: &mut CriticalTokenRefMut<'_, Traits>, id: TaskId) {
        let mut ready = self.ready.replace(&mut **tok, List::new());
        if ready.front() == Some(id) {
            ready.remove::<Traits>(tok, id);
            ready.insert::<Traits>(tok, ListTag::Ready, id);
        }
        self.ready.replace(&mut **tok, ready);
    }

    /// Called by the port immediately after it has actually switched the
    /// CPU onto a new stack, to pick which task runs next. The port's
    /// dispatch trampoline calls this with the critical section already
    /// held, then performs the register-level switch to the returned task.
    ///
    /// If the previously-current task is still `Runnable` (preempted rather
    /// than blocked -- `block_inner` already moved a blocking task out of
    /// `Runnable` and off the ready list itself), it's re-inserted into the
    /// ready list before a successor is chosen, so a preemption never drops
    /// it on the floor.
    pub fn choose_next(&self, tok: &mut CriticalTokenRefMut<'_, Traits>) -> TaskId {
        if let Some(cur) = self.current(tok) {
            if Self::task(cur).state(tok) == TaskSt::Runnable {
                let mut ready = self.ready.replace(&mut **tok, List::new());
                ready.insert::<Traits>(tok, ListTag::Ready, cur);
                self.ready.replace(&mut **tok, ready);
            }
        }
        let mut ready = self.ready.replace(&mut **tok, List::new());
        let next = match ready.pop_front::<Traits>(tok) {
            Some(id) => id,
            None => {
                let idle = Traits::idle_task();
                TaskId(
                    Traits::task_pool()
                        .iter()
                        .position(|t| core::ptr::eq(t, idle))
                        .expect("idle task must be a member of task_pool") as u16,
                )
            }
        };
        self.ready.replace(&mut **tok, ready);
        Self::task(next).st.replace(&mut **tok, TaskSt::Runnable);
        self.current.replace(&mut **tok, Some(next));
        next
    }

    /// `ThisThread::sleep_until` (§4.3): block the calling task until `when`
    /// or until a signal interrupts the sleep (§4.9, `EINTR`).
    pub fn sleep_until(&'static self, when: Instant) -> Result<()> {
        self.block_until(&self.sleepers, TaskSt::Sleeping, when)
            .into_result()
    }

    /// `ThisThread::sleep_for` (§4.3): relative-duration convenience
    /// wrapper, biased by one tick toward oversleeping (see
    /// [`sleep_for_deadline`]).
    pub fn sleep_for(&'static self, d: Duration) -> Result<()> {
        self.sleep_until(sleep_for_deadline(self.now(), d))
    }

    pub(crate) fn timers(&self) -> &CriticalCell<Traits, TimerHeap<Traits, NTIMERS>> {
        &self.timers
    }

    pub(crate) fn ready_list(&self) -> &CriticalCell<Traits, List> {
        &self.ready
    }
}

fn state_tag(state: TaskSt) -> ListTag {
    match state {
        TaskSt::BlockedOnSemaphore => ListTag::Semaphore,
        TaskSt::BlockedOnMutex => ListTag::Mutex,
        TaskSt::BlockedOnConditionVariable => ListTag::CondVar,
        TaskSt::BlockedOnMessageQueueEmpty => ListTag::MqPush,
        TaskSt::BlockedOnMessageQueueFull => ListTag::MqPop,
        TaskSt::BlockedOnSignalWait => ListTag::SignalWait,
        TaskSt::BlockedOnJoin => ListTag::Join,
        TaskSt::Sleeping => ListTag::Sleep,
        TaskSt::New | TaskSt::Runnable | TaskSt::Terminated => ListTag::None,
    }
}

/// `ThisThread::sleep_for`'s deadline computation (§4.3 edge case): add one
/// tick so that at least the full requested duration elapses, matching the
/// original implementation's off-by-one-tick bias toward oversleeping
/// rather than undersleeping.
pub(crate) fn sleep_for_deadline(now: Instant, d: Duration) -> Instant {
    now + d + Duration::from_ticks(1)
}
