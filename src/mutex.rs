//! Mutex with optional priority inheritance / priority-protect (C7)
//!
//! Grounded on the teacher's `mutex.rs` and the distortos original's
//! `Mutex`/`PriorityInheritanceMutexControlBlock`: ownership, recursion,
//! the `none`/`inherit`/`protect` protocols (§4.5), and abandonment on
//! thread exit (§4.5.2, restored from `original_source/`).
use crate::{
    error::{Error, Result},
    klock::{lock_critical, CriticalCell, CriticalTokenRefMut},
    kernel_traits::KernelTraits,
    list::List,
    task::{Priority, TaskId, TaskSt},
    time::{Duration, Instant},
};

/// Locking protocol a mutex enforces (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// No boosting; priority inversion is possible.
    None,
    /// Priority inheritance: the owner's effective priority is boosted to
    /// the highest-priority blocked waiter's, for as long as it's blocked.
    Inherit,
    /// Priority-protect (priority ceiling): the owner's effective priority
    /// is raised to `ceiling` for the duration of ownership, regardless of
    /// whether anyone is waiting.
    Protect { ceiling: Priority },
}

/// *Mutex control block* (C7).
pub struct MutexCb<Traits: KernelTraits> {
    protocol: Protocol,
    recursive: bool,
    owner: CriticalCell<Traits, Option<TaskId>>,
    recursion_count: CriticalCell<Traits, u32>,
    waiters: CriticalCell<Traits, List>,
    /// Intrusive singly-linked list of mutexes owned by the same task
    /// (`TaskCb::owned_mutexes`), used for abandonment on exit.
    next_owned: CriticalCell<Traits, Option<&'static MutexCb<Traits>>>,
}

unsafe impl<Traits: KernelTraits> Sync for MutexCb<Traits> {}

impl<Traits: KernelTraits> MutexCb<Traits> {
    pub const fn new(protocol: Protocol, recursive: bool) -> Self {
        Self {
            protocol,
            recursive,
            owner: CriticalCell::new(None),
            recursion_count: CriticalCell::new(0),
            waiters: CriticalCell::new(List::new()),
            next_owned: CriticalCell::new(None),
        }
    }

    fn task(id: TaskId) -> &'static crate::task::TaskCb<Traits> {
        &Traits::task_pool()[id.index()]
    }

    /// Priority-protect precondition (§4.5.1, this crate's own design
    /// choice — see DESIGN.md): a thread whose base priority already
    /// exceeds the ceiling may not lock a priority-protect mutex (its
    /// presence would lower, not raise, the effective priority bound the
    /// ceiling is meant to guarantee).
    fn check_ceiling(&self, caller: TaskId, tok: &CriticalTokenRefMut<'_, Traits>) -> Result<()> {
        if let Protocol::Protect { ceiling } = self.protocol {
            if *Self::task(caller).base_priority.read(&**tok) > ceiling {
                return Err(Error::Einval);
            }
        }
        Ok(())
    }

    /// Attempt to acquire under an already-held lock, without blocking.
    /// Shared by `try_lock` and the blocking variants, so a blocking call
    /// can keep one critical section open from this check through to
    /// registering inheritance and enqueuing onto `waiters` -- a separate
    /// `lock_critical()` per step would leave a gap in which a concurrent
    /// `unlock` could hand the mutex to nobody, since we aren't on the
    /// waiter list yet to receive it.
    fn try_lock_tok(
        &'static self,
        tok: &mut CriticalTokenRefMut<'_, Traits>,
        caller: TaskId,
    ) -> Result<bool> {
        self.check_ceiling(caller, tok)?;

        match *self.owner.read(&**tok) {
            None => {
                self.acquire(tok, caller);
                Ok(true)
            }
            Some(owner) if owner == caller => {
                if self.recursive {
                    let n = *self.recursion_count.read(&**tok);
                    self.recursion_count.replace(&mut **tok, n + 1);
                    Ok(true)
                } else {
                    Err(Error::Edeadlk)
                }
            }
            Some(_) => Ok(false),
        }
    }

    pub fn try_lock(&'static self) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        let caller = Traits::state()
            .current(&tok)
            .expect("try_lock called with no current task");
        if self.try_lock_tok(&mut tok, caller)? {
            Ok(())
        } else {
            Err(Error::Eagain)
        }
    }

    fn acquire(&'static self, tok: &mut CriticalTokenRefMut<'_, Traits>, caller: TaskId) {
        self.owner.replace(&mut **tok, Some(caller));
        self.recursion_count.replace(&mut **tok, 1);

        let task = Self::task(caller);
        let head = *task.owned_mutexes.read(&**tok);
        self.next_owned.replace(&mut **tok, head);
        task.owned_mutexes.replace(&mut **tok, Some(self));

        if let Protocol::Protect { ceiling } = self.protocol {
            self.boost(tok, caller, ceiling);
        }
    }

    /// Blocking lock (§4.5): blocks until acquired, a signal interrupts the
    /// wait (`EINTR`), or the mutex is found to be self-owned
    /// non-recursively (`EDEADLK`, returned immediately without blocking).
    pub fn lock(&'static self) -> Result<()> {
        loop {
            let mut lock = lock_critical::<Traits>()?;
            let mut tok = lock.borrow_mut();
            let caller = Traits::state()
                .current(&tok)
                .expect("lock called with no current task");
            if self.try_lock_tok(&mut tok, caller)? {
                return Ok(());
            }
            self.register_inheritance(&mut tok, caller);
            let id =
                Traits::state().block_enqueue(&mut tok, &self.waiters, TaskSt::BlockedOnMutex, None);
            drop(lock);
            // `release`'s transfer path already calls `acquire` (setting
            // `owner` to us) before waking us, so a `Normal` wake means we
            // already hold the mutex -- re-checking `try_lock` here would
            // see `owner == caller` and misread a successful handoff as a
            // recursive self-lock attempt.
            match Traits::state().block_resume(id) {
                crate::error::WakeReason::Normal => return Ok(()),
                other => other.into_result()?,
            }
        }
    }

    pub fn try_lock_until(&'static self, deadline: Instant) -> Result<()> {
        loop {
            let mut lock = lock_critical::<Traits>()?;
            let mut tok = lock.borrow_mut();
            let caller = Traits::state()
                .current(&tok)
                .expect("try_lock_until called with no current task");
            if self.try_lock_tok(&mut tok, caller)? {
                return Ok(());
            }
            self.register_inheritance(&mut tok, caller);
            let id = Traits::state().block_enqueue(
                &mut tok,
                &self.waiters,
                TaskSt::BlockedOnMutex,
                Some(deadline),
            );
            drop(lock);
            match Traits::state().block_resume(id) {
                crate::error::WakeReason::Normal => return Ok(()),
                other => other.into_result()?,
            }
        }
    }

    pub fn try_lock_for(&'static self, timeout: Duration) -> Result<()> {
        let deadline = Traits::state().now() + timeout;
        self.try_lock_until(deadline)
    }

    /// Register for priority inheritance before blocking: the current
    /// owner (if any) is boosted to at least our effective priority. Takes
    /// the lock already held by the caller's failed `try_lock_tok`, rather
    /// than opening a fresh critical section, so the boost and the
    /// subsequent enqueue onto `waiters` are never split from the
    /// ownership check that decided we need to block.
    fn register_inheritance(&'static self, tok: &mut CriticalTokenRefMut<'_, Traits>, caller: TaskId) {
        if let (Protocol::Inherit, Some(owner)) = (self.protocol, *self.owner.read(&**tok)) {
            let caller_pri = Self::task(caller).effective_priority(tok);
            log::trace!(
                "task {} boosts mutex owner {} toward priority {}",
                caller.index(),
                owner.index(),
                caller_pri.get()
            );
            self.boost(tok, owner, caller_pri);
        }
    }

    /// Raise `id`'s effective priority to `pri` if that's an increase, and
    /// propagate the boost to whatever it's itself blocked on (transitive
    /// priority inheritance, §4.5).
    fn boost(&self, tok: &mut CriticalTokenRefMut<'_, Traits>, id: TaskId, pri: Priority) {
        let task = Self::task(id);
        if task.effective_priority(tok) >= pri {
            return;
        }
        task.effective_priority.replace(&mut **tok, pri);

        match task.state(tok) {
            TaskSt::Runnable => {
                let mut ready = Traits::state().ready_list().replace(&mut **tok, List::new());
                ready.reorder::<Traits>(tok, id);
                Traits::state().ready_list().replace(&mut **tok, ready);
            }
            st if st.is_blocked() => {
                if let Some(list) = *task.wait_list.read(&**tok) {
                    let mut waiters = list.replace(&mut **tok, List::new());
                    waiters.reorder::<Traits>(tok, id);
                    list.replace(&mut **tok, waiters);
                }
                // Nested inheritance (id itself blocked on another mutex)
                // is picked up when that mutex's owner next releases or
                // boosts, via `recompute_owner_priority` walking the
                // waiter lists of everything it owns; we don't recurse
                // through arbitrary wait chains here.
            }
            _ => {}
        }
    }

    /// Recompute the owner's effective priority from scratch: its base
    /// priority, the priority-protect ceiling (if any, while still owning
    /// this mutex), and the highest-priority remaining waiter across all
    /// mutexes it still owns.
    fn recompute_owner_priority(tok: &mut CriticalTokenRefMut<'_, Traits>, id: TaskId) {
        let task = Self::task(id);
        let mut pri = *task.base_priority.read(&**tok);

        let mut cursor = *task.owned_mutexes.read(&**tok);
        while let Some(m) = cursor {
            if let Protocol::Protect { ceiling } = m.protocol {
                if ceiling > pri {
                    pri = ceiling;
                }
            }
            let waiters = m.waiters.read(&**tok);
            if let Some(front) = waiters.front() {
                let wp = Self::task(front).effective_priority(tok);
                if wp > pri {
                    pri = wp;
                }
            }
            cursor = *m.next_owned.read(&**tok);
        }

        if pri != task.effective_priority(tok) {
            task.effective_priority.replace(&mut **tok, pri);
            if task.state(tok) == TaskSt::Runnable {
                let mut ready = Traits::state().ready_list().replace(&mut **tok, List::new());
                ready.reorder::<Traits>(tok, id);
                Traits::state().ready_list().replace(&mut **tok, ready);
            }
        }
    }

    /// `unlock` (§4.5): release ownership (decrementing the recursion count
    /// first), drop any inherited/protected boost, and hand ownership to
    /// the highest-priority waiter, if any. `EPERM` if the caller doesn't
    /// own the mutex.
    pub fn unlock(&'static self) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        let caller = Traits::state()
            .current(&tok)
            .expect("unlock called with no current task");
        self.unlock_tok(&mut tok, caller)
    }

    /// `unlock` under a lock the caller already holds (§4.6: condition
    /// variables must unlock their mutex, enqueue on the wait list, and
    /// block in one uninterrupted critical section, or a `notify` from
    /// interrupt context landing between the unlock and the enqueue would
    /// be lost).
    pub(crate) fn unlock_tok(
        &'static self,
        tok: &mut CriticalTokenRefMut<'_, Traits>,
        caller: TaskId,
    ) -> Result<()> {
        if *self.owner.read(&**tok) != Some(caller) {
            return Err(Error::Eperm);
        }
        let n = *self.recursion_count.read(&**tok);
        if n > 1 {
            self.recursion_count.replace(&mut **tok, n - 1);
            return Ok(());
        }
        self.release(tok, caller);
        Ok(())
    }

    fn release(&'static self, tok: &mut CriticalTokenRefMut<'_, Traits>, caller: TaskId) {
        self.unlink_from_owner(tok, caller);
        self.owner.replace(&mut **tok, None);
        self.recursion_count.replace(&mut **tok, 0);
        Self::recompute_owner_priority(tok, caller);

        let mut waiters = self.waiters.replace(&mut **tok, List::new());
        if let Some(next) = waiters.pop_front::<Traits>(tok) {
            self.waiters.replace(&mut **tok, waiters);
            self.acquire(tok, next);
            Traits::state().unblock(tok, &self.waiters, next, crate::error::WakeReason::Normal);
        } else {
            self.waiters.replace(&mut **tok, waiters);
        }
    }

    fn unlink_from_owner(&self, tok: &mut CriticalTokenRefMut<'_, Traits>, owner: TaskId) {
        let task = Self::task(owner);
        let mut cursor = *task.owned_mutexes.read(&**tok);
        let mut prev: Option<&'static MutexCb<Traits>> = None;
        while let Some(m) = cursor {
            let next = *m.next_owned.read(&**tok);
            if core::ptr::eq(m, self) {
                match prev {
                    Some(p) => p.next_owned.replace(&mut **tok, next),
                    None => task.owned_mutexes.replace(&mut **tok, next),
                };
                self.next_owned.replace(&mut **tok, None);
                return;
            }
            prev = Some(m);
            cursor = next;
        }
    }

    /// Called from `Scheduler::remove`'s exit hook (§4.5.2, restored from
    /// distortos): release every mutex `id` still owns, waking the next
    /// waiter on each as if `unlock` had been called, regardless of
    /// recursion depth.
    pub(crate) fn abandon_all(tok: &mut CriticalTokenRefMut<'_, Traits>, id: TaskId) {
        let task = Self::task(id);
        while let Some(m) = *task.owned_mutexes.read(&**tok) {
            m.release(tok, id);
        }
    }

    pub fn is_locked(&'static self) -> Result<bool> {
        let mut lock = lock_critical::<Traits>()?;
        let tok = lock.borrow_mut();
        Ok(self.owner.read(&*tok).is_some())
    }
}
