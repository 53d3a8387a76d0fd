//! POSIX-style signals (C11)
//!
//! Grounded on the distortos original's `signals` subsystem (restored via
//! `original_source/`, §4.9): a 32-bit pending set plus a small bounded ring
//! of queued `SigInfo` values for signals raised with an attached payload.
//! `wait`/`try_wait` consume matching pending signals directly; if no task
//! is blocked in `wait` when a signal arrives and the receiver has a
//! registered handler, delivery is deferred to the owning task's next
//! resumption via [`Port::request_function_execution`], mirroring how a
//! POSIX signal handler runs on the interrupted thread's own stack.
use crate::{
    error::{Error, Result},
    klock::{lock_critical, CriticalCell, CriticalTokenRefMut},
    kernel_traits::KernelTraits,
    list::List,
    task::{TaskCb, TaskId, TaskSt},
    time::{Duration, Instant},
};

pub const MAX_SIGNAL: u32 = 31;

/// A 32-bit signal set, one bit per signal number 0..=31.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSet(u32);

impl SignalSet {
    pub const EMPTY: SignalSet = SignalSet(0);

    pub const fn single(signal: u32) -> Self {
        SignalSet(1 << signal)
    }

    pub const fn contains(self, other: SignalSet) -> bool {
        self.0 & other.0 == other.0
    }

    const fn intersects(self, other: SignalSet) -> bool {
        self.0 & other.0 != 0
    }

    const fn union(self, other: SignalSet) -> Self {
        SignalSet(self.0 | other.0)
    }

    const fn minus(self, other: SignalSet) -> Self {
        SignalSet(self.0 & !other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for SignalSet {
    type Output = SignalSet;
    fn bitor(self, rhs: SignalSet) -> SignalSet {
        self.union(rhs)
    }
}

/// An optional payload attached to a raised signal (§4.9).
#[derive(Debug, Clone, Copy)]
pub struct SigInfo {
    pub signal: u32,
    pub value: i32,
}

const MAX_QUEUED: usize = 8;

/// *Signal receiver* (C11): the per-task object `raise`/`wait` operate on.
/// Embedded as `Some(&'static SignalsReceiver<Traits>)` in a [`TaskCb`] that
/// wants to receive signals.
pub struct SignalsReceiver<Traits: KernelTraits> {
    owner: TaskId,
    pending: CriticalCell<Traits, SignalSet>,
    queued: CriticalCell<Traits, arrayvec::ArrayVec<SigInfo, MAX_QUEUED>>,
    handler: CriticalCell<Traits, Option<fn(u32)>>,
    waiters: CriticalCell<Traits, List>,
    wait_mask: CriticalCell<Traits, SignalSet>,
}

unsafe impl<Traits: KernelTraits> Sync for SignalsReceiver<Traits> {}

impl<Traits: KernelTraits> SignalsReceiver<Traits> {
    pub const fn new(owner: TaskId) -> Self {
        Self {
            owner,
            pending: CriticalCell::new(SignalSet::EMPTY),
            queued: CriticalCell::new(arrayvec::ArrayVec::new_const()),
            handler: CriticalCell::new(None),
            waiters: CriticalCell::new(List::new()),
            wait_mask: CriticalCell::new(SignalSet::EMPTY),
        }
    }

    /// Register a handler invoked (via the port's deferred-execution hook)
    /// when a signal arrives while no one is blocked in [`wait`](Self::wait).
    pub fn set_handler(&'static self, handler: Option<fn(u32)>) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        self.handler.replace(&mut *tok, handler);
        Ok(())
    }

    fn task(&self) -> &'static TaskCb<Traits> {
        &Traits::task_pool()[self.owner.index()]
    }

    /// `raise` (§4.9): set `signal` pending, waking a matching waiter if
    /// one exists, else deferring to the registered handler.
    pub fn raise(&'static self, signal: u32) -> Result<()> {
        self.raise_inner(signal, None)
    }

    /// `raise` with an attached payload (§4.9): `ENOMEM` if the
    /// queued-siginfo ring is already full.
    pub fn raise_queued(&'static self, signal: u32, value: i32) -> Result<()> {
        self.raise_inner(signal, Some(value))
    }

    fn raise_inner(&'static self, signal: u32, value: Option<i32>) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();

        if let Some(value) = value {
            let mut queued = self.queued.replace(&mut *tok, arrayvec::ArrayVec::new_const());
            if queued.try_push(SigInfo { signal, value }).is_err() {
                self.queued.replace(&mut *tok, queued);
                return Err(Error::Enomem);
            }
            self.queued.replace(&mut *tok, queued);
        }

        let set = SignalSet::single(signal);
        let pending = self.pending.read(&*tok).union(set);
        self.pending.replace(&mut *tok, pending);

        let mask = *self.wait_mask.read(&*tok);
        let waiting = pending.intersects(mask) && !self.waiters.read(&*tok).is_empty();

        if waiting {
            let mut waiters = self.waiters.replace(&mut *tok, List::new());
            let front = waiters
                .pop_front::<Traits>(&mut tok)
                .expect("waiting was just confirmed non-empty");
            self.waiters.replace(&mut *tok, waiters);
            Traits::state().unblock(
                &mut tok,
                &self.waiters,
                front,
                crate::error::WakeReason::Signal,
            );
        } else if self.handler.read(&*tok).is_some() {
            // §4.9: "a blocked thread receiving a non-waited signal with a
            // handler installed transitions to Runnable with reason EINTR" --
            // whatever primitive it's blocked on (semaphore, mutex, condvar,
            // queue, sleep; anything but this receiver's own `wait`, already
            // handled above), not just a signal-specific wait.
            let owner = self.task();
            if owner.state(&tok).is_blocked() {
                if let Some(list) = *owner.wait_list.read(&*tok) {
                    Traits::state().unblock(
                        &mut tok,
                        list,
                        self.owner,
                        crate::error::WakeReason::Signal,
                    );
                }
            }
            Traits::request_function_execution(self.task(), trampoline::<Traits>);
        }
        Ok(())
    }

    /// Consume and return whichever signals in `mask` are currently
    /// pending, under an already-held lock. Shared by `try_wait` and the
    /// blocking variants, so a blocking call can keep one critical section
    /// open from this check through to arming `wait_mask` and enqueuing
    /// onto `waiters` -- otherwise a `raise` from interrupt context landing
    /// in between would find nobody waiting yet, leave the signal merely
    /// pending, and this task would then block with no later event to wake
    /// it back up.
    fn try_wait_tok(
        &'static self,
        tok: &mut CriticalTokenRefMut<'_, Traits>,
        mask: SignalSet,
    ) -> Option<SignalSet> {
        let pending = *self.pending.read(&**tok);
        let hit = SignalSet(pending.0 & mask.0);
        if hit.is_empty() {
            return None;
        }
        self.pending.replace(&mut **tok, pending.minus(hit));
        Some(hit)
    }

    /// Non-blocking: consume and return whichever signals in `mask` are
    /// currently pending, or `EAGAIN` if none are.
    pub fn try_wait(&'static self, mask: SignalSet) -> Result<SignalSet> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        self.try_wait_tok(&mut tok, mask).ok_or(Error::Eagain)
    }

    /// Blocking wait (§4.9): blocks until a signal in `mask` is pending or
    /// delivered, or until interrupted/timed out via the `_until`/`_for`
    /// variants.
    pub fn wait(&'static self, mask: SignalSet) -> Result<SignalSet> {
        loop {
            let mut lock = lock_critical::<Traits>()?;
            let mut tok = lock.borrow_mut();
            if let Some(set) = self.try_wait_tok(&mut tok, mask) {
                return Ok(set);
            }
            self.wait_mask.replace(&mut *tok, mask);
            let id = Traits::state().block_enqueue(
                &mut tok,
                &self.waiters,
                TaskSt::BlockedOnSignalWait,
                None,
            );
            drop(lock);
            Traits::state().block_resume(id).into_result()?;
        }
    }

    pub fn wait_until(&'static self, mask: SignalSet, deadline: Instant) -> Result<SignalSet> {
        loop {
            let mut lock = lock_critical::<Traits>()?;
            let mut tok = lock.borrow_mut();
            if let Some(set) = self.try_wait_tok(&mut tok, mask) {
                return Ok(set);
            }
            self.wait_mask.replace(&mut *tok, mask);
            let id = Traits::state().block_enqueue(
                &mut tok,
                &self.waiters,
                TaskSt::BlockedOnSignalWait,
                Some(deadline),
            );
            drop(lock);
            Traits::state().block_resume(id).into_result()?;
        }
    }

    pub fn wait_for(&'static self, mask: SignalSet, timeout: Duration) -> Result<SignalSet> {
        let deadline = Traits::state().now() + timeout;
        self.wait_until(mask, deadline)
    }

    /// Pop the next queued [`SigInfo`] for an already-consumed pending
    /// signal, if the raise that set it attached a payload.
    pub fn try_recv_info(&'static self) -> Result<Option<SigInfo>> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        let mut queued = self.queued.replace(&mut *tok, arrayvec::ArrayVec::new_const());
        let info = if queued.is_empty() { None } else { Some(queued.remove(0)) };
        self.queued.replace(&mut *tok, queued);
        Ok(info)
    }
}

/// The function passed to [`Port::request_function_execution`]: runs the
/// receiver's registered handler for every signal still pending, on the
/// target task's own stack.
fn trampoline<Traits: KernelTraits>(task: &'static TaskCb<Traits>) {
    let Some(receiver) = task.signals else {
        return;
    };
    loop {
        let (pending, handler) = {
            let Ok(mut lock) = lock_critical::<Traits>() else {
                return;
            };
            let mut tok = lock.borrow_mut();
            let pending = *receiver.pending.read(&*tok);
            let handler = *receiver.handler.read(&*tok);
            receiver.pending.replace(&mut *tok, SignalSet::EMPTY);
            (pending, handler)
        };
        let Some(handler) = handler else { return };
        if pending.is_empty() {
            return;
        }
        for signal in 0..=MAX_SIGNAL {
            if pending.intersects(SignalSet::single(signal)) {
                handler(signal);
            }
        }
    }
}
