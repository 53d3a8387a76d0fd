//! Condition variable (C8)
//!
//! Grounded on the teacher's `wait.rs` `WaitQueue` and POSIX
//! `pthread_cond_t` semantics (§4.6): `wait` atomically unlocks the
//! associated mutex and blocks, re-locking it before returning, exactly
//! once, regardless of whether the wakeup was a notify, a signal, or a
//! timeout.
use crate::{
    error::Result,
    klock::{lock_critical, CriticalCell},
    kernel_traits::KernelTraits,
    list::List,
    mutex::MutexCb,
    task::TaskSt,
    time::{Duration, Instant},
};

/// *Condition variable control block* (C8).
pub struct CondVarCb<Traits: KernelTraits> {
    waiters: CriticalCell<Traits, List>,
}

unsafe impl<Traits: KernelTraits> Sync for CondVarCb<Traits> {}

impl<Traits: KernelTraits> CondVarCb<Traits> {
    pub const fn new() -> Self {
        Self {
            waiters: CriticalCell::new(List::new()),
        }
    }

    /// `wait` (§4.6): unlock `mutex`, block until notified/interrupted,
    /// then re-lock `mutex` before returning — even on an error path, so
    /// the caller's lock/unlock nesting is always balanced.
    ///
    /// The unlock, the enqueue onto `waiters`, and giving up `current` all
    /// happen under one critical section (via `unlock_tok`/`block_enqueue`)
    /// rather than as separate `lock_critical()` calls -- otherwise a
    /// `notify` landing between the unlock and the enqueue would wake
    /// nobody, since this task wouldn't be on `waiters` yet to receive it.
    pub fn wait(&'static self, mutex: &'static MutexCb<Traits>) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        let caller = Traits::state()
            .current(&tok)
            .expect("wait called with no current task");
        mutex.unlock_tok(&mut tok, caller)?;
        let id = Traits::state().block_enqueue(
            &mut tok,
            &self.waiters,
            TaskSt::BlockedOnConditionVariable,
            None,
        );
        drop(lock);
        let result = Traits::state().block_resume(id).into_result();
        mutex.lock()?;
        result
    }

    pub fn wait_until(
        &'static self,
        mutex: &'static MutexCb<Traits>,
        deadline: Instant,
    ) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        let caller = Traits::state()
            .current(&tok)
            .expect("wait_until called with no current task");
        mutex.unlock_tok(&mut tok, caller)?;
        let id = Traits::state().block_enqueue(
            &mut tok,
            &self.waiters,
            TaskSt::BlockedOnConditionVariable,
            Some(deadline),
        );
        drop(lock);
        let result = Traits::state().block_resume(id).into_result();
        mutex.lock()?;
        result
    }

    pub fn wait_for(&'static self, mutex: &'static MutexCb<Traits>, timeout: Duration) -> Result<()> {
        let deadline = Traits::state().now() + timeout;
        self.wait_until(mutex, deadline)
    }

    /// `notify_one` (§4.6): wake the highest-priority waiter, if any.
    pub fn notify_one(&'static self) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        let mut waiters = self.waiters.replace(&mut *tok, List::new());
        if let Some(front) = waiters.pop_front::<Traits>(&mut tok) {
            self.waiters.replace(&mut *tok, waiters);
            Traits::state().unblock(&mut tok, &self.waiters, front, crate::error::WakeReason::Normal);
        } else {
            self.waiters.replace(&mut *tok, waiters);
        }
        Ok(())
    }

    /// `notify_all` (§4.6): wake every waiter, highest priority first.
    pub fn notify_all(&'static self) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        loop {
            let mut waiters = self.waiters.replace(&mut *tok, List::new());
            match waiters.pop_front::<Traits>(&mut tok) {
                Some(front) => {
                    self.waiters.replace(&mut *tok, waiters);
                    Traits::state().unblock(
                        &mut tok,
                        &self.waiters,
                        front,
                        crate::error::WakeReason::Normal,
                    );
                }
                None => {
                    self.waiters.replace(&mut *tok, waiters);
                    break;
                }
            }
        }
        Ok(())
    }
}

impl<Traits: KernelTraits> Default for CondVarCb<Traits> {
    fn default() -> Self {
        Self::new()
    }
}
