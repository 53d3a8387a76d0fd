//! Counting semaphore (C6)
//!
//! Grounded on the teacher's `semaphore.rs`: a count plus a priority-ordered
//! waiter list, posted under the critical section and capped at a maximum
//! value (`EOVERFLOW` on a `post` that would exceed it, §4.4 edge case).
use crate::{
    error::{Error, Result},
    klock::{lock_critical, CriticalCell, CriticalTokenRefMut},
    kernel_traits::KernelTraits,
    list::List,
    task::TaskSt,
    time::{Duration, Instant},
};

/// *Semaphore control block* (C6). `'static` instances are declared by the
/// application (or embedded in a [`crate::task::TaskCb`] for the join
/// semaphore) and passed to [`System`](crate::kernel_traits::System) calls.
pub struct SemaphoreCb<Traits: KernelTraits> {
    count: CriticalCell<Traits, u32>,
    max: u32,
    waiters: CriticalCell<Traits, List>,
}

unsafe impl<Traits: KernelTraits> Sync for SemaphoreCb<Traits> {}

impl<Traits: KernelTraits> SemaphoreCb<Traits> {
    /// `max`: the ceiling `post` may not exceed (`None` means
    /// [`u32::MAX`], i.e. effectively unbounded).
    pub const fn new(initial_count: u32, max: Option<u32>) -> Self {
        Self {
            count: CriticalCell::new(initial_count),
            max: match max {
                Some(m) => m,
                None => u32::MAX,
            },
            waiters: CriticalCell::new(List::new()),
        }
    }

    /// Take a unit if the count is nonzero, under an already-held lock.
    /// Shared by `try_wait` and the blocking variants, so a blocking call
    /// can keep the same critical section open from this check through to
    /// enqueuing onto `waiters` -- otherwise a `post` from interrupt context
    /// could land in the gap between a failed check and the enqueue and be
    /// missed entirely (this semaphore hands posted units directly to a
    /// waiter; there's no later nonzero count for a retry to observe).
    fn try_take(&self, tok: &mut CriticalTokenRefMut<'_, Traits>) -> bool {
        let count = *self.count.read(&**tok);
        if count == 0 {
            return false;
        }
        self.count.replace(&mut **tok, count - 1);
        true
    }

    /// Non-blocking acquire. `EAGAIN` if the count is currently zero.
    pub fn try_wait(&'static self) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        if self.try_take(&mut tok) {
            Ok(())
        } else {
            Err(Error::Eagain)
        }
    }

    /// Blocking acquire (§4.4): blocks until the count is nonzero, a signal
    /// interrupts the wait (`EINTR`), or (via
    /// [`try_wait_until`](Self::try_wait_until)) a deadline elapses
    /// (`ETIMEDOUT`).
    pub fn wait(&'static self) -> Result<()> {
        loop {
            let mut lock = lock_critical::<Traits>()?;
            let mut tok = lock.borrow_mut();
            if self.try_take(&mut tok) {
                return Ok(());
            }
            let id = Traits::state().block_enqueue(
                &mut tok,
                &self.waiters,
                TaskSt::BlockedOnSemaphore,
                None,
            );
            drop(lock);
            // A `Normal` wake means `post` handed this unit straight to us
            // without touching `count` (see `post`'s doc comment) -- the
            // wait is already satisfied, and re-checking `try_take` would
            // find nothing to take and incorrectly re-block us.
            match Traits::state().block_resume(id) {
                crate::error::WakeReason::Normal => return Ok(()),
                other => other.into_result()?,
            }
        }
    }

    /// Blocking acquire with a deadline (§4.4).
    pub fn try_wait_until(&'static self, deadline: Instant) -> Result<()> {
        loop {
            let mut lock = lock_critical::<Traits>()?;
            let mut tok = lock.borrow_mut();
            if self.try_take(&mut tok) {
                return Ok(());
            }
            let id = Traits::state().block_enqueue(
                &mut tok,
                &self.waiters,
                TaskSt::BlockedOnSemaphore,
                Some(deadline),
            );
            drop(lock);
            match Traits::state().block_resume(id) {
                crate::error::WakeReason::Normal => return Ok(()),
                other => other.into_result()?,
            }
        }
    }

    pub fn try_wait_for(&'static self, timeout: Duration) -> Result<()> {
        let deadline = Traits::state().now() + timeout;
        self.try_wait_until(deadline)
    }

    /// `post` (§4.4): increment the count and wake the highest-priority
    /// waiter, if any (handing the freshly posted unit straight to it
    /// rather than leaving a transient nonzero count). `EOVERFLOW` if
    /// `count == max`.
    pub fn post(&'static self) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        let count = *self.count.read(&*tok);
        if count >= self.max {
            return Err(Error::Eoverflow);
        }

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
                self.count.replace(&mut *tok, count + 1);
            }
        }
        Ok(())
    }

    pub fn count(&'static self) -> Result<u32> {
        let mut lock = lock_critical::<Traits>()?;
        let tok = lock.borrow_mut();
        Ok(*self.count.read(&*tok))
    }

    /// Exposes the waiter list so `TaskCb::join_sem` can double as the
    /// dedicated join-waiter list for `Scheduler::join`/`exit` (§4.3.1)
    /// without duplicating a second `List` field on every `TaskCb`. Join
    /// never uses this semaphore's `count`/`post`/`wait` -- termination
    /// wakes every queued joiner directly, which the counting transfer
    /// semantics above can't express (`post` hands its unit to exactly one
    /// waiter; a terminating task must wake *all* of them).
    pub(crate) fn waiters(&self) -> &CriticalCell<Traits, List> {
        &self.waiters
    }
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end alongside the hosted test port in
    // `tests/scenarios.rs`; a semaphore cannot be driven meaningfully
    // without a running scheduler.
}
