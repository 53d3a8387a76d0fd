//! Fixed-capacity message queue (C9)
//!
//! Grounded on the teacher's bounded-capacity-via-const-generic pattern and
//! `arrayvec::ArrayVec` for the backing storage (no heap allocation, §Non-
//! goals). Two priority-ordered waiter lists — one for senders blocked on a
//! full queue, one for receivers blocked on an empty one — mirror the
//! semaphore's single waiter list (§4.7). The filled buffer itself is also
//! priority-ordered (highest message priority first, FIFO among ties),
//! per §4.7's "inserted into the filled-list at its priority" / "pulls the
//! front of the filled-list (highest priority, oldest among ties)" -- the
//! insertion scan mirrors `list.rs`'s "first strictly lower priority"
//! placement rule, just over a flat buffer instead of an intrusive list
//! since messages aren't independently addressable nodes.
use arrayvec::ArrayVec;

use crate::{
    error::{Error, Result},
    klock::{lock_critical, CriticalCell, CriticalTokenRefMut},
    kernel_traits::KernelTraits,
    list::List,
    task::TaskSt,
    time::{Duration, Instant},
};

struct Entry<T> {
    priority: u8,
    msg: T,
}

/// *Message queue control block* (C9). `N` is the fixed capacity in
/// messages, set at the type level so no dynamic allocation is required.
/// `T` plays the role of the original's fixed-size byte payload; unlike the
/// distortos original this queue is not validated against a byte length at
/// runtime (`EMSGSIZE` accordingly never occurs here -- enforced instead at
/// compile time by `T` itself, same simplification the teacher's own typed
/// channels make over the original's raw-byte queues).
pub struct MessageQueueCb<Traits: KernelTraits, T, const N: usize> {
    buf: CriticalCell<Traits, ArrayVec<Entry<T>, N>>,
    push_waiters: CriticalCell<Traits, List>,
    pop_waiters: CriticalCell<Traits, List>,
}

unsafe impl<Traits: KernelTraits, T: Send, const N: usize> Sync for MessageQueueCb<Traits, T, N> {}

impl<Traits: KernelTraits, T, const N: usize> MessageQueueCb<Traits, T, N> {
    pub const fn new() -> Self {
        Self {
            buf: CriticalCell::new(ArrayVec::new_const()),
            push_waiters: CriticalCell::new(List::new()),
            pop_waiters: CriticalCell::new(List::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Non-blocking send at `priority` (higher sorts first; ties break
    /// FIFO). `EAGAIN` if the queue is full.
    pub fn try_send(&'static self, priority: u8, msg: T) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        let mut slot = Some(msg);
        if self.try_send_slot(&mut tok, priority, &mut slot) {
            Ok(())
        } else {
            Err(Error::Eagain)
        }
    }

    /// As [`try_send`](Self::try_send), but leaves `slot` holding the
    /// message on failure instead of dropping it, so blocking callers can
    /// retry the same value after waking up. Takes the lock already held by
    /// the caller, so the blocking variants can keep it open through the
    /// subsequent enqueue onto `push_waiters` -- a `pop` from interrupt
    /// context landing in a gap between a failed check here and a
    /// separately-opened block would free a slot nobody still waiting would
    /// ever be told about.
    fn try_send_slot(
        &'static self,
        tok: &mut CriticalTokenRefMut<'_, Traits>,
        priority: u8,
        slot: &mut Option<T>,
    ) -> bool {
        let mut buf = self.buf.replace(&mut **tok, ArrayVec::new_const());
        if buf.is_full() {
            self.buf.replace(&mut **tok, buf);
            return false;
        }
        let pos = buf
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(buf.len());
        buf.insert(
            pos,
            Entry {
                priority,
                msg: slot.take().expect("try_send_slot called with an empty slot"),
            },
        );
        self.buf.replace(&mut **tok, buf);

        let mut waiters = self.pop_waiters.replace(&mut **tok, List::new());
        if let Some(front) = waiters.pop_front::<Traits>(tok) {
            self.pop_waiters.replace(&mut **tok, waiters);
            Traits::state().unblock(
                tok,
                &self.pop_waiters,
                front,
                crate::error::WakeReason::Normal,
            );
        } else {
            self.pop_waiters.replace(&mut **tok, waiters);
        }
        true
    }

    pub fn send(&'static self, priority: u8, msg: T) -> Result<()> {
        let mut slot = Some(msg);
        loop {
            let mut lock = lock_critical::<Traits>()?;
            let mut tok = lock.borrow_mut();
            if self.try_send_slot(&mut tok, priority, &mut slot) {
                return Ok(());
            }
            let id = Traits::state().block_enqueue(
                &mut tok,
                &self.push_waiters,
                TaskSt::BlockedOnMessageQueueFull,
                None,
            );
            drop(lock);
            Traits::state().block_resume(id).into_result()?;
        }
    }

    pub fn try_send_until(&'static self, priority: u8, msg: T, deadline: Instant) -> Result<()> {
        let mut slot = Some(msg);
        loop {
            let mut lock = lock_critical::<Traits>()?;
            let mut tok = lock.borrow_mut();
            if self.try_send_slot(&mut tok, priority, &mut slot) {
                return Ok(());
            }
            let id = Traits::state().block_enqueue(
                &mut tok,
                &self.push_waiters,
                TaskSt::BlockedOnMessageQueueFull,
                Some(deadline),
            );
            drop(lock);
            Traits::state().block_resume(id).into_result()?;
        }
    }

    pub fn try_send_for(&'static self, priority: u8, msg: T, timeout: Duration) -> Result<()> {
        let deadline = Traits::state().now() + timeout;
        self.try_send_until(priority, msg, deadline)
    }

    /// Non-blocking receive. Returns the highest-priority queued message
    /// (oldest among ties) and its priority. `EAGAIN` if the queue is
    /// empty.
    pub fn try_recv(&'static self) -> Result<(u8, T)> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        self.try_recv_tok(&mut tok).ok_or(Error::Eagain)
    }

    /// Takes the lock already held by the caller, mirroring
    /// [`try_send_slot`](Self::try_send_slot): the blocking variants keep
    /// one critical section open from this check through to the enqueue
    /// onto `pop_waiters`.
    fn try_recv_tok(&'static self, tok: &mut CriticalTokenRefMut<'_, Traits>) -> Option<(u8, T)> {
        let mut buf = self.buf.replace(&mut **tok, ArrayVec::new_const());
        if buf.is_empty() {
            self.buf.replace(&mut **tok, buf);
            return None;
        }
        let entry = buf.remove(0);
        self.buf.replace(&mut **tok, buf);

        let mut waiters = self.push_waiters.replace(&mut **tok, List::new());
        if let Some(front) = waiters.pop_front::<Traits>(tok) {
            self.push_waiters.replace(&mut **tok, waiters);
            Traits::state().unblock(
                tok,
                &self.push_waiters,
                front,
                crate::error::WakeReason::Normal,
            );
        } else {
            self.push_waiters.replace(&mut **tok, waiters);
        }
        Some((entry.priority, entry.msg))
    }

    pub fn recv(&'static self) -> Result<(u8, T)> {
        loop {
            let mut lock = lock_critical::<Traits>()?;
            let mut tok = lock.borrow_mut();
            if let Some(entry) = self.try_recv_tok(&mut tok) {
                return Ok(entry);
            }
            let id = Traits::state().block_enqueue(
                &mut tok,
                &self.pop_waiters,
                TaskSt::BlockedOnMessageQueueEmpty,
                None,
            );
            drop(lock);
            Traits::state().block_resume(id).into_result()?;
        }
    }

    pub fn try_recv_until(&'static self, deadline: Instant) -> Result<(u8, T)> {
        loop {
            let mut lock = lock_critical::<Traits>()?;
            let mut tok = lock.borrow_mut();
            if let Some(entry) = self.try_recv_tok(&mut tok) {
                return Ok(entry);
            }
            let id = Traits::state().block_enqueue(
                &mut tok,
                &self.pop_waiters,
                TaskSt::BlockedOnMessageQueueEmpty,
                Some(deadline),
            );
            drop(lock);
            Traits::state().block_resume(id).into_result()?;
        }
    }

    pub fn try_recv_for(&'static self, timeout: Duration) -> Result<(u8, T)> {
        let deadline = Traits::state().now() + timeout;
        self.try_recv_until(deadline)
    }

    pub fn len(&'static self) -> Result<usize> {
        let mut lock = lock_critical::<Traits>()?;
        let tok = lock.borrow_mut();
        Ok(self.buf.read(&*tok).len())
    }

    pub fn is_empty(&'static self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl<Traits: KernelTraits, T, const N: usize> Default for MessageQueueCb<Traits, T, N> {
    fn default() -> Self {
        Self::new()
    }
}
