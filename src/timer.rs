//! Software timer (C10)
//!
//! Grounded on the teacher's `utils::binary_heap`-backed timer queue and the
//! distortos original's `SoftwareTimer`: a fixed-capacity min-heap of
//! `'static` timer instances keyed by next-fire time, drained from the tick
//! hook. Periodic timers realign to the current tick on overrun (§4.8, S5)
//! rather than firing a burst of catch-up callbacks.
use crate::{
    error::{Error, Result},
    klock::{lock_critical, CriticalCell, CriticalTokenRefMut},
    kernel_traits::KernelTraits,
    sched::Scheduler,
    time::{Duration, Instant},
    utils::binary_heap::BinaryHeap,
};

/// *Software timer control block* (C10). `'static` instances are declared
/// by the application, analogous to [`crate::sem::SemaphoreCb`].
pub struct TimerCb<Traits: KernelTraits> {
    callback: fn(usize),
    arg: usize,
    period: Option<Duration>,
    state: CriticalCell<Traits, TimerState>,
}

#[derive(Debug, Clone, Copy)]
struct TimerState {
    active: bool,
    next_fire: Instant,
}

unsafe impl<Traits: KernelTraits> Sync for TimerCb<Traits> {}

impl<Traits: KernelTraits> TimerCb<Traits> {
    /// `period`: `None` for a one-shot timer, `Some(d)` for a periodic one
    /// that reschedules itself every `d` ticks after firing.
    pub const fn new(callback: fn(usize), arg: usize, period: Option<Duration>) -> Self {
        Self {
            callback,
            arg,
            period,
            state: CriticalCell::new(TimerState {
                active: false,
                next_fire: Instant::ZERO,
            }),
        }
    }

    /// `start` (§4.8): (re)arm the timer to first fire `delay` ticks from
    /// now. `ENOMEM` if the scheduler's timer heap is already full.
    pub fn start(&'static self, delay: Duration) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        let sched = Traits::state();
        let now = sched.now();

        let mut state = *self.state.read(&*tok);
        if state.active {
            self.unlink(&mut tok, sched);
        }
        state.active = true;
        state.next_fire = now + delay;
        self.state.replace(&mut *tok, state);

        let mut heap = sched.timers().replace(&mut *tok, TimerHeap::new());
        let res = heap.0.heap_push(self, |a, b| {
            a.state.read(&*tok).next_fire < b.state.read(&*tok).next_fire
        });
        sched.timers().replace(&mut *tok, heap);

        if res.is_err() {
            let mut state = *self.state.read(&*tok);
            state.active = false;
            self.state.replace(&mut *tok, state);
            return Err(Error::Enomem);
        }
        Ok(())
    }

    /// `stop` (§4.8): disarm the timer. A no-op if it isn't armed.
    pub fn stop(&'static self) -> Result<()> {
        let mut lock = lock_critical::<Traits>()?;
        let mut tok = lock.borrow_mut();
        let sched = Traits::state();
        if self.state.read(&*tok).active {
            self.unlink(&mut tok, sched);
            let mut state = *self.state.read(&*tok);
            state.active = false;
            self.state.replace(&mut *tok, state);
        }
        Ok(())
    }

    pub fn is_active(&'static self) -> Result<bool> {
        let mut lock = lock_critical::<Traits>()?;
        let tok = lock.borrow_mut();
        Ok(self.state.read(&*tok).active)
    }

    fn unlink<const NTIMERS: usize>(
        &'static self,
        tok: &mut CriticalTokenRefMut<'_, Traits>,
        sched: &'static Scheduler<Traits, NTIMERS>,
    ) {
        let mut heap = sched.timers().replace(&mut **tok, TimerHeap::new());
        heap.0.heap_remove_where(
            |t: &&'static TimerCb<Traits>| core::ptr::eq(*t, self),
            |a, b| a.state.read(&**tok).next_fire < b.state.read(&**tok).next_fire,
        );
        sched.timers().replace(&mut **tok, heap);
    }
}

/// The scheduler's timer min-heap, ordered by [`TimerCb`]'s next-fire
/// instant. `NTIMERS` bounds how many timers may be simultaneously armed
/// (§4.12 configuration surface).
pub(crate) struct TimerHeap<Traits: KernelTraits, const NTIMERS: usize>(
    BinaryHeap<&'static TimerCb<Traits>, NTIMERS>,
);

impl<Traits: KernelTraits, const NTIMERS: usize> TimerHeap<Traits, NTIMERS> {
    pub(crate) const fn new() -> Self {
        Self(BinaryHeap::new())
    }
}

/// Called from `Scheduler::tick_hook` (§4.3, §4.8): fire every timer whose
/// deadline has elapsed, in deadline order, rescheduling periodic ones.
pub(crate) fn drain_due<Traits: KernelTraits, const NTIMERS: usize>(
    sched: &'static Scheduler<Traits, NTIMERS>,
    tok: &mut CriticalTokenRefMut<'_, Traits>,
    now: Instant,
) {
    loop {
        let mut heap = sched.timers().replace(&mut **tok, TimerHeap::new());
        let due = matches!(heap.0.peek(), Some(t) if t.state.read(&**tok).next_fire <= now);
        if !due {
            sched.timers().replace(&mut **tok, heap);
            break;
        }
        let timer = heap
            .0
            .heap_pop(|a, b| a.state.read(&**tok).next_fire < b.state.read(&**tok).next_fire)
            .expect("peek confirmed a due timer is present");
        sched.timers().replace(&mut **tok, heap);

        let mut state = *timer.state.read(&**tok);
        match timer.period {
            Some(period) => {
                // Realign rather than burst-fire: skip past any periods
                // that elapsed while this timer couldn't be serviced,
                // landing on the first multiple of `period` still ahead of
                // `now` (§4.8, S5).
                let mut next = state.next_fire + period;
                while next <= now {
                    next += period;
                }
                state.next_fire = next;
                timer.state.replace(&mut **tok, state);

                let mut heap = sched.timers().replace(&mut **tok, TimerHeap::new());
                let _ = heap.0.heap_push(timer, |a, b| {
                    a.state.read(&**tok).next_fire < b.state.read(&**tok).next_fire
                });
                sched.timers().replace(&mut **tok, heap);
            }
            None => {
                state.active = false;
                timer.state.replace(&mut **tok, state);
            }
        }

        log::trace!("firing timer at {:?}", now);
        (timer.callback)(timer.arg);
    }
}
