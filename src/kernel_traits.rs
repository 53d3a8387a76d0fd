//! The trait tying a concrete application together (port + object pools)
//!
//! Grounded on the teacher's `KernelTraits` (`r3_kernel::KernelCfg1` +
//! `PortThreading`), reduced to the handful of static accessors this
//! simplified kernel needs: the task pool and the scheduler singleton. An
//! application implements this trait once for a marker type and then uses
//! `System::<MyApp>` as the handle for every kernel call, exactly as the
//! teacher's generated code uses `System<Traits>`.
use crate::{port::Port, sched::Scheduler, task::TaskCb};

/// Combines [`Port`] with the static object-pool accessors the kernel core
/// needs. Implemented once per application on a zero-sized marker type.
pub trait KernelTraits: Port {
    /// All tasks known to the scheduler, in a stable order; a task's
    /// [`TaskId`](crate::task::TaskId) is its index into this slice.
    fn task_pool() -> &'static [TaskCb<Self>];

    /// The idle task (§4.12, C12): priority 0, runs whenever no other task
    /// is runnable. Must be one of the entries in [`task_pool`](Self::task_pool).
    fn idle_task() -> &'static TaskCb<Self>;

    /// The single scheduler instance for this application.
    fn state() -> &'static Scheduler<Self>;
}

/// Zero-sized handle used to call kernel operations, parameterized by the
/// application's [`KernelTraits`] implementation. Mirrors the teacher's
/// `System<Traits>`.
pub struct System<Traits>(core::marker::PhantomData<Traits>);
