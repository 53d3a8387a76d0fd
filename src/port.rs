//! Port layer interface (§6, out of scope for this core; consumed here as a
//! trait boundary)
//!
//! Everything a concrete CPU port (Cortex-M `pendSV`/SysTick wiring, stack
//! frame layout, interrupt priority masking) must supply. Grounded on the
//! teacher's split between `r3_core::kernel::PortThreading` (the trait the
//! kernel crate is generic over) and `r3_port_*` (the crates that implement
//! it for a real or hosted target) — this crate plays the role of
//! `r3_kernel`, and `Port` plays the role of `PortThreading`.
use crate::task::TaskCb;

/// Functionality a CPU port must provide to host this kernel core.
///
/// # Safety
///
/// Implementors must uphold the contract documented on each method; the
/// kernel relies on these for memory safety (e.g. a stack frame that doesn't
/// actually transfer control to `entry(arg)` on first dispatch is undefined
/// behavior once the scheduler switches into it).
pub unsafe trait Port: Sized + 'static {
    /// Prepare a stack frame that, on first switch-in, begins executing
    /// `entry(arg)`. Returns the initial stack pointer to record in the TCB.
    ///
    /// # Safety
    /// `stack` must designate a region not otherwise in use, valid for the
    /// lifetime of the task.
    unsafe fn initialize_stack(stack: &mut [u8], entry: unsafe fn(usize), arg: usize) -> usize;

    /// Pend a context switch to run at the earliest safe point (after the
    /// current critical section is released, or immediately if already
    /// outside one and not already in the middle of dispatch).
    fn request_context_switch();

    /// Arrange for `f` to run in `task`'s context, before its next resume.
    /// Idempotent: calling this again for the same task before the pending
    /// execution has run is a no-op.
    ///
    /// This implements the signal-delivery trampoline (C11): the port is
    /// responsible for running `f` with the target's normal register state
    /// rather than preempting arbitrary code.
    fn request_function_execution(task: &'static TaskCb<Self>, f: fn(&'static TaskCb<Self>))
    where
        Self: crate::kernel_traits::KernelTraits;

    /// Enter a critical section, masking scheduler-aware interrupts. Must be
    /// safe to nest; the port tracks the nesting depth (or the previous
    /// mask) so that a matching `leave_critical` only unmasks once the
    /// outermost guard is dropped.
    ///
    /// # Safety
    /// Must only be called by kernel code maintaining the nesting discipline
    /// documented on [`leave_critical`](Self::leave_critical).
    unsafe fn enter_critical();

    /// Leave one level of critical section entered by
    /// [`enter_critical`](Self::enter_critical).
    ///
    /// # Safety
    /// Must be paired 1:1 with a prior `enter_critical` call, in LIFO order.
    unsafe fn leave_critical();

    /// `true` iff a critical section is currently active on this core.
    fn is_critical_active() -> bool;

    /// `true` iff the CPU is currently executing task (thread) code, as
    /// opposed to interrupt/exception context.
    fn is_task_context() -> bool;

    /// Start the tick timer at the given frequency. Its ISR must call
    /// [`crate::sched::Scheduler::tick_hook`].
    fn tick_timer_start_at_hz(hz: u32);
}
