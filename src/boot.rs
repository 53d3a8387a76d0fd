//! Boot sequence (C12)
//!
//! Grounded on the teacher's `System::boot`/port-specific startup split and
//! distortos's `initializeRunTimeServicesSupport()` + idle-task bring-up:
//! register the idle task, start the tick timer, and hand off to the port's
//! interrupt-driven dispatcher (§6). The actual first context switch is
//! necessarily port-specific (it abandons the boot stack), so this module's
//! job ends at "request one and let the tick/pendSV machinery take over".
use crate::{kernel_traits::KernelTraits, task::TaskId};

/// Default idle-task entry point: parks the CPU at the lowest priority
/// forever. Applications may supply their own instead (e.g. one that also
/// feeds a watchdog), but most won't need to.
///
/// # Safety
/// Must only ever be installed as the entry point of the dedicated idle
/// task (priority [`crate::task::Priority::IDLE`]); it never returns,
/// though its signature matches [`crate::task::TaskAttr::entry`]'s plain
/// `unsafe fn(usize)` rather than annotating `-> !` itself.
pub unsafe fn idle_entry(_arg: usize) {
    loop {
        // A real port would WFI/WFE here; staying a busy spin keeps this
        // core agnostic of any particular low-power instruction.
        core::hint::spin_loop();
    }
}

/// Boot the kernel (§6): bring the idle task out of `New`, start the tick
/// timer, and request the first context switch. Must be called exactly
/// once, from the application's `main`, before any other kernel API.
///
/// Returns only if the port never actually dispatches anything (e.g. a
/// test port that just records the request); a real target's `main` is
/// expected never to return from this call.
pub fn start<Traits: KernelTraits>(idle: TaskId, tick_hz: u32) -> crate::error::Result<()> {
    Traits::state().add(idle)?;
    Traits::tick_timer_start_at_hz(tick_hz);
    log::info!("kernel boot complete, idle task id={}", idle.index());
    Traits::request_context_switch();
    Ok(())
}
