//! Hosted test port (A4)
//!
//! Stands in for a real CPU port (`r3_port_std` in the teacher's corpus):
//! one OS thread per task, park/unpark-style handoff driven by a `Mutex` +
//! `Condvar` rather than a register-level context switch, and a dedicated
//! OS thread delivering tick interrupts. [`use_test_port!`] plays the role
//! of the teacher's `use_port!` macro, wiring a concrete [`Port`] impl plus
//! its `'static` state for an application-defined `KernelTraits` type.
//!
//! # Preemption model
//!
//! A real port can interrupt a running task at any instruction (that's the
//! entire point of `pendSV`/`SysTick`). Faithfully reproducing that over
//! plain OS threads needs platform-specific thread-suspension (the teacher
//! resorts to Windows UMS, and its Unix fallback forcibly parks a thread
//! from a `SIGUSR1` handler -- see `r3_port_std/src/threading_unix.rs`).
//! That machinery exists to protect *arbitrary, uncooperative* application
//! code; it's unneeded complexity for a port whose only job is exercising
//! this kernel's own logic.
//!
//! Instead, a dispatch decision that would reassign `current` away from a
//! task takes effect only when that task's own OS thread next reaches a
//! safe point (leaving its own critical section) -- exactly where a real
//! port's `request_context_switch` would actually pend the switch. A tick
//! or another task's post *can* still register the need for a switch (via
//! `request_context_switch`/[`TestPortState::dispatch_pending`]); it just
//! doesn't forcibly stop the other thread to act on it. The one exception
//! is the idle task, which this crate's [`crate::boot::idle_entry`] never
//! lets touch a critical section -- it's safe to reassign `current` away
//! from idle from any thread, since idle never observes or depends on
//! being descheduled. Tasks in this test port are expected to make their
//! next kernel call soon after becoming preemptible (sleeping, waiting,
//! blocking); one that spins forever without ever calling into the kernel
//! is simply never preempted here, same as it would stall any cooperative
//! scheduler.
use core::marker::PhantomData;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex,
    },
    thread,
    time::Duration,
};

use crate::{
    kernel_traits::KernelTraits,
    klock::lock_critical,
    task::{TaskCb, TaskId},
};

thread_local! {
    /// The [`TaskId`] this OS thread embodies, if any. `None` for the tick
    /// timer thread and for threads external to the kernel (e.g. a test's
    /// `#[test]` function calling into kernel APIs directly, mirroring the
    /// teacher's `pend_interrupt_line`, callable only from such threads).
    static CURRENT_TASK: core::cell::Cell<Option<TaskId>> = core::cell::Cell::new(None);
    /// Critical-section nesting depth on this OS thread.
    static CRITICAL_DEPTH: core::cell::Cell<u32> = core::cell::Cell::new(0);
    /// Set while this thread is already inside `perform_dispatch`, so that
    /// the critical section `perform_dispatch` itself opens to call
    /// `choose_next` doesn't re-enter `perform_dispatch` on the way out
    /// (its `CriticalGuard::drop` calls `leave_critical`, which otherwise
    /// would try to re-lock `TestPortState::dispatch_guard` and deadlock).
    static DISPATCHING: core::cell::Cell<bool> = core::cell::Cell::new(false);
}

/// Per-`Traits` state backing a [`use_test_port!`]-generated [`Port`](crate::port::Port) impl.
pub struct TestPortState<Traits: crate::port::Port + crate::kernel_traits::KernelTraits> {
    /// The OS thread presently inside the critical section, if any.
    critical_owner: Mutex<Option<thread::ThreadId>>,
    critical_cv: Condvar,
    /// Set by `request_context_switch`; cleared once a dispatch decision
    /// has actually been acted on.
    dispatch_pending: AtomicBool,
    /// Serializes dispatch decisions (choosing + handing off to the next
    /// task) so two threads can't race to act on the same pending switch.
    dispatch_guard: Mutex<()>,
    /// Which task is presently allowed to run.
    running: Mutex<Option<TaskId>>,
    running_cv: Condvar,
    /// Tasks whose backing OS thread has already been spawned.
    threads: Mutex<Vec<TaskId>>,
    /// Deferred signal-handler trampolines requested via
    /// `request_function_execution`, run the next time the task resumes.
    pending_fn: Mutex<Vec<(TaskId, fn(&'static TaskCb<Traits>))>>,
    _phantom: PhantomData<Traits>,
}

impl<Traits: crate::port::Port + crate::kernel_traits::KernelTraits> TestPortState<Traits> {
    pub const fn new() -> Self {
        Self {
            critical_owner: Mutex::new(None),
            critical_cv: Condvar::new(),
            dispatch_pending: AtomicBool::new(false),
            dispatch_guard: Mutex::new(()),
            running: Mutex::new(None),
            running_cv: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            pending_fn: Mutex::new(Vec::new()),
            _phantom: PhantomData,
        }
    }
}

/// Implemented by [`use_test_port!`] on the application's `KernelTraits`
/// type, analogous to the teacher's `PortInstance`.
pub trait TestPortInstance: KernelTraits {
    fn port_state() -> &'static TestPortState<Self>;
}

fn idle_task_id<Traits: KernelTraits>() -> TaskId {
    TaskId::of(Traits::idle_task())
}

/// [`Port::initialize_stack`](crate::port::Port::initialize_stack): no-op.
/// Each task runs on its own OS thread with a thread-managed stack; there's
/// no frame for this port to lay out by hand.
pub fn initialize_stack(_stack: &mut [u8], _entry: unsafe fn(usize), _arg: usize) -> usize {
    0
}

pub fn request_context_switch<Traits: TestPortInstance>() {
    Traits::port_state()
        .dispatch_pending
        .store(true, Ordering::Release);
    if !is_critical_active() {
        perform_dispatch::<Traits>();
    }
}

pub fn request_function_execution<Traits: TestPortInstance>(
    task: &'static TaskCb<Traits>,
    f: fn(&'static TaskCb<Traits>),
) {
    let id = TaskId::of(task);
    let mut pending = Traits::port_state().pending_fn.lock().unwrap();
    if !pending.iter().any(|&(pending_id, _)| pending_id == id) {
        pending.push((id, f));
    }
}

/// # Safety
/// Caller must uphold [`Port::enter_critical`](crate::port::Port::enter_critical)'s nesting contract.
pub unsafe fn enter_critical<Traits: TestPortInstance>() {
    let depth = CRITICAL_DEPTH.with(|d| d.get());
    if depth > 0 {
        CRITICAL_DEPTH.with(|d| d.set(depth + 1));
        return;
    }
    let state = Traits::port_state();
    let me = thread::current().id();
    let mut owner = state.critical_owner.lock().unwrap();
    while owner.is_some() {
        owner = state.critical_cv.wait(owner).unwrap();
    }
    *owner = Some(me);
    drop(owner);
    CRITICAL_DEPTH.with(|d| d.set(1));
}

/// # Safety
/// Caller must uphold [`Port::leave_critical`](crate::port::Port::leave_critical)'s pairing contract.
pub unsafe fn leave_critical<Traits: TestPortInstance>() {
    let depth = CRITICAL_DEPTH.with(|d| d.get());
    debug_assert!(depth > 0, "leave_critical without a matching enter_critical");
    if depth > 1 {
        CRITICAL_DEPTH.with(|d| d.set(depth - 1));
        return;
    }
    CRITICAL_DEPTH.with(|d| d.set(0));
    let state = Traits::port_state();
    *state.critical_owner.lock().unwrap() = None;
    state.critical_cv.notify_all();
    if !DISPATCHING.with(|d| d.get()) {
        perform_dispatch::<Traits>();
    }
}

pub fn is_critical_active() -> bool {
    CRITICAL_DEPTH.with(|d| d.get() > 0)
}

pub fn is_task_context() -> bool {
    CURRENT_TASK.with(|c| c.get().is_some())
}

pub fn tick_timer_start_at_hz<Traits: TestPortInstance>(hz: u32) {
    let period = Duration::from_secs_f64(1.0 / f64::from(hz.max(1)));
    thread::Builder::new()
        .name("tick-timer".into())
        .spawn(move || loop {
            thread::sleep(period);
            Traits::state().tick_hook();
        })
        .expect("failed to spawn the tick-timer thread");
}

/// Resolve a pending `request_context_switch`, if it's this thread's turn
/// to act on one. See the module doc for the preemption-gating rule.
fn perform_dispatch<Traits: TestPortInstance>() {
    let state = Traits::port_state();
    let _dispatch_guard = state.dispatch_guard.lock().unwrap();
    if !state.dispatch_pending.load(Ordering::Acquire) {
        return;
    }
    DISPATCHING.with(|d| d.set(true));
    let result = perform_dispatch_inner::<Traits>(state);
    DISPATCHING.with(|d| d.set(false));

    if let Some((outgoing, next)) = result {
        {
            let mut running = state.running.lock().unwrap();
            *running = Some(next);
        }
        state.running_cv.notify_all();
        ensure_thread_spawned::<Traits>(next);

        if outgoing != Some(next) {
            if let Some(me) = outgoing {
                park_until_current::<Traits>(me);
            }
        }
    }
}

/// The part of [`perform_dispatch`] that needs a critical section. Runs
/// with [`DISPATCHING`] set so the critical section's own exit doesn't
/// recursively re-enter `perform_dispatch` (it would deadlock reacquiring
/// `dispatch_guard`, still held by the caller).
fn perform_dispatch_inner<Traits: TestPortInstance>(
    state: &'static TestPortState<Traits>,
) -> Option<(Option<TaskId>, TaskId)> {
    let outgoing = CURRENT_TASK.with(|c| c.get());
    let mut lock = lock_critical::<Traits>()
        .expect("perform_dispatch observed an unexpectedly active critical section");
    let mut tok = lock.borrow_mut();
    let sched_current = Traits::state().current(&tok);
    let may_proceed = match sched_current {
        None => true,
        Some(id) if id == idle_task_id::<Traits>() => true,
        Some(id) => Some(id) == outgoing,
    };
    if !may_proceed {
        return None;
    }
    state.dispatch_pending.store(false, Ordering::Release);
    let next = Traits::state().choose_next(&mut tok);
    Some((outgoing, next))
}

fn ensure_thread_spawned<Traits: TestPortInstance>(id: TaskId) {
    let state = Traits::port_state();
    {
        let mut threads = state.threads.lock().unwrap();
        if threads.contains(&id) {
            return;
        }
        threads.push(id);
    }
    let task = &Traits::task_pool()[id.index()];
    let entry = task.attr.entry;
    let arg = task.attr.entry_param;
    thread::Builder::new()
        .name(format!("task-{}", id.index()))
        .spawn(move || task_thread_body::<Traits>(id, entry, arg))
        .expect("failed to spawn a task thread");
}

fn task_thread_body<Traits: TestPortInstance>(id: TaskId, entry: unsafe fn(usize), arg: usize) {
    CURRENT_TASK.with(|c| c.set(Some(id)));
    park_until_current::<Traits>(id);
    log::debug!("task {} is now running", id.index());
    unsafe { entry(arg) };
    log::debug!(
        "task {}'s entry point returned without going through Scheduler::remove",
        id.index()
    );
}

/// Block this OS thread until `id` is the scheduler's chosen task, then run
/// any deferred signal trampoline for it before returning.
fn park_until_current<Traits: TestPortInstance>(id: TaskId) {
    let state = Traits::port_state();
    let mut running = state.running.lock().unwrap();
    while *running != Some(id) {
        running = state.running_cv.wait(running).unwrap();
    }
    drop(running);
    run_pending_function::<Traits>(id);
}

fn run_pending_function<Traits: TestPortInstance>(id: TaskId) {
    let f = {
        let mut pending = Traits::port_state().pending_fn.lock().unwrap();
        let pos = pending.iter().position(|&(pending_id, _)| pending_id == id);
        pos.map(|i| pending.remove(i).1)
    };
    if let Some(f) = f {
        f(&Traits::task_pool()[id.index()]);
    }
}

/// Wire up a [`Port`](crate::port::Port) implementation backed by this
/// module for `$Traits`, analogous to the teacher's `use_port!`.
#[macro_export]
macro_rules! use_test_port {
    ($vis:vis struct $Traits:ident) => {
        $vis struct $Traits;

        const _: () = {
            use $crate::{port::Port, task::TaskCb, test_port::{TestPortInstance, TestPortState}};

            static PORT_STATE: TestPortState<$Traits> = TestPortState::new();

            impl TestPortInstance for $Traits {
                fn port_state() -> &'static TestPortState<Self> {
                    &PORT_STATE
                }
            }

            unsafe impl Port for $Traits {
                unsafe fn initialize_stack(
                    stack: &mut [u8],
                    entry: unsafe fn(usize),
                    arg: usize,
                ) -> usize {
                    $crate::test_port::initialize_stack(stack, entry, arg)
                }

                fn request_context_switch() {
                    $crate::test_port::request_context_switch::<$Traits>()
                }

                fn request_function_execution(
                    task: &'static TaskCb<Self>,
                    f: fn(&'static TaskCb<Self>),
                ) {
                    $crate::test_port::request_function_execution::<$Traits>(task, f)
                }

                unsafe fn enter_critical() {
                    unsafe { $crate::test_port::enter_critical::<$Traits>() }
                }

                unsafe fn leave_critical() {
                    unsafe { $crate::test_port::leave_critical::<$Traits>() }
                }

                fn is_critical_active() -> bool {
                    $crate::test_port::is_critical_active()
                }

                fn is_task_context() -> bool {
                    $crate::test_port::is_task_context()
                }

                fn tick_timer_start_at_hz(hz: u32) {
                    $crate::test_port::tick_timer_start_at_hz::<$Traits>(hz)
                }
            }
        };
    };
}
