//! Thread control block (C4)
//!
//! Grounded on the teacher's `task.rs` `TaskCb`/`TaskSt`, adapted from a
//! const-generic compile-time task pool to the arena-with-stable-index model
//! recommended by the specification's design notes: a `TaskId` is a stable
//! index into the static task-pool slice the application defines, and every
//! intrusive link (ready/wait-queue membership, owned-mutex list) is stored
//! as an `Option<TaskId>` rather than a pointer.
use core::fmt;

use crate::{
    klock::{CriticalCell, CriticalTokenRefMut},
    list::List,
    mutex::MutexCb,
    port::Port,
    signal::SignalsReceiver,
    sem::SemaphoreCb,
    time::Instant,
};

/// A stable handle to a [`TaskCb`]: its index within
/// `KernelTraits::task_pool()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u16);

impl TaskId {
    /// Construct a `TaskId` from a known position in `Traits::task_pool()`.
    /// An application declaring its task pool as a fixed-order `static`
    /// array knows each task's index at the point it writes that array, so
    /// this is how a [`SignalsReceiver`] embedded in one of those same
    /// `TaskCb`s can name its owner: [`TaskId::of`] can't be used there,
    /// since it needs a `&'static TaskCb` that doesn't exist yet at the
    /// point the receiver itself is being const-initialized.
    #[inline]
    pub const fn new(index: u16) -> Self {
        TaskId(index)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Look up the stable index of `task` within `Traits::task_pool()`
    /// (§6). An application declares its task pool as plain `'static`
    /// `TaskCb` items with no inherent index of their own, so this pointer-
    /// identity scan is the only way to turn a `&'static TaskCb` reference
    /// into the `TaskId` `boot::start`/`Scheduler::add`/`Scheduler::join`
    /// expect -- the same lookup every primitive already performs
    /// internally to resolve `Self::task(id)` the other direction.
    pub fn of<Traits: crate::kernel_traits::KernelTraits>(task: &'static TaskCb<Traits>) -> Self {
        Traits::task_pool()
            .iter()
            .position(|t| core::ptr::eq(t, task))
            .map(|i| TaskId(i as u16))
            .expect("task must be a member of Traits::task_pool()")
    }
}

/// Scheduling priority. `0` is reserved for the idle task and `255` for the
/// main/boot task (§9 open question, resolved: construction of either
/// reserved value is private to this crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    pub const IDLE: Priority = Priority(0);
    pub const MAIN: Priority = Priority(255);

    /// Construct an application priority. User tasks may not claim the
    /// reserved extremes 0 (idle) or 255 (main).
    pub const fn new(level: u8) -> Option<Self> {
        if level == 0 || level == 255 {
            None
        } else {
            Some(Priority(level))
        }
    }

    pub(crate) const fn new_reserved(level: u8) -> Self {
        Priority(level)
    }

    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }
}

/// Round-robin vs. run-to-completion-among-equals scheduling policy (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Fifo,
    RoundRobin { quantum: u32 },
}

/// Task state machine (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    New,
    Runnable,
    Sleeping,
    BlockedOnSemaphore,
    BlockedOnMutex,
    BlockedOnConditionVariable,
    BlockedOnMessageQueueEmpty,
    BlockedOnMessageQueueFull,
    BlockedOnSignalWait,
    BlockedOnJoin,
    Terminated,
}

impl TaskSt {
    pub(crate) fn is_blocked(self) -> bool {
        !matches!(self, TaskSt::New | TaskSt::Runnable | TaskSt::Terminated)
    }
}

/// Which list a [`TaskCb`] is presently linked into (invariant 1, §3): at
/// most one of these at a time. Tracked for debug assertions and for
/// `unblock`, which needs to know which waiter list to unlink from without
/// being told explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListTag {
    None,
    Ready,
    Sleep,
    Semaphore,
    Mutex,
    CondVar,
    MqPush,
    MqPop,
    SignalWait,
    Join,
}

/// Intrusive doubly-linked list pointers embedded in every [`TaskCb`], plus
/// the tag recording which logical list currently owns them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Link {
    pub(crate) prev: Option<TaskId>,
    pub(crate) next: Option<TaskId>,
    pub(crate) tag: ListTag,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            prev: None,
            next: None,
            tag: ListTag::None,
        }
    }
}

/// Stack descriptor (§3): base pointer/length and current SP. The current SP
/// is mutated exclusively by the port layer's context-switch trampoline,
/// which always runs with scheduler interrupts masked; a plain `UnsafeCell`
/// (rather than a [`CriticalCell`]) is used because the port, not generic
/// kernel code, is the sole accessor.
pub struct StackInfo {
    pub base: *mut u8,
    pub size: usize,
    sp: core::cell::UnsafeCell<usize>,
}

unsafe impl Sync for StackInfo {}

impl fmt::Debug for StackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackInfo")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

impl StackInfo {
    pub const fn new(base: *mut u8, size: usize) -> Self {
        Self {
            base,
            size,
            sp: core::cell::UnsafeCell::new(0),
        }
    }

    /// Raw byte slice of the stack region, for [`Port::initialize_stack`].
    ///
    /// # Safety
    /// Must only be called for a task that is not currently running.
    #[inline]
    pub unsafe fn as_slice_mut(&self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.base, self.size) }
    }

    /// Current stack pointer. Only valid to read/write from the port's
    /// context-switch trampoline, under the scheduler's critical section.
    ///
    /// # Safety
    /// Caller must ensure exclusive access (only the port's switch code
    /// touches this field, and only while the owning task is not running).
    #[inline]
    pub unsafe fn sp_cell(&self) -> *mut usize {
        self.sp.get()
    }
}

/// Static, immutable-after-construction attributes of a task.
pub struct TaskAttr<Traits: Port> {
    pub entry: unsafe fn(usize),
    pub entry_param: usize,
    pub stack: StackInfo,
    pub base_priority: Priority,
    pub policy: SchedPolicy,
    _phantom: core::marker::PhantomData<Traits>,
}

impl<Traits: Port> TaskAttr<Traits> {
    pub const fn new(
        entry: unsafe fn(usize),
        entry_param: usize,
        stack: StackInfo,
        base_priority: Priority,
        policy: SchedPolicy,
    ) -> Self {
        Self {
            entry,
            entry_param,
            stack,
            base_priority,
            policy,
            _phantom: core::marker::PhantomData,
        }
    }
}

/// *Thread control block* (C4): the mutable scheduling state of a task. One
/// instance lives at a fixed `'static` address for the life of the program;
/// `KernelTraits::task_pool()` enumerates them.
pub struct TaskCb<Traits: Port + crate::kernel_traits::KernelTraits> {
    pub attr: &'static TaskAttr<Traits>,

    pub(crate) base_priority: CriticalCell<Traits, Priority>,
    pub(crate) effective_priority: CriticalCell<Traits, Priority>,
    pub(crate) st: CriticalCell<Traits, TaskSt>,
    pub(crate) policy: CriticalCell<Traits, SchedPolicy>,
    pub(crate) quantum_left: CriticalCell<Traits, u32>,

    pub(crate) link: CriticalCell<Traits, Link>,

    /// The outcome written by whoever unblocks this task; read by the
    /// wrapper that called `block`/`block_until` once control returns.
    pub(crate) wake_reason: CriticalCell<Traits, crate::error::WakeReason>,
    pub(crate) deadline: CriticalCell<Traits, Option<Instant>>,

    /// The specific waiter list this task is currently linked into, if any
    /// (distinct from [`Link::tag`], which only records the *kind*). Lets
    /// the tick hook unlink a timed-out task without knowing in advance
    /// which semaphore/mutex/condvar/queue/signal receiver it's blocked on.
    pub(crate) wait_list: CriticalCell<Traits, Option<&'static CriticalCell<Traits, List>>>,

    /// Head of the intrusive singly-linked list of mutexes this task
    /// currently owns (for priority-inheritance bookkeeping and abandonment
    /// on exit, §4.5.2).
    pub(crate) owned_mutexes: CriticalCell<Traits, Option<&'static MutexCb<Traits>>>,

    /// Embedded join semaphore (§4.3.1), initial count 0, posted exactly
    /// once by `Scheduler::remove`'s exit hook.
    pub join_sem: SemaphoreCb<Traits>,

    pub signals: Option<&'static SignalsReceiver<Traits>>,
}

impl<Traits: Port + crate::kernel_traits::KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("base_priority", &self.attr.base_priority)
            .finish()
    }
}

impl<Traits: Port + crate::kernel_traits::KernelTraits> TaskCb<Traits> {
    /// Construct a new, `New`-state TCB. Meant to be used in a `static`
    /// initializer alongside a matching [`TaskAttr`].
    pub const fn new(
        attr: &'static TaskAttr<Traits>,
        signals: Option<&'static SignalsReceiver<Traits>>,
    ) -> Self {
        Self {
            attr,
            base_priority: CriticalCell::new(attr.base_priority),
            effective_priority: CriticalCell::new(attr.base_priority),
            st: CriticalCell::new(TaskSt::New),
            policy: CriticalCell::new(attr.policy),
            quantum_left: CriticalCell::new(0),
            link: CriticalCell::new(Link {
                prev: None,
                next: None,
                tag: ListTag::None,
            }),
            wake_reason: CriticalCell::new(crate::error::WakeReason::Normal),
            deadline: CriticalCell::new(None),
            wait_list: CriticalCell::new(None),
            owned_mutexes: CriticalCell::new(None),
            join_sem: SemaphoreCb::new(0, None),
            signals,
        }
    }

    #[inline]
    pub(crate) fn effective_priority(&self, tok: &CriticalTokenRefMut<'_, Traits>) -> Priority {
        *self.effective_priority.read(&**tok)
    }

    #[inline]
    pub(crate) fn state(&self, tok: &CriticalTokenRefMut<'_, Traits>) -> TaskSt {
        *self.st.read(&**tok)
    }
}
