//! Kernel error codes
//!
//! The distilled error surface used throughout this crate. Unlike the
//! teacher kernel, which defines a distinct suberror enum per operation
//! (dozens of them, stitched together with a `define_suberror!` macro), this
//! kernel's operation set is small enough that a single flat enum covers
//! every fallible entry point, matching the POSIX-style status codes named
//! in the specification.
use core::fmt;

/// A kernel error code. `0` (success) is represented as `Ok(())`/`Ok(T)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A non-blocking operation could not complete immediately.
    Eagain,
    /// The operation would deadlock (e.g. joining the calling thread, or a
    /// mutex lock cycle).
    Edeadlk,
    /// The wait was interrupted by signal delivery.
    Eintr,
    /// The argument was invalid for this operation or object state.
    Einval,
    /// The supplied buffer did not match the message queue's element size.
    Emsgsize,
    /// A fixed-capacity resource (the queued-signal ring) is full.
    Enomem,
    /// The operation is not supported in this configuration.
    Enotsup,
    /// A counting resource would exceed its ceiling.
    Eoverflow,
    /// The caller does not own the resource it tried to operate on.
    Eperm,
    /// The wait's deadline elapsed before the condition was satisfied.
    Etimedout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eagain => "resource temporarily unavailable",
            Self::Edeadlk => "operation would deadlock",
            Self::Eintr => "interrupted by signal delivery",
            Self::Einval => "invalid argument",
            Self::Emsgsize => "message size mismatch",
            Self::Enomem => "no space left in fixed-capacity resource",
            Self::Enotsup => "operation not supported",
            Self::Eoverflow => "value would overflow a bounded counter",
            Self::Eperm => "operation not permitted for the calling context",
            Self::Etimedout => "wait deadline elapsed",
        };
        f.write_str(s)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result alias used by every fallible kernel entry point.
pub type Result<T> = core::result::Result<T, Error>;

/// The reason a blocking call returned, as stored by whichever operation
/// woke the thread (§4.3, "reason code" in the glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Woken normally (ownership/data was transferred, or the condition the
    /// thread was waiting for became true).
    Normal,
    /// Woken by a pending signal with an associated handler.
    Signal,
    /// Woken because the wait's deadline elapsed.
    TimedOut,
}

impl WakeReason {
    /// Convert to the matching `Result<()>`, where `Normal` maps to `Ok(())`.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Normal => Ok(()),
            Self::Signal => Err(Error::Eintr),
            Self::TimedOut => Err(Error::Etimedout),
        }
    }
}

/// Programmer-fault classes reported to the fault hook (§7.1) before the
/// kernel panics. These represent precondition violations, never ordinary
/// runtime failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A blocking call was attempted from interrupt context.
    BlockInIsr,
    /// `Scheduler::add` was called on a TCB that is not in the `New` state,
    /// or a `Terminated` TCB was passed to an operation that forbids it.
    ReaddTerminated,
    /// An operation observed an internal invariant violation (e.g. a task
    /// reachable from two lists at once).
    IllegalTransition,
}
