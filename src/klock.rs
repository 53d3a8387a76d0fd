//! Interrupt-masking guard and lock-protected cells (C2)
//!
//! Grounded on the teacher's `klock.rs`: a scoped "CPU Lock" token backed by
//! `tokenlock`, so that the type system — not a runtime check — enforces
//! that scheduler state is only ever touched while interrupts are masked.
//! `CriticalCell<Traits, T>` plays the role of `CpuLockCell`.
use core::{fmt, ops};
use tokenlock::UnsyncTokenLock;

use crate::{error::Error, port::Port};

pub(crate) struct CriticalTag<Traits>(Traits);

/// The key that "unlocks" [`CriticalCell`].
pub(crate) type CriticalToken<Traits> = tokenlock::UnsyncSingletonToken<CriticalTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] unlocked by [`CriticalToken`].
pub(crate) type CriticalKeyhole<Traits> = tokenlock::SingletonTokenId<CriticalTag<Traits>>;

/// A cell that can only be read or written while holding a [`CriticalGuard`].
pub(crate) struct CriticalCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CriticalKeyhole<Traits>>);

impl<Traits, T> CriticalCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CriticalKeyhole::new(), x))
    }
}

impl<Traits, T> ops::Deref for CriticalCell<Traits, T> {
    type Target = UnsyncTokenLock<T, CriticalKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T: fmt::Debug> fmt::Debug for CriticalCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CriticalCell").field(&"<locked>").finish()
    }
}

/// Attempt to enter a critical section and get an RAII guard. Returns
/// `Eperm` if a critical section is already active on this core (nesting is
/// achieved by threading the existing [`CriticalGuard`]/token through,
/// rather than by re-entering — matching the teacher's `lock_cpu`, which
/// likewise treats "already locked, from the kernel's perspective" as
/// reentrant-unsafe and requires callers to pass a borrowed token instead).
pub(crate) fn lock_critical<Traits: Port>() -> Result<CriticalGuard<Traits>, Error> {
    if Traits::is_critical_active() {
        return Err(Error::Eperm);
    }
    // Safety: we just confirmed no critical section is active, and we are
    // about to enter one, so there is exactly one live `CriticalGuard`.
    unsafe {
        Traits::enter_critical();
        Ok(assume_critical())
    }
}

/// Assume a critical section is already active and get a [`CriticalGuard`]
/// for it.
///
/// # Safety
/// The system must really be in a critical section, and no other
/// `CriticalGuard` for it may exist.
pub(crate) unsafe fn assume_critical<Traits: Port>() -> CriticalGuard<Traits> {
    debug_assert!(Traits::is_critical_active());
    CriticalGuard {
        // Safety: upheld by caller.
        token: unsafe { CriticalToken::new_unchecked() },
    }
}

/// RAII guard for an active critical section. Dropping it leaves the
/// critical section. [`CriticalToken`] (the key needed to access any
/// [`CriticalCell`]) can be borrowed from this type.
pub(crate) struct CriticalGuard<Traits: Port> {
    token: CriticalToken<Traits>,
}

impl<Traits: Port> CriticalGuard<Traits> {
    pub(crate) fn borrow_mut(&mut self) -> CriticalTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: Port> Drop for CriticalGuard<Traits> {
    fn drop(&mut self) {
        // Safety: this guard's existence proves we hold the one outstanding
        // critical-section entry it was constructed for.
        unsafe { Traits::leave_critical() };
    }
}

impl<Traits: Port> ops::Deref for CriticalGuard<Traits> {
    type Target = CriticalToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: Port> ops::DerefMut for CriticalGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Borrowed form of [`CriticalGuard`], equivalent to `&'a mut CriticalGuard`
/// but reborrowed explicitly via [`CriticalGuard::borrow_mut`] rather than
/// implicitly, matching `tokenlock`'s singleton-token API.
pub(crate) type CriticalTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CriticalTag<Traits>>;
