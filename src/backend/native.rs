use core::fmt::{self, Debug, Formatter};

use parking_lot::lock_api::RawMutex as _;

use crate::lock::RawLock;

/// A native blocking mutex, backed by [`parking_lot::RawMutex`].
///
/// Contending threads spin briefly and are then parked by the OS until the
/// holder releases, so no CPU time is spent waiting behind long critical
/// sections. This is the backend of choice when the allocation lock is held
/// for long periods, as with thread-local allocation.
pub struct NativeMutex {
    raw: parking_lot::RawMutex,
}

impl NativeMutex {
    /// Creates a new, unlocked mutex.
    pub const fn new() -> Self {
        Self { raw: parking_lot::RawMutex::INIT }
    }

    /// Returns `true` if some thread currently holds the mutex.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

// SAFETY: `parking_lot::RawMutex` upholds the `lock_api::RawMutex` contract,
// which is a superset of ours.
unsafe impl RawLock for NativeMutex {
    #[inline]
    fn lock(&self) {
        self.raw.lock();
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.raw.try_lock()
    }

    #[inline]
    unsafe fn unlock(&self) {
        // SAFETY: Caller guaranteed that the current thread holds the lock.
        unsafe { self.raw.unlock() }
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for NativeMutex {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for NativeMutex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeMutex").field("locked", &self.is_locked()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::NativeMutex;
    use crate::test::tests;

    #[test]
    fn smoke() {
        tests::smoke::<NativeMutex>();
    }

    #[test]
    fn try_lock_fails_while_held() {
        tests::try_lock_fails_while_held::<NativeMutex>();
    }

    #[test]
    fn lots_and_lots() {
        tests::lots_and_lots::<NativeMutex>();
    }

    #[test]
    fn lots_and_lots_try_lock() {
        tests::lots_and_lots_try_lock::<NativeMutex>();
    }

    #[test]
    fn waiter_blocks_until_release() {
        tests::waiter_blocks_until_release::<NativeMutex>();
    }
}
