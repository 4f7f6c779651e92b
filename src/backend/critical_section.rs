use core::fmt::{self, Debug, Formatter};

use crate::lock::RawLock;

/// An OS critical-section object.
///
/// On Windows this is a `CRITICAL_SECTION`, elsewhere on Unix a pthread
/// mutex of type `PTHREAD_MUTEX_RECURSIVE`. Both are recursive, so a thread
/// that acquires it twice does not deadlock. The allocation lock is still
/// used non-reentrantly, and debug builds assert against it.
///
/// Trying to enter a critical section is not treated as a fast path: fast
/// attempts against this backend degrade to the blocking acquisition.
///
/// A failing OS call is fatal. It is logged and the process aborts, since a
/// broken mutual exclusion primitive leaves nothing to recover.
pub struct CriticalSection {
    os: os::CriticalSection,
}

impl CriticalSection {
    /// Creates and initializes a new critical section.
    pub fn new() -> Self {
        Self { os: os::CriticalSection::new() }
    }
}

// SAFETY: The OS primitive guarantees mutual exclusion between threads and
// issues full barriers on entry and exit.
unsafe impl RawLock for CriticalSection {
    #[inline]
    fn lock(&self) {
        self.os.enter();
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.os.try_enter()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.os.leave();
    }

    #[inline(always)]
    fn has_fast_path(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        os::NAME
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for CriticalSection {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for CriticalSection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalSection").field("os", &os::NAME).finish()
    }
}

/// Logs a failed OS call and aborts the process.
#[cold]
#[inline(never)]
#[cfg_attr(windows, allow(dead_code))]
fn fatal(call: &'static str, code: i32) -> ! {
    tracing::error!(call, code, "critical section primitive failed");
    std::process::abort()
}

#[cfg(windows)]
mod os {
    use core::cell::UnsafeCell;
    use core::mem::MaybeUninit;

    pub const NAME: &str = "critical-section (CRITICAL_SECTION)";

    #[repr(C)]
    #[allow(non_camel_case_types)]
    struct CRITICAL_SECTION {
        _opaque: MaybeUninit<[usize; 6]>,
    }

    #[link(name = "kernel32")]
    extern "system" {
        fn InitializeCriticalSection(p: *mut CRITICAL_SECTION);
        fn DeleteCriticalSection(p: *mut CRITICAL_SECTION);
        fn EnterCriticalSection(p: *mut CRITICAL_SECTION);
        fn TryEnterCriticalSection(p: *mut CRITICAL_SECTION) -> i32;
        fn LeaveCriticalSection(p: *mut CRITICAL_SECTION);
    }

    // The object must not move once initialized, hence the box.
    pub struct CriticalSection(Box<UnsafeCell<CRITICAL_SECTION>>);

    // SAFETY: Critical sections may be entered and left from any thread.
    unsafe impl Send for CriticalSection {}
    unsafe impl Sync for CriticalSection {}

    impl CriticalSection {
        pub fn new() -> Self {
            let cs = Box::new(UnsafeCell::new(CRITICAL_SECTION { _opaque: MaybeUninit::uninit() }));
            // SAFETY: The pointer is valid, boxed storage large enough for a
            // `CRITICAL_SECTION` on this target.
            unsafe { InitializeCriticalSection(cs.get()) };
            Self(cs)
        }

        pub fn enter(&self) {
            // SAFETY: Initialized in `new`, deleted only on drop.
            unsafe { EnterCriticalSection(self.0.get()) }
        }

        pub fn try_enter(&self) -> bool {
            // SAFETY: Initialized in `new`, deleted only on drop.
            unsafe { TryEnterCriticalSection(self.0.get()) != 0 }
        }

        pub fn leave(&self) {
            // SAFETY: Initialized in `new`, deleted only on drop.
            unsafe { LeaveCriticalSection(self.0.get()) }
        }
    }

    impl Drop for CriticalSection {
        fn drop(&mut self) {
            // SAFETY: No thread can hold a reference to it anymore.
            unsafe { DeleteCriticalSection(self.0.get()) }
        }
    }
}

#[cfg(unix)]
mod os {
    use core::cell::UnsafeCell;
    use core::mem::MaybeUninit;

    use super::fatal;

    pub const NAME: &str = "critical-section (recursive pthread mutex)";

    // The mutex must not move once initialized, hence the box.
    pub struct CriticalSection(Box<UnsafeCell<libc::pthread_mutex_t>>);

    // SAFETY: pthread mutexes may be locked and unlocked from any thread.
    unsafe impl Send for CriticalSection {}
    unsafe impl Sync for CriticalSection {}

    impl CriticalSection {
        pub fn new() -> Self {
            let mutex = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            // SAFETY: `attr` is initialized by `pthread_mutexattr_init` before
            // any other use, and destroyed once the mutex is initialized.
            unsafe {
                check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr.as_mut_ptr()));
                let kind = libc::PTHREAD_MUTEX_RECURSIVE;
                let rc = libc::pthread_mutexattr_settype(attr.as_mut_ptr(), kind);
                check("pthread_mutexattr_settype", rc);
                check("pthread_mutex_init", libc::pthread_mutex_init(mutex.get(), attr.as_ptr()));
                libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            }
            Self(mutex)
        }

        pub fn enter(&self) {
            // SAFETY: Initialized in `new`, destroyed only on drop.
            check("pthread_mutex_lock", unsafe { libc::pthread_mutex_lock(self.0.get()) });
        }

        pub fn try_enter(&self) -> bool {
            // SAFETY: Initialized in `new`, destroyed only on drop.
            match unsafe { libc::pthread_mutex_trylock(self.0.get()) } {
                0 => true,
                libc::EBUSY => false,
                rc => fatal("pthread_mutex_trylock", rc),
            }
        }

        pub fn leave(&self) {
            // SAFETY: Initialized in `new`, destroyed only on drop.
            check("pthread_mutex_unlock", unsafe { libc::pthread_mutex_unlock(self.0.get()) });
        }
    }

    impl Drop for CriticalSection {
        fn drop(&mut self) {
            // SAFETY: No thread can hold a reference to it anymore.
            unsafe { libc::pthread_mutex_destroy(self.0.get()) };
        }
    }

    fn check(call: &'static str, rc: i32) {
        if rc != 0 {
            fatal(call, rc);
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::CriticalSection;
    use crate::lock::RawLock;
    use crate::test::tests;

    #[test]
    fn smoke() {
        tests::smoke::<CriticalSection>();
    }

    #[test]
    fn try_lock_fails_while_held() {
        tests::try_lock_fails_while_held::<CriticalSection>();
    }

    #[test]
    fn lots_and_lots() {
        tests::lots_and_lots::<CriticalSection>();
    }

    #[test]
    fn waiter_blocks_until_release() {
        tests::waiter_blocks_until_release::<CriticalSection>();
    }

    #[test]
    fn has_no_fast_path() {
        assert!(!CriticalSection::new().has_fast_path());
    }

    #[test]
    fn is_recursive() {
        let cs = CriticalSection::new();
        cs.lock();
        assert!(cs.try_lock());
        unsafe {
            cs.unlock();
            cs.unlock();
        }
    }
}
