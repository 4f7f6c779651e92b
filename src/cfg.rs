//! Switches between `core`/`std` and Loom primitives.
//!
//! Every atomic, hint and scheduling call that takes part in the locking
//! protocol goes through this module, so that `RUSTFLAGS="--cfg loom"` model
//! checks the very same code that ships.

pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize};

    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize};

    /// A trait for atomics that can be read without synchronization when
    /// there is exclusive access to them.
    pub trait UnsyncLoad {
        /// The value type of the atomic.
        type Target;

        /// Loads the value through an exclusive reference.
        fn load_unsynced(&mut self) -> Self::Target;
    }

    #[cfg(not(all(loom, test)))]
    impl<T> UnsyncLoad for AtomicPtr<T> {
        type Target = *mut T;

        fn load_unsynced(&mut self) -> Self::Target {
            *self.get_mut()
        }
    }

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    impl<T> UnsyncLoad for AtomicPtr<T> {
        type Target = *mut T;

        fn load_unsynced(&mut self) -> Self::Target {
            // SAFETY: We hold exclusive access over the atomic.
            unsafe { self.unsync_load() }
        }
    }
}

pub mod hint {
    #[cfg(not(all(loom, test)))]
    pub use core::hint::spin_loop;

    #[cfg(all(loom, test))]
    pub use loom::hint::spin_loop;
}

pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::yield_now;

    #[cfg(all(loom, test))]
    pub use loom::thread::yield_now;

    /// Puts the current thread to sleep for `duration`.
    ///
    /// Loom has no notion of time, so under the model this yields instead.
    #[cfg(not(all(loom, test)))]
    pub fn sleep(duration: core::time::Duration) {
        std::thread::sleep(duration);
    }

    /// Puts the current thread to sleep for `duration`.
    ///
    /// Loom has no notion of time, so under the model this yields instead.
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn sleep(_duration: core::time::Duration) {
        loom::thread::yield_now();
    }
}
