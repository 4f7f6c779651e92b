//! Debug-only tracking of the thread that holds the lock.
//!
//! [`Tracked`] decorates any [`RawLock`]. With `debug_assertions` enabled it
//! records the owning thread on every acquisition and asserts, on every
//! release, that the releasing thread is the owner. Without
//! `debug_assertions` it is a transparent wrapper: the owner field, the
//! bookkeeping and the [`is_held_by_current`] predicate do not exist.
//!
//! [`is_held_by_current`]: Tracked::is_held_by_current

use crate::lock::RawLock;

#[cfg(debug_assertions)]
use crate::cfg::atomic::AtomicUsize;
#[cfg(debug_assertions)]
use core::sync::atomic::Ordering::Relaxed;

/// A [`RawLock`] that knows which thread holds it, in debug builds.
#[derive(Debug)]
pub struct Tracked<L> {
    inner: L,
    #[cfg(debug_assertions)]
    owner: AtomicUsize,
}

/// Owner value of an unowned lock.
#[cfg(debug_assertions)]
const NO_THREAD: usize = 0;

/// A process-unique, non-zero identifier of the calling thread.
#[cfg(debug_assertions)]
fn current_thread() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT: AtomicUsize = AtomicUsize::new(NO_THREAD + 1);
    std::thread_local! {
        static ID: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

impl<L> Tracked<L> {
    /// Wraps `inner`, which must be unlocked.
    pub fn new(inner: L) -> Self {
        #[cfg(debug_assertions)]
        let owner = AtomicUsize::new(NO_THREAD);
        Self {
            inner,
            #[cfg(debug_assertions)]
            owner,
        }
    }

    /// Returns a reference to the decorated lock.
    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// Whether the calling thread is the recorded holder.
    ///
    /// The owner is written only by the thread that holds the lock, so a
    /// thread always reads back its own identifier while it holds the lock,
    /// and never reads it otherwise.
    #[cfg(debug_assertions)]
    pub fn is_held_by_current(&self) -> bool {
        self.owner.load(Relaxed) == current_thread()
    }

    #[cfg(debug_assertions)]
    fn set_holder(&self) {
        debug_assert!(
            !self.is_held_by_current(),
            "allocation lock acquired twice by the same thread"
        );
        self.owner.store(current_thread(), Relaxed);
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn set_holder(&self) {}

    #[cfg(debug_assertions)]
    fn unset_holder(&self) {
        assert!(
            self.is_held_by_current(),
            "allocation lock released by a thread that does not hold it"
        );
        self.owner.store(NO_THREAD, Relaxed);
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn unset_holder(&self) {}
}

// SAFETY: Exclusion is entirely provided by the inner lock. The bookkeeping
// happens strictly inside the critical section.
unsafe impl<L: RawLock> RawLock for Tracked<L> {
    #[inline]
    fn lock(&self) {
        self.inner.lock();
        self.set_holder();
    }

    #[inline]
    fn try_lock(&self) -> bool {
        let acquired = self.inner.try_lock();
        if acquired {
            self.set_holder();
        }
        acquired
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.unset_holder();
        // SAFETY: Caller guaranteed that the current thread holds the lock.
        unsafe { self.inner.unlock() }
    }

    #[inline(always)]
    fn has_fast_path(&self) -> bool {
        self.inner.has_fast_path()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(all(not(loom), test, debug_assertions))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::Tracked;
    use crate::backend::{NativeMutex, SpinFlag};
    use crate::lock::RawLock;

    #[test]
    fn tracks_holder_across_lock_and_unlock() {
        let lock = Tracked::new(SpinFlag::<crate::relax::Spin>::new());
        assert!(!lock.is_held_by_current());
        lock.lock();
        assert!(lock.is_held_by_current());
        unsafe { lock.unlock() };
        assert!(!lock.is_held_by_current());
    }

    #[test]
    fn tracks_holder_of_try_lock() {
        let lock = Tracked::new(NativeMutex::new());
        assert!(lock.try_lock());
        assert!(lock.is_held_by_current());
        unsafe { lock.unlock() };
        assert!(!lock.is_held_by_current());
    }

    #[test]
    fn other_threads_are_not_holders() {
        let lock = Arc::new(Tracked::new(NativeMutex::new()));
        lock.lock();
        let c_lock = Arc::clone(&lock);
        let held = thread::spawn(move || c_lock.is_held_by_current()).join().unwrap();
        assert!(!held);
        unsafe { lock.unlock() };
    }

    #[test]
    #[should_panic = "released by a thread that does not hold it"]
    fn unlock_without_holding_asserts() {
        let lock = Tracked::new(NativeMutex::new());
        unsafe { lock.unlock() };
    }

    #[test]
    #[cfg(any(unix, windows))]
    #[should_panic = "acquired twice by the same thread"]
    fn recursive_acquisition_asserts() {
        // The only backend where a recursive acquisition does not deadlock.
        let lock = Tracked::new(crate::backend::CriticalSection::new());
        lock.lock();
        lock.lock();
    }
}
