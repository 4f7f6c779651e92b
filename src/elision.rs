//! Skipping synchronization while the process runs a single thread.

use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use crate::cfg::atomic::{AtomicBool, AtomicUsize};

/// The "more than one thread may be running" flag.
///
/// While the flag is clear, locking the allocation lock is a no-op: the only
/// thread cannot race with itself. The flag is set, once, by whatever creates
/// the second thread, and it must be set before that thread starts. Spawning
/// a thread synchronizes the spawner with the new thread, so the new thread
/// always observes the flag set.
///
/// Clearing the flag again is not supported.
///
/// The flag also counts the scoped sections (guards and fast tokens) that
/// were entered while elided and are still open. If the flag is set while
/// such sections are open, the context acquires the real lock on their
/// behalf, and the last of them to close gives it back. The count is only
/// ever modified by the single thread that exists while elided, and by that
/// same thread as it closes its sections after the transition.
#[derive(Debug)]
pub struct Elision {
    need_to_lock: AtomicBool,
    open: AtomicUsize,
    promoted: AtomicBool,
}

impl Elision {
    /// Creates the flag, set if the process is already `multithreaded`.
    pub fn new(multithreaded: bool) -> Self {
        Self {
            need_to_lock: AtomicBool::new(multithreaded),
            open: AtomicUsize::new(0),
            promoted: AtomicBool::new(false),
        }
    }

    /// Records that a scoped section was entered while elided.
    #[inline]
    pub fn enter_section(&self) {
        // Only one thread runs while elided, a plain load and store suffice.
        self.open.store(self.open.load(Relaxed) + 1, Relaxed);
    }

    /// Records that a section entered while elided was closed.
    ///
    /// Returns `true` if it was the last one open and the lock was acquired
    /// on its behalf, in which case the caller must now release it.
    #[inline]
    pub fn exit_section(&self) -> bool {
        let open = self.open.load(Relaxed);
        debug_assert!(open > 0, "elided section closed more often than opened");
        self.open.store(open - 1, Relaxed);
        open == 1 && self.promoted.swap(false, Relaxed)
    }

    /// Whether any section entered while elided is still open.
    pub fn has_open_sections(&self) -> bool {
        self.open.load(Relaxed) > 0
    }

    /// Records that the lock was acquired on behalf of the open sections.
    pub fn promote(&self) {
        debug_assert!(self.has_open_sections(), "no elided section to acquire the lock for");
        self.promoted.store(true, Relaxed);
    }

    /// Whether lock operations must really synchronize.
    #[inline(always)]
    pub fn is_required(&self) -> bool {
        self.need_to_lock.load(Acquire)
    }

    /// Marks locking as required from now on.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn require(&self) -> bool {
        let transitioned = !self.need_to_lock.swap(true, AcqRel);
        if transitioned {
            tracing::debug!("second thread started, allocation lock is no longer elided");
        }
        transitioned
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::Elision;

    #[test]
    fn starts_from_configuration() {
        assert!(!Elision::new(false).is_required());
        assert!(Elision::new(true).is_required());
    }

    #[test]
    fn transitions_once() {
        let elision = Elision::new(false);
        assert!(elision.require());
        assert!(elision.is_required());
        assert!(!elision.require());
        assert!(elision.is_required());
    }

    #[test]
    fn last_section_releases_promoted_lock() {
        let elision = Elision::new(false);
        elision.enter_section();
        elision.enter_section();
        assert!(elision.has_open_sections());
        elision.promote();
        assert!(!elision.exit_section());
        assert!(elision.exit_section());
        assert!(!elision.has_open_sections());
    }

    #[test]
    fn sections_without_promotion_release_nothing() {
        let elision = Elision::new(false);
        elision.enter_section();
        assert!(!elision.exit_section());
        assert!(!elision.has_open_sections());
    }
}
