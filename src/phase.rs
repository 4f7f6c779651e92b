//! The collection-phase flag.

use core::sync::atomic::Ordering::{Acquire, Release};

use crate::cfg::atomic::AtomicBool;

/// Whether the collector is running a collection pass.
///
/// Only the thread holding the allocation lock sets or clears the flag.
/// Stores are release-ordered and loads acquire-ordered, so a store never
/// moves outside of the lock acquisition and release that surround it, and
/// a reader that sees the flag set also sees everything the collector did
/// before setting it.
#[derive(Debug)]
pub struct CollectionPhase {
    collecting: AtomicBool,
}

impl CollectionPhase {
    /// Creates a cleared flag.
    pub fn new() -> Self {
        Self { collecting: AtomicBool::new(false) }
    }

    /// Whether a collection pass is in progress.
    #[inline]
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Acquire)
    }

    pub(crate) fn enter(&self) {
        debug_assert!(!self.is_collecting(), "collection pass started twice");
        self.collecting.store(true, Release);
        tracing::trace!("collection pass started");
    }

    pub(crate) fn exit(&self) {
        debug_assert!(self.is_collecting(), "collection pass ended without being started");
        self.collecting.store(false, Release);
        tracing::trace!("collection pass finished");
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for CollectionPhase {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::CollectionPhase;

    #[test]
    fn toggles() {
        let phase = CollectionPhase::new();
        assert!(!phase.is_collecting());
        phase.enter();
        assert!(phase.is_collecting());
        phase.exit();
        assert!(!phase.is_collecting());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic = "collection pass started twice"]
    fn nested_enter_asserts() {
        let phase = CollectionPhase::new();
        phase.enter();
        phase.enter();
    }
}
