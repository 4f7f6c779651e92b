use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use super::queue::WaitQueue;
use crate::cfg::atomic::AtomicBool;
use crate::lock::RawLock;
use crate::relax::{Relax, SleepBackoff};

/// A test-and-set lock over a single atomic flag.
///
/// Acquisition is an acquire-ordered test-and-set of the flag and release is
/// a release-ordered clear. When the test-and-set fails, the thread does not
/// keep hammering the flag. It enters a FIFO [`WaitQueue`] instead, and only
/// the thread at the head of the queue polls the flag, relaxing with `R`
/// between polls. The default, [`SleepBackoff`], ends up sleeping, so a long
/// critical section does not keep the waiters busy.
///
/// `try_lock` is a single test-and-set, which makes this backend the one
/// with the cheapest fast path.
pub struct SpinFlag<R = SleepBackoff> {
    locked: AtomicBool,
    waiters: WaitQueue,
    relax: PhantomData<R>,
}

// SAFETY: The only state is atomic, and the relax strategy is instantiated
// locally by each waiting thread.
unsafe impl<R> Send for SpinFlag<R> {}
unsafe impl<R> Sync for SpinFlag<R> {}

impl<R> SpinFlag<R> {
    /// Creates a new, unlocked flag.
    pub fn new() -> Self {
        let locked = AtomicBool::new(false);
        Self { locked, waiters: WaitQueue::new(), relax: PhantomData }
    }

    /// Returns `true` if some thread currently holds the flag.
    ///
    /// The answer may be stale by the time it is read.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

impl<R: Relax> SpinFlag<R> {
    /// Queues behind other contending threads, then polls the flag until the
    /// test-and-set succeeds.
    #[cold]
    fn lock_contended(&self) {
        tracing::trace!("allocation lock contended, queueing");
        let head = self.waiters.enter::<R>();
        let mut relax = R::new();
        loop {
            while self.locked.load(Relaxed) {
                relax.relax();
            }
            if self.try_lock() {
                break;
            }
        }
        drop(head);
    }
}

// SAFETY: The flag is set with an acquire-ordered swap, which only one
// thread can win until the flag is cleared with release ordering.
unsafe impl<R: Relax> RawLock for SpinFlag<R> {
    #[inline]
    fn lock(&self) {
        if !self.try_lock() {
            self.lock_contended();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Acquire)
    }

    #[inline]
    unsafe fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlocking a spin flag that is not held");
        self.locked.store(false, Release);
    }

    fn name(&self) -> &'static str {
        "spin-flag"
    }
}

#[cfg(not(tarpaulin_include))]
impl<R> Default for SpinFlag<R> {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for SpinFlag<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinFlag").field("locked", &self.is_locked()).finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::SpinFlag;
    use crate::relax::{Loop, Spin, SpinBackoff, Yield, YieldBackoff};
    use crate::test::tests;

    #[test]
    fn smoke() {
        tests::smoke::<SpinFlag>();
    }

    #[test]
    fn try_lock_fails_while_held() {
        tests::try_lock_fails_while_held::<SpinFlag>();
    }

    #[test]
    fn lots_and_lots_sleep_backoff() {
        tests::lots_and_lots::<SpinFlag>();
    }

    #[test]
    fn lots_and_lots_spin() {
        tests::lots_and_lots::<SpinFlag<Spin>>();
    }

    #[test]
    fn lots_and_lots_spin_backoff() {
        tests::lots_and_lots::<SpinFlag<SpinBackoff>>();
    }

    #[test]
    fn lots_and_lots_yield() {
        tests::lots_and_lots::<SpinFlag<Yield>>();
    }

    #[test]
    fn lots_and_lots_yield_backoff() {
        tests::lots_and_lots::<SpinFlag<YieldBackoff>>();
    }

    #[test]
    fn lots_and_lots_loop() {
        tests::lots_and_lots::<SpinFlag<Loop>>();
    }

    #[test]
    fn lots_and_lots_try_lock() {
        tests::lots_and_lots_try_lock::<SpinFlag>();
    }

    #[test]
    fn waiter_blocks_until_release() {
        tests::waiter_blocks_until_release::<SpinFlag>();
    }

    #[test]
    fn reports_locked_state() {
        use crate::lock::RawLock;
        let flag = SpinFlag::<Spin>::new();
        assert!(!flag.is_locked());
        flag.lock();
        assert!(flag.is_locked());
        unsafe { flag.unlock() };
        assert!(!flag.is_locked());
        assert_eq!(format!("{flag:?}"), "SpinFlag { locked: false, .. }");
    }
}
