//! Loom models of the spin flag and its wait queue.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test --release --lib`.

use loom::cell::UnsafeCell;
use loom::sync::Arc;
use loom::{model, thread};

use crate::backend::SpinFlag;
use crate::lock::RawLock;
use crate::relax::{Relax, SleepBackoff, Spin, SpinBackoff, Yield, YieldBackoff};

type Int = usize;
const THREADS: Int = 3;

/// A counter protected by a raw lock, with Loom tracking every access.
struct Guarded<L> {
    lock: L,
    data: UnsafeCell<Int>,
}

// SAFETY: Loom verifies that accesses to `data` are serialized by `lock`.
unsafe impl<L: Sync> Sync for Guarded<L> {}

impl<L: RawLock> Guarded<L> {
    fn inc(&self) {
        self.lock.lock();
        // SAFETY: We hold the lock.
        self.data.with_mut(|data| unsafe { *data += 1 });
        unsafe { self.lock.unlock() };
    }

    fn try_inc(&self) -> bool {
        let acquired = self.lock.try_lock();
        if acquired {
            // SAFETY: We hold the lock.
            self.data.with_mut(|data| unsafe { *data += 1 });
            unsafe { self.lock.unlock() };
        }
        acquired
    }

    fn get(&self) -> Int {
        self.lock.lock();
        // SAFETY: We hold the lock.
        let value = self.data.with(|data| unsafe { *data });
        unsafe { self.lock.unlock() };
        value
    }
}

/// Concurrent blocking acquisitions serialize every mutation, including the
/// ones that go through the queued escalation path.
fn lock_join<R: Relax + 'static>() {
    model(|| {
        let guarded = Arc::new(Guarded { lock: SpinFlag::<R>::new(), data: UnsafeCell::new(0) });
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let guarded = Arc::clone(&guarded);
                thread::spawn(move || guarded.inc())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(guarded.get(), THREADS);
    });
}

#[test]
fn lock_join_spin() {
    lock_join::<Spin>();
}

#[test]
fn lock_join_spin_backoff() {
    lock_join::<SpinBackoff>();
}

#[test]
fn lock_join_yield() {
    lock_join::<Yield>();
}

#[test]
fn lock_join_yield_backoff() {
    lock_join::<YieldBackoff>();
}

#[test]
fn lock_join_sleep_backoff() {
    lock_join::<SleepBackoff>();
}

/// A successful fast attempt is exclusive, and a failed one touches nothing.
#[test]
fn try_lock_join() {
    model(|| {
        let guarded = Arc::new(Guarded { lock: SpinFlag::<Spin>::new(), data: UnsafeCell::new(0) });
        let c_guarded = Arc::clone(&guarded);
        let handle = thread::spawn(move || c_guarded.try_inc());
        let mine = guarded.try_inc();
        let theirs = handle.join().unwrap();
        assert_eq!(guarded.get(), Int::from(mine) + Int::from(theirs));
    });
}
