use std::cell::UnsafeCell;
use std::sync::Arc;

use alloclock::backend::{NativeMutex, SpinFlag};
use alloclock::{BackendKind, Config, RawLock, SyncContext};
use tracing_subscriber::EnvFilter;

const THREADS: usize = 8;
const INCREMENTS: u64 = 100_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Heap metadata stand-in: a counter updated with a plain load and store.
struct Heap<L> {
    ctx: SyncContext<L>,
    allocated: UnsafeCell<u64>,
}

// SAFETY: `allocated` is only accessed under `ctx`'s lock.
unsafe impl<L: RawLock + Sync> Sync for Heap<L> {}

impl<L: RawLock> Heap<L> {
    fn new(ctx: SyncContext<L>) -> Self {
        Self { ctx, allocated: UnsafeCell::new(0) }
    }

    fn alloc(&self) {
        self.ctx.with_lock(|| {
            assert!(!self.ctx.is_collecting());
            let ptr = self.allocated.get();
            unsafe { ptr.write_volatile(ptr.read_volatile() + 1) };
        });
    }

    fn alloc_fast_or_slow(&self) {
        let fast = self.ctx.fast_lock();
        if fast.succeeded() {
            let ptr = self.allocated.get();
            unsafe { ptr.write_volatile(ptr.read_volatile() + 1) };
            fast.release();
        } else {
            fast.release();
            self.alloc();
        }
    }

    fn allocated(&self) -> u64 {
        self.ctx.with_lock(|| unsafe { self.allocated.get().read_volatile() })
    }
}

fn hammer<L, F>(ctx: SyncContext<L>, op: F) -> u64
where
    L: RawLock + Send + Sync + 'static,
    F: Fn(&Heap<L>) + Copy + Send + 'static,
{
    init_tracing();
    let heap = Arc::new(Heap::new(ctx));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let c_heap = Arc::clone(&heap);
            heap.ctx.spawn(move || {
                for _ in 0..INCREMENTS {
                    op(&c_heap);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    heap.allocated()
}

#[test]
fn spin_flag_loses_no_update() {
    let total = hammer(SyncContext::new(<SpinFlag>::new()), Heap::alloc);
    assert_eq!(total, THREADS as u64 * INCREMENTS);
}

#[test]
fn native_mutex_loses_no_update() {
    let total = hammer(SyncContext::new(NativeMutex::new()), Heap::alloc);
    assert_eq!(total, THREADS as u64 * INCREMENTS);
}

#[test]
fn every_configured_backend_loses_no_update() {
    for kind in BackendKind::ALL.into_iter().filter(|kind| kind.is_available()) {
        let ctx = Config::new().backend(kind).build().unwrap();
        let total = hammer(ctx, Heap::alloc);
        assert_eq!(total, THREADS as u64 * INCREMENTS, "backend {kind}");
    }
}

#[test]
fn fast_attempts_lose_no_update() {
    for kind in BackendKind::ALL.into_iter().filter(|kind| kind.is_available()) {
        let ctx = Config::new().backend(kind).build().unwrap();
        let total = hammer(ctx, Heap::alloc_fast_or_slow);
        assert_eq!(total, THREADS as u64 * INCREMENTS, "backend {kind}");
    }
}

#[test]
fn collection_passes_interleave_with_allocations() {
    init_tracing();
    let heap = Arc::new(Heap::new(SyncContext::new(<SpinFlag>::new())));
    let c_heap = Arc::clone(&heap);
    let collector = heap.ctx.spawn(move || {
        for _ in 0..1000 {
            c_heap.ctx.collect_with(|| {
                assert!(c_heap.ctx.is_collecting());
                // A collection pass sees a stable heap.
                let before = unsafe { c_heap.allocated.get().read_volatile() };
                std::hint::spin_loop();
                let after = unsafe { c_heap.allocated.get().read_volatile() };
                assert_eq!(before, after);
            });
        }
    });
    for _ in 0..INCREMENTS {
        heap.alloc();
    }
    collector.join().unwrap();
    assert_eq!(heap.allocated(), INCREMENTS);
    assert!(!heap.ctx.is_collecting());
}

#[test]
fn single_thread_is_correct_while_elided() {
    let heap = Heap::new(SyncContext::new(NativeMutex::new()));
    for _ in 0..INCREMENTS {
        heap.alloc_fast_or_slow();
    }
    assert!(!heap.ctx.locking_required());
    assert!(!heap.ctx.backend().is_locked());
    assert_eq!(heap.allocated(), INCREMENTS);
}
