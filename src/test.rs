use core::cell::UnsafeCell;

use crate::lock::RawLock;

/// A counter that is deliberately not atomic.
///
/// Increments are a separate load and store, so two threads incrementing it
/// at the same time lose updates. Only a working lock keeps it exact.
pub struct Racy {
    value: UnsafeCell<u64>,
}

// SAFETY: Every access happens under a lock, which is what the tests verify.
unsafe impl Sync for Racy {}

impl Racy {
    pub const fn new() -> Self {
        Self { value: UnsafeCell::new(0) }
    }

    /// # Safety
    ///
    /// Caller must hold the lock protecting this counter.
    pub unsafe fn inc(&self) {
        let ptr = self.value.get();
        // SAFETY: Caller guaranteed exclusive access.
        unsafe { ptr.write_volatile(ptr.read_volatile() + 1) }
    }

    /// # Safety
    ///
    /// Caller must hold the lock protecting this counter.
    pub unsafe fn get(&self) -> u64 {
        // SAFETY: Caller guaranteed exclusive access.
        unsafe { self.value.get().read_volatile() }
    }
}

/// A lock and the counter it protects.
pub struct Guarded<L> {
    pub lock: L,
    pub counter: Racy,
}

impl<L: RawLock + Default> Guarded<L> {
    pub fn new() -> Self {
        Self { lock: L::default(), counter: Racy::new() }
    }

    /// Increments the counter under the blocking lock.
    pub fn inc(&self) {
        self.lock.lock();
        // SAFETY: We hold the lock.
        unsafe {
            self.counter.inc();
            self.lock.unlock();
        }
    }

    /// Increments the counter if the fast path acquires the lock.
    pub fn try_inc(&self) -> bool {
        let acquired = self.lock.try_lock();
        if acquired {
            // SAFETY: We hold the lock.
            unsafe {
                self.counter.inc();
                self.lock.unlock();
            }
        }
        acquired
    }

    pub fn get(&self) -> u64 {
        self.lock.lock();
        // SAFETY: We hold the lock.
        unsafe {
            let value = self.counter.get();
            self.lock.unlock();
            value
        }
    }
}

pub mod tests {
    // Shared test suite for every `RawLock` implementation, loosely modeled
    // after the Rust's Mutex test suite.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Guarded;
    use crate::lock::RawLock;

    const ITERS: u64 = 1000;
    const CONCURRENCY: u64 = 4;

    pub fn smoke<L: RawLock + Default>() {
        let lock = L::default();
        lock.lock();
        unsafe { lock.unlock() };
        assert!(lock.try_lock());
        unsafe { lock.unlock() };
        lock.lock();
        unsafe { lock.unlock() };
    }

    /// A held lock cannot be acquired through `try_lock` by another thread,
    /// and can once it is released.
    pub fn try_lock_fails_while_held<L>()
    where
        L: RawLock + Default + Send + Sync + 'static,
    {
        let lock = Arc::new(L::default());
        lock.lock();
        let c_lock = Arc::clone(&lock);
        let acquired = thread::spawn(move || {
            let acquired = c_lock.try_lock();
            if acquired {
                unsafe { c_lock.unlock() };
            }
            acquired
        })
        .join()
        .unwrap();
        assert!(!acquired);
        unsafe { lock.unlock() };
        let c_lock = Arc::clone(&lock);
        let acquired = thread::spawn(move || {
            let acquired = c_lock.try_lock();
            if acquired {
                unsafe { c_lock.unlock() };
            }
            acquired
        })
        .join()
        .unwrap();
        assert!(acquired);
    }

    /// Many threads incrementing a racy counter under the lock never lose an
    /// update.
    pub fn lots_and_lots<L>()
    where
        L: RawLock + Default + Send + Sync + 'static,
    {
        let data = Arc::new(Guarded::<L>::new());
        let (tx, rx) = channel();
        for _ in 0..CONCURRENCY {
            let data = Arc::clone(&data);
            let tx = tx.clone();
            thread::spawn(move || {
                for _ in 0..ITERS {
                    data.inc();
                }
                tx.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..CONCURRENCY {
            rx.recv().unwrap();
        }
        assert_eq!(data.get(), ITERS * CONCURRENCY);
    }

    /// Mixing fast attempts with blocking acquisitions never loses an update,
    /// and every successful attempt is counted exactly once.
    pub fn lots_and_lots_try_lock<L>()
    where
        L: RawLock + Default + Send + Sync + 'static,
    {
        let data = Arc::new(Guarded::<L>::new());
        let handles: Vec<_> = (0..CONCURRENCY)
            .map(|n| {
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    let mut count = 0;
                    for _ in 0..ITERS {
                        if n % 2 == 0 {
                            data.inc();
                            count += 1;
                        } else if data.try_inc() {
                            count += 1;
                        }
                    }
                    count
                })
            })
            .collect();
        let expected: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(data.get(), expected);
    }

    /// A blocking acquisition does not return before the holder releases.
    pub fn waiter_blocks_until_release<L>()
    where
        L: RawLock + Default + Send + Sync + 'static,
    {
        let lock = Arc::new(L::default());
        let released = Arc::new(AtomicBool::new(false));
        lock.lock();
        let c_lock = Arc::clone(&lock);
        let c_released = Arc::clone(&released);
        let waiter = thread::spawn(move || {
            c_lock.lock();
            let saw_release = c_released.load(Ordering::SeqCst);
            unsafe { c_lock.unlock() };
            saw_release
        });
        thread::sleep(Duration::from_millis(20));
        released.store(true, Ordering::SeqCst);
        unsafe { lock.unlock() };
        assert!(waiter.join().unwrap());
    }
}
