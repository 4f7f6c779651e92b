//! The FIFO wait queue a contended [`SpinFlag`] escalates into.
//!
//! This is a CLH queue without protected data. Every waiter appends a heap
//! allocated node at the tail and polls only its predecessor's node, so at
//! any time a single waiter, the queue head, polls the lock flag itself.
//! Ownership of a node moves from a thread to its successor on release,
//! which is why nodes cannot live on the stack: a predecessor may be gone by
//! the time its successor reads its node.
//!
//! [`SpinFlag`]: super::SpinFlag

use alloc::boxed::Box;

use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::cfg::atomic::{fence, AtomicBool, AtomicPtr, UnsyncLoad};
use crate::relax::Relax;

/// A heap allocated queue node.
struct Node {
    waiting: AtomicBool,
}

impl Node {
    /// Allocates a node, leaking it as a raw, non-null pointer.
    ///
    /// The caller is responsible for freeing it through [`Node::free`].
    fn alloc(waiting: bool) -> NonNull<Self> {
        let node = Box::new(Self { waiting: AtomicBool::new(waiting) });
        // SAFETY: `Box::into_raw` never returns a null pointer.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }

    /// Frees a node allocated by [`Node::alloc`].
    ///
    /// # Safety
    ///
    /// `node` must have been returned by `Node::alloc`, no other thread may
    /// access it anymore, and it must not be freed twice.
    unsafe fn free(node: NonNull<Self>) {
        // SAFETY: Caller guaranteed the pointer came from `Box::into_raw` and
        // that this is the only remaining reference to it.
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }
}

/// A FIFO queue of threads waiting on a contended lock.
pub(crate) struct WaitQueue {
    tail: AtomicPtr<Node>,
}

// SAFETY: Nodes are only shared through the atomic tail and are handed over
// between threads by the queue protocol.
unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl WaitQueue {
    /// Creates an empty queue.
    pub(crate) fn new() -> Self {
        let sentinel = Node::alloc(false);
        Self { tail: AtomicPtr::new(sentinel.as_ptr()) }
    }

    /// Appends the current thread to the queue and waits, relaxing with `R`,
    /// until every thread that entered before it has left.
    pub(crate) fn enter<R: Relax>(&self) -> QueueHead<'_> {
        let node = Node::alloc(true);
        let pred = self.tail.swap(node.as_ptr(), AcqRel);
        // SAFETY: The tail is initialized with a valid allocation and every
        // tail update stores a valid allocation. The predecessor node is only
        // freed by its successor, which is us.
        let pred = unsafe { NonNull::new_unchecked(pred) };
        // SAFETY: Same as above, `pred` stays allocated until we free it.
        let waiting = unsafe { &pred.as_ref().waiting };
        let mut relax = R::new();
        while waiting.load(Relaxed) {
            relax.relax();
        }
        fence(Acquire);
        QueueHead { node, pred, queue: PhantomData }
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        let tail = self.tail.load_unsynced();
        // SAFETY: The tail always points to a valid allocation, and with an
        // exclusive reference no thread can be queued anymore. Every other
        // node was freed by its successor.
        unsafe { Node::free(NonNull::new_unchecked(tail)) }
    }
}

/// The position of the thread at the head of a [`WaitQueue`].
///
/// Dropping it lets the next waiter through.
#[must_use = "dropping the head immediately lets the next waiter through"]
pub(crate) struct QueueHead<'a> {
    node: NonNull<Node>,
    pred: NonNull<Node>,
    queue: PhantomData<&'a WaitQueue>,
}

impl Drop for QueueHead<'_> {
    fn drop(&mut self) {
        // SAFETY: Our own node stays allocated until our successor, or the
        // queue itself, frees it.
        unsafe { self.node.as_ref() }.waiting.store(false, Release);
        // SAFETY: We were the only thread that could still read the
        // predecessor node, and we are done with it.
        unsafe { Node::free(self.pred) }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::WaitQueue;
    use crate::relax::{Spin, Yield};

    #[test]
    fn enters_uncontended() {
        let queue = WaitQueue::new();
        drop(queue.enter::<Spin>());
        drop(queue.enter::<Spin>());
    }

    #[test]
    fn admits_one_head_at_a_time() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 500;
        let queue = Arc::new(WaitQueue::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let head = queue.enter::<Yield>();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        drop(head);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
