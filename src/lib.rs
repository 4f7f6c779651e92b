//! Mutual exclusion and collection-phase tracking for the internal state of
//! a concurrent memory allocator and its garbage collector.
//!
//! Any number of threads may call into the allocator and the collector at
//! the same time, and their heap metadata must only ever be touched by one
//! of them. This crate provides the lock that serializes those accesses,
//! tuned for the range of processes an allocator finds itself in:
//!
//! - a single-threaded process pays nothing: until a second thread exists,
//!   lock operations are elided;
//! - a lightly loaded process mostly takes the lock through a cheap,
//!   non-blocking fast attempt;
//! - a heavily contended process queues its waiters instead of letting them
//!   spin, through the native mutex or the queued spin-flag escalation.
//!
//! The whole state lives in a [`SyncContext`], an explicit object owned by
//! the allocator: the lock itself, the elision flag and the collection-phase
//! flag.
//!
//! ## Lock backends
//!
//! The lock strategy is a [`RawLock`] implementation, picked either at build
//! time by naming its type or once at startup through [`Backend`] and
//! [`Config`]:
//!
//! - [`backend::NativeMutex`]: a parking mutex;
//! - [`backend::SpinFlag`]: an atomic test-and-set flag whose contended path
//!   queues and relaxes according to a [`relax`] strategy;
//! - `backend::CriticalSection`: the OS critical section or recursive
//!   pthread mutex.
//!
//! ## Locking
//!
//! ```
//! use alloclock::backend::BackendKind;
//! use alloclock::Config;
//!
//! let ctx = Config::new().backend(BackendKind::Native).build()?;
//!
//! // Single-threaded so far: the lock is elided.
//! assert!(!ctx.locking_required());
//! ctx.with_lock(|| {
//!     // Touch the heap metadata.
//! });
//!
//! // Starting a thread through the context turns locking on.
//! ctx.spawn(|| ()).join().expect("thread::spawn failed");
//! assert!(ctx.locking_required());
//!
//! // Fast attempts may fail, and are released whatever the outcome.
//! let fast = ctx.fast_lock();
//! if fast.succeeded() {
//!     // Touch the heap metadata.
//! }
//! fast.release();
//!
//! // A collection pass runs under the lock with the phase flag set.
//! ctx.collect_with(|| assert!(ctx.is_collecting()));
//! assert!(!ctx.is_collecting());
//! # Ok::<(), alloclock::Error>(())
//! ```
//!
//! ## Debug assertions
//!
//! With `debug_assertions` enabled, the lock records the thread that holds
//! it. Releasing the lock from a thread that does not hold it, acquiring it
//! twice from the same thread where the backend would allow it, or toggling
//! the collection phase without holding the lock, are assertion failures.
//! `SyncContext::holds_lock` exposes the predicate. None of this exists in
//! release builds.
//!
//! ## Logging
//!
//! The crate emits [`tracing`] events on the cold paths only: backend
//! selection, the end of lock elision, contention escalation, collection
//! passes and fatal OS errors.

#![allow(clippy::doc_markdown)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(missing_docs)]
#![warn(rust_2024_compatibility)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

pub mod backend;
pub mod relax;

mod config;
mod context;
mod elision;
mod error;
mod holder;
mod lock;
mod phase;

pub(crate) mod cfg;

pub use backend::{Backend, BackendKind};
pub use config::{Config, BACKEND_ENV, MULTITHREADED_ENV};
pub use context::{FastLock, LockGuard, SyncContext};
pub use error::Error;
pub use holder::Tracked;
pub use lock::RawLock;

#[cfg(all(not(loom), test))]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
pub(crate) mod loom;
