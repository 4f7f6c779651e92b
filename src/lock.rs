//! The interface every locking strategy implements.

/// A raw, data-less mutual exclusion primitive.
///
/// This is the contract shared by all backends: [`lock`] does not return
/// until the calling thread holds the lock, [`try_lock`] returns promptly
/// whether or not it succeeded, and [`unlock`] never fails.
///
/// Locks are not reentrant. A thread that calls [`lock`] while it already
/// holds the lock will deadlock on most implementations.
///
/// # Safety
///
/// Implementations must guarantee mutual exclusion: while one thread holds
/// the lock, no other thread may return from [`lock`] or get `true` from
/// [`try_lock`]. A successful acquisition must synchronize with (be acquire
/// ordered after) the release-ordered [`unlock`] of the previous holder.
///
/// [`lock`]: RawLock::lock
/// [`try_lock`]: RawLock::try_lock
/// [`unlock`]: RawLock::unlock
pub unsafe trait RawLock {
    /// Acquires the lock, blocking the current thread until it is able to
    /// do so.
    fn lock(&self);

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `true` if the lock was acquired.
    fn try_lock(&self) -> bool;

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current thread.
    unsafe fn unlock(&self);

    /// Whether [`try_lock`] is a distinguishable, cheap fast path.
    ///
    /// When this is `false`, fast attempts against this lock degrade to the
    /// unconditional, blocking acquisition.
    ///
    /// [`try_lock`]: RawLock::try_lock
    #[inline(always)]
    fn has_fast_path(&self) -> bool {
        true
    }

    /// A short, human readable name of the strategy, used in logs.
    fn name(&self) -> &'static str;
}
