use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use std::thread::{self, JoinHandle};

use crate::backend::Backend;
use crate::elision::Elision;
use crate::holder::Tracked;
use crate::lock::RawLock;
use crate::phase::CollectionPhase;

/// The synchronization state of an allocator/collector pair.
///
/// A context owns the allocation lock, the elision flag and the
/// collection-phase flag. It is created once, when the allocator is
/// initialized, and shared by reference (or `Arc`) with every thread that
/// calls into the allocator or the collector. The borrow checker keeps it
/// alive for as long as any thread may still lock it.
///
/// The allocation lock is **not** reentrant. Acquiring it twice from the
/// same thread deadlocks, or is an assertion failure in debug builds where
/// it can be detected.
///
/// # Example
///
/// ```
/// use std::cell::UnsafeCell;
/// use std::sync::Arc;
///
/// use alloclock::{backend::NativeMutex, SyncContext};
///
/// struct Heap {
///     ctx: SyncContext<NativeMutex>,
///     free_bytes: UnsafeCell<usize>,
/// }
///
/// // SAFETY: `free_bytes` is only accessed under `ctx`'s lock.
/// unsafe impl Sync for Heap {}
///
/// let heap = Arc::new(Heap {
///     ctx: SyncContext::new(NativeMutex::new()),
///     free_bytes: UnsafeCell::new(4096),
/// });
///
/// let c_heap = Arc::clone(&heap);
/// heap.ctx.spawn(move || {
///     c_heap.ctx.with_lock(|| unsafe { *c_heap.free_bytes.get() -= 64 });
/// })
/// .join()
/// .expect("thread::spawn failed");
///
/// let free = heap.ctx.with_lock(|| unsafe { *heap.free_bytes.get() });
/// assert_eq!(free, 4032);
/// ```
pub struct SyncContext<L = Backend> {
    lock: Tracked<L>,
    elision: Elision,
    phase: CollectionPhase,
}

impl<L: RawLock> SyncContext<L> {
    /// Creates a context for a process that runs a single thread so far.
    ///
    /// Lock operations are elided until [`require_locking`] is called or a
    /// thread is started through [`spawn`].
    ///
    /// [`require_locking`]: SyncContext::require_locking
    /// [`spawn`]: SyncContext::spawn
    pub fn new(lock: L) -> Self {
        Self::with_elision(lock, false)
    }

    /// Creates a context, stating whether more than one thread may already
    /// be running.
    pub fn with_elision(lock: L, multithreaded: bool) -> Self {
        tracing::debug!(backend = lock.name(), multithreaded, "allocation lock initialized");
        let lock = Tracked::new(lock);
        Self { lock, elision: Elision::new(multithreaded), phase: CollectionPhase::new() }
    }

    /// Returns a reference to the underlying lock strategy.
    pub fn backend(&self) -> &L {
        self.lock.inner()
    }

    /// Whether lock operations currently synchronize.
    #[inline]
    pub fn locking_required(&self) -> bool {
        self.elision.is_required()
    }

    /// Disables lock elision for the rest of the context's life.
    ///
    /// Thread creation machinery must call this before the second thread
    /// starts running. Returns `true` if this call performed the transition.
    ///
    /// If the calling thread is inside scoped sections entered while elided
    /// ([`lock_guard`], [`with_lock`], [`collect_with`] or an elided
    /// [`fast_lock`]), the lock is acquired here on their behalf and given
    /// back when the outermost of them ends. Those sections stay exclusive,
    /// and the new thread blocks on the lock until then.
    ///
    /// [`lock_guard`]: SyncContext::lock_guard
    /// [`with_lock`]: SyncContext::with_lock
    /// [`collect_with`]: SyncContext::collect_with
    /// [`fast_lock`]: SyncContext::fast_lock
    pub fn require_locking(&self) -> bool {
        let transitioned = self.elision.require();
        if transitioned && self.elision.has_open_sections() {
            self.lock.lock();
            self.elision.promote();
            tracing::debug!("allocation lock acquired for sections entered while elided");
        }
        transitioned
    }

    /// Spawns a thread, disabling lock elision first.
    ///
    /// This is [`std::thread::spawn`] preceded by [`require_locking`]. When
    /// called inside a section entered while elided, the calling thread
    /// holds the lock from here until that section ends, so joining a thread
    /// that takes the lock before then deadlocks.
    ///
    /// [`require_locking`]: SyncContext::require_locking
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.require_locking();
        thread::spawn(f)
    }

    /// Acquires the allocation lock, blocking the current thread until it
    /// is able to do so.
    ///
    /// Does nothing while locking is elided. Every call must be paired with
    /// one call to [`unlock`] from the same thread. Prefer [`lock_guard`] or
    /// [`with_lock`], which pair them automatically.
    ///
    /// [`unlock`]: SyncContext::unlock
    /// [`lock_guard`]: SyncContext::lock_guard
    /// [`with_lock`]: SyncContext::with_lock
    #[inline]
    pub fn lock(&self) {
        if self.locking_required() {
            self.lock.lock();
        }
    }

    /// Releases the allocation lock.
    ///
    /// Does nothing while locking is elided. Debug builds assert that the
    /// calling thread holds the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock through [`lock`], and elision
    /// must not have been disabled in between.
    ///
    /// [`lock`]: SyncContext::lock
    #[inline]
    pub unsafe fn unlock(&self) {
        if self.locking_required() {
            // SAFETY: Caller guaranteed that it holds the lock.
            unsafe { self.lock.unlock() }
        }
    }

    /// Acquires the allocation lock, returning a guard that releases it when
    /// dropped.
    ///
    /// The guard remembers whether the lock was really acquired. A guard
    /// taken while locking was elided does not release the lock itself, but
    /// if elision ends before it is dropped, see [`require_locking`].
    ///
    /// [`require_locking`]: SyncContext::require_locking
    #[inline]
    pub fn lock_guard(&self) -> LockGuard<'_, L> {
        let acquired = self.locking_required();
        if acquired {
            self.lock.lock();
        } else {
            self.elision.enter_section();
        }
        LockGuard { ctx: self, acquired, marker: PhantomData }
    }

    /// Runs `f` while holding the allocation lock.
    ///
    /// The lock is released when `f` returns or unwinds.
    pub fn with_lock<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce() -> Ret,
    {
        let _guard = self.lock_guard();
        f()
    }

    /// Attempts to acquire the allocation lock without blocking.
    ///
    /// The attempt returns promptly and may fail; check
    /// [`FastLock::succeeded`] before touching protected state. The returned
    /// token must be released (or dropped) whether or not it succeeded.
    ///
    /// While locking is elided the attempt always succeeds. If the backend
    /// has no fast path, the attempt degrades to [`lock`] and always
    /// succeeds, so callers must never depend on the attempt failing.
    ///
    /// Code running under a fast lock must not be interrupted in a way that
    /// touches the protected state, for example from a signal handler. That
    /// is up to the caller.
    ///
    /// [`lock`]: SyncContext::lock
    #[inline]
    pub fn fast_lock(&self) -> FastLock<'_, L> {
        let state = if !self.locking_required() {
            self.elision.enter_section();
            FastState::Elided
        } else if !self.lock.has_fast_path() {
            self.lock.lock();
            FastState::Held
        } else if self.lock.try_lock() {
            FastState::Held
        } else {
            FastState::Missed
        };
        FastLock { ctx: self, state, marker: PhantomData }
    }

    /// Whether the calling thread holds the allocation lock.
    ///
    /// Always `true` while locking is elided, and inside a section entered
    /// while elided that outlived the transition. Only exists in debug
    /// builds.
    #[cfg(debug_assertions)]
    pub fn holds_lock(&self) -> bool {
        !self.locking_required() || self.lock.is_held_by_current()
    }

    /// Whether a collection pass is in progress.
    ///
    /// Allocation paths consult this to detect allocation from within a
    /// collection pass.
    #[inline]
    pub fn is_collecting(&self) -> bool {
        self.phase.is_collecting()
    }

    /// Marks the start of a collection pass.
    ///
    /// Must be called by the thread holding the allocation lock, and paired
    /// with [`exit_collection`] before that thread releases it. Debug builds
    /// assert both, and that no pass is already in progress.
    ///
    /// [`exit_collection`]: SyncContext::exit_collection
    pub fn enter_collection(&self) {
        #[cfg(debug_assertions)]
        debug_assert!(
            self.holds_lock(),
            "collection pass started without holding the allocation lock"
        );
        self.phase.enter();
    }

    /// Marks the end of a collection pass.
    ///
    /// Must be called by the thread that started it, still holding the
    /// allocation lock.
    pub fn exit_collection(&self) {
        #[cfg(debug_assertions)]
        debug_assert!(
            self.holds_lock(),
            "collection pass ended without holding the allocation lock"
        );
        self.phase.exit();
    }

    /// Acquires the allocation lock and runs `f` as a collection pass.
    ///
    /// The phase flag is set for the duration of `f` and cleared before the
    /// lock is released, also when `f` unwinds.
    pub fn collect_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce() -> Ret,
    {
        let guard = self.lock_guard();
        let pass = CollectionPass::enter(self);
        let ret = f();
        drop(pass);
        drop(guard);
        ret
    }
}

impl<L: RawLock + Default> Default for SyncContext<L> {
    fn default() -> Self {
        Self::new(L::default())
    }
}

impl<L: RawLock> SyncContext<L> {
    /// Ends a section entered while elided, releasing the lock if it was
    /// acquired on behalf of the open sections and this was the last one.
    #[inline]
    fn exit_elided_section(&self) {
        if self.elision.exit_section() {
            // SAFETY: `require_locking` acquired the lock on this thread for
            // the open sections, and the last of them releases it once.
            unsafe { self.lock.unlock() }
        }
    }
}

impl<L: RawLock> Debug for SyncContext<L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("backend", &self.lock.name())
            .field("locking_required", &self.locking_required())
            .field("collecting", &self.is_collecting())
            .finish()
    }
}

/// Clears the phase flag when dropped.
struct CollectionPass<'a, L: RawLock> {
    ctx: &'a SyncContext<L>,
}

impl<'a, L: RawLock> CollectionPass<'a, L> {
    fn enter(ctx: &'a SyncContext<L>) -> Self {
        ctx.enter_collection();
        Self { ctx }
    }
}

impl<L: RawLock> Drop for CollectionPass<'_, L> {
    fn drop(&mut self) {
        self.ctx.exit_collection();
    }
}

/// An RAII implementation of a "scoped lock" of the allocation lock. When
/// this structure is dropped (falls out of scope), the lock is released.
///
/// The guard is neither `Send` nor `Sync`: the lock must be released by the
/// thread that acquired it.
#[must_use = "if unused the allocation lock will immediately unlock"]
pub struct LockGuard<'a, L: RawLock> {
    ctx: &'a SyncContext<L>,
    acquired: bool,
    marker: PhantomData<*const ()>,
}

impl<L: RawLock> LockGuard<'_, L> {
    /// Whether the guard really holds the lock, as opposed to being elided.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }
}

impl<L: RawLock> Drop for LockGuard<'_, L> {
    #[inline]
    fn drop(&mut self) {
        if self.acquired {
            // SAFETY: This guard acquired the lock, on this thread, and
            // releases it exactly once.
            unsafe { self.ctx.lock.unlock() }
        } else {
            self.ctx.exit_elided_section();
        }
    }
}

impl<L: RawLock> Debug for LockGuard<'_, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("acquired", &self.acquired).finish()
    }
}

/// The outcome of a fast attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FastState {
    /// Locking is elided, nothing was acquired nor needs to be.
    Elided,
    /// The lock was acquired.
    Held,
    /// The lock was busy.
    Missed,
}

/// The token of a [`fast_lock`] attempt.
///
/// Query [`succeeded`] once, then call [`release`] or drop the token. The
/// release happens exactly once, whatever the outcome, and only gives the
/// lock back if the attempt acquired it. The token is neither `Send` nor
/// `Sync`.
///
/// [`fast_lock`]: SyncContext::fast_lock
/// [`succeeded`]: FastLock::succeeded
/// [`release`]: FastLock::release
#[must_use = "a fast attempt must be checked with `succeeded` before touching protected state"]
pub struct FastLock<'a, L: RawLock> {
    ctx: &'a SyncContext<L>,
    state: FastState,
    marker: PhantomData<*const ()>,
}

impl<L: RawLock> FastLock<'_, L> {
    /// Whether the attempt obtained exclusive access.
    ///
    /// When `false`, the protected state must not be touched.
    #[inline]
    pub fn succeeded(&self) -> bool {
        self.state != FastState::Missed
    }

    /// Ends the fast attempt, releasing the lock if it was acquired.
    #[inline]
    pub fn release(self) {
        drop(self);
    }
}

impl<L: RawLock> Drop for FastLock<'_, L> {
    #[inline]
    fn drop(&mut self) {
        match self.state {
            FastState::Held => {
                // SAFETY: This attempt acquired the lock, on this thread, and
                // releases it exactly once.
                unsafe { self.ctx.lock.unlock() }
            }
            FastState::Elided => self.ctx.exit_elided_section(),
            FastState::Missed => {}
        }
    }
}

impl<L: RawLock> Debug for FastLock<'_, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastLock").field("succeeded", &self.succeeded()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc, Barrier};
    use std::thread;

    use super::SyncContext;
    use crate::backend::{NativeMutex, SpinFlag};
    use crate::lock::RawLock;

    fn multithreaded<L: RawLock + Default>() -> SyncContext<L> {
        SyncContext::with_elision(L::default(), true)
    }

    #[test]
    fn elided_lock_does_not_touch_backend() {
        let ctx = SyncContext::new(NativeMutex::new());
        assert!(!ctx.locking_required());
        ctx.lock();
        assert!(!ctx.backend().is_locked());
        // Elided locks are not reentrant-unsafe: nothing is held.
        ctx.lock();
        unsafe {
            ctx.unlock();
            ctx.unlock();
        }
        assert!(!ctx.backend().is_locked());
    }

    #[test]
    fn required_lock_holds_backend() {
        let ctx = multithreaded::<NativeMutex>();
        ctx.lock();
        assert!(ctx.backend().is_locked());
        unsafe { ctx.unlock() };
        assert!(!ctx.backend().is_locked());
    }

    #[test]
    fn spawn_disables_elision() {
        let ctx = SyncContext::new(NativeMutex::new());
        ctx.spawn(|| ()).join().unwrap();
        assert!(ctx.locking_required());
        let guard = ctx.lock_guard();
        assert!(guard.is_acquired());
        assert!(ctx.backend().is_locked());
    }

    #[test]
    fn guard_taken_while_elided_is_not_released_twice() {
        let ctx = SyncContext::new(NativeMutex::new());
        let guard = ctx.lock_guard();
        assert!(!guard.is_acquired());
        drop(guard);
        assert!(ctx.require_locking());
        assert!(!ctx.backend().is_locked());
    }

    #[test]
    fn transition_inside_elided_guard_takes_lock() {
        let ctx = SyncContext::new(NativeMutex::new());
        let outer = ctx.lock_guard();
        let inner = ctx.lock_guard();
        assert!(!ctx.backend().is_locked());
        assert!(ctx.require_locking());
        assert!(ctx.backend().is_locked());
        drop(inner);
        assert!(ctx.backend().is_locked());
        drop(outer);
        assert!(!ctx.backend().is_locked());
    }

    #[test]
    fn transition_inside_elided_fast_lock_takes_lock() {
        let ctx = SyncContext::new(SpinFlag::<crate::relax::Spin>::new());
        let fast = ctx.fast_lock();
        assert!(fast.succeeded());
        ctx.spawn(|| ()).join().unwrap();
        assert!(ctx.backend().is_locked());
        fast.release();
        assert!(!ctx.backend().is_locked());
    }

    #[test]
    fn spawned_thread_waits_for_elided_section() {
        let ctx = Arc::new(SyncContext::new(NativeMutex::new()));
        let inside = Arc::new(AtomicBool::new(true));
        let guard = ctx.lock_guard();
        let c_ctx = Arc::clone(&ctx);
        let c_inside = Arc::clone(&inside);
        let waiter = ctx.spawn(move || c_ctx.with_lock(|| c_inside.load(Ordering::SeqCst)));
        thread::sleep(std::time::Duration::from_millis(20));
        inside.store(false, Ordering::SeqCst);
        drop(guard);
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn collect_with_may_spawn() {
        let ctx = SyncContext::new(NativeMutex::new());
        let locked = ctx.collect_with(|| {
            ctx.spawn(|| ()).join().unwrap();
            ctx.is_collecting() && ctx.backend().is_locked()
        });
        assert!(locked);
        assert!(ctx.locking_required());
        assert!(!ctx.is_collecting());
        assert!(!ctx.backend().is_locked());
    }

    #[test]
    fn with_lock_releases_on_unwind() {
        let ctx = Arc::new(multithreaded::<NativeMutex>());
        let c_ctx = Arc::clone(&ctx);
        let result = thread::spawn(move || c_ctx.with_lock(|| panic!())).join();
        assert!(result.is_err());
        assert!(!ctx.backend().is_locked());
    }

    #[test]
    fn fast_lock_elided_succeeds() {
        let ctx = SyncContext::new(SpinFlag::<crate::relax::Spin>::new());
        let fast = ctx.fast_lock();
        assert!(fast.succeeded());
        assert!(!ctx.backend().is_locked());
        fast.release();
    }

    #[test]
    fn fast_lock_succeeds_uncontended() {
        let ctx = multithreaded::<SpinFlag>();
        let fast = ctx.fast_lock();
        assert!(fast.succeeded());
        assert!(ctx.backend().is_locked());
        fast.release();
        assert!(!ctx.backend().is_locked());
    }

    #[test]
    fn fast_lock_fails_honestly_when_held() {
        let ctx = Arc::new(multithreaded::<SpinFlag>());
        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let c_ctx = Arc::clone(&ctx);
        let holder = thread::spawn(move || {
            let _guard = c_ctx.lock_guard();
            locked_tx.send(()).unwrap();
            done_rx.recv().unwrap();
        });
        locked_rx.recv().unwrap();
        let fast = ctx.fast_lock();
        assert!(!fast.succeeded());
        fast.release();
        // A failed attempt releases nothing: the holder still holds it.
        assert!(ctx.backend().is_locked());
        done_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(!ctx.backend().is_locked());
    }

    #[test]
    #[cfg(any(unix, windows))]
    fn fast_lock_degrades_without_fast_path() {
        use crate::backend::CriticalSection;

        let ctx = Arc::new(multithreaded::<CriticalSection>());
        let barrier = Arc::new(Barrier::new(2));
        let released = Arc::new(AtomicBool::new(false));
        let c_ctx = Arc::clone(&ctx);
        let c_barrier = Arc::clone(&barrier);
        let c_released = Arc::clone(&released);
        let holder = thread::spawn(move || {
            let guard = c_ctx.lock_guard();
            c_barrier.wait();
            thread::sleep(std::time::Duration::from_millis(20));
            c_released.store(true, Ordering::SeqCst);
            drop(guard);
        });
        barrier.wait();
        // Blocks until the holder releases, then reports success.
        let fast = ctx.fast_lock();
        assert!(released.load(Ordering::SeqCst));
        assert!(fast.succeeded());
        fast.release();
        holder.join().unwrap();
    }

    #[test]
    fn collect_with_scopes_phase_flag() {
        let ctx = multithreaded::<NativeMutex>();
        assert!(!ctx.is_collecting());
        let inside = ctx.collect_with(|| (ctx.is_collecting(), ctx.backend().is_locked()));
        assert_eq!(inside, (true, true));
        assert!(!ctx.is_collecting());
        assert!(!ctx.backend().is_locked());
    }

    #[test]
    fn collect_with_clears_phase_on_unwind() {
        let ctx = Arc::new(multithreaded::<NativeMutex>());
        let c_ctx = Arc::clone(&ctx);
        let result = thread::spawn(move || c_ctx.collect_with(|| panic!())).join();
        assert!(result.is_err());
        assert!(!ctx.is_collecting());
        assert!(!ctx.backend().is_locked());
    }

    #[test]
    fn phase_flag_is_consistent_under_lock() {
        const ROUNDS: usize = 2000;
        let ctx = Arc::new(multithreaded::<SpinFlag>());
        let c_ctx = Arc::clone(&ctx);
        let collector = thread::spawn(move || {
            for _ in 0..ROUNDS {
                c_ctx.collect_with(|| ());
            }
        });
        // Readers that take the lock never observe a pass in progress: the
        // collector clears the flag before releasing.
        for _ in 0..ROUNDS {
            ctx.with_lock(|| assert!(!ctx.is_collecting()));
        }
        collector.join().unwrap();
    }

    #[test]
    fn debug_lists_state() {
        let ctx = SyncContext::new(NativeMutex::new());
        let msg = "SyncContext { backend: \"native\", locking_required: false, collecting: false }";
        assert_eq!(format!("{ctx:?}"), msg);
    }

    #[cfg(debug_assertions)]
    mod holder {
        use std::sync::Arc;
        use std::thread;

        use super::multithreaded;
        use crate::backend::{NativeMutex, SpinFlag};
        use crate::SyncContext;

        #[test]
        fn holds_lock_while_elided() {
            let ctx = SyncContext::new(NativeMutex::new());
            assert!(ctx.holds_lock());
        }

        #[test]
        fn holds_lock_across_transition_in_elided_guard() {
            let ctx = SyncContext::new(NativeMutex::new());
            let guard = ctx.lock_guard();
            ctx.spawn(|| ()).join().unwrap();
            assert!(ctx.holds_lock());
            drop(guard);
            assert!(!ctx.holds_lock());
        }

        #[test]
        fn holds_lock_between_lock_and_unlock() {
            let ctx = multithreaded::<SpinFlag>();
            assert!(!ctx.holds_lock());
            ctx.lock();
            assert!(ctx.holds_lock());
            unsafe { ctx.unlock() };
            assert!(!ctx.holds_lock());
        }

        #[test]
        fn holds_lock_after_fast_success() {
            let ctx = multithreaded::<SpinFlag>();
            let fast = ctx.fast_lock();
            assert!(fast.succeeded());
            assert!(ctx.holds_lock());
            fast.release();
            assert!(!ctx.holds_lock());
        }

        #[test]
        fn other_thread_does_not_hold_lock() {
            let ctx = Arc::new(multithreaded::<NativeMutex>());
            let _guard = ctx.lock_guard();
            let c_ctx = Arc::clone(&ctx);
            assert!(!thread::spawn(move || c_ctx.holds_lock()).join().unwrap());
        }

        #[test]
        #[should_panic = "does not hold it"]
        fn unlock_without_holding_asserts() {
            let ctx = multithreaded::<NativeMutex>();
            unsafe { ctx.unlock() };
        }

        #[test]
        #[should_panic = "without holding the allocation lock"]
        fn enter_collection_without_lock_asserts() {
            let ctx = multithreaded::<NativeMutex>();
            ctx.enter_collection();
        }
    }
}
