//! The locking strategies and their startup-time selection.
//!
//! Three strategies implement [`RawLock`]:
//!
//! - [`NativeMutex`]: a parking, blocking mutex. Best when the lock is held
//!   for long periods, since waiters do not spin.
//! - [`SpinFlag`]: a test-and-set flag with a queued, relaxing escalation
//!   path. Best when critical sections are short, and it has the cheapest
//!   fast path.
//! - [`CriticalSection`]: the operating system's critical section (Windows)
//!   or recursive pthread mutex (Unix). Its fast path degrades to blocking.
//!
//! A strategy can be fixed at build time by naming the type, as in
//! `SyncContext<SpinFlag>`, or picked once at startup through [`Backend`],
//! which dispatches to whichever strategy [`BackendKind`] selected.
//!
//! [`RawLock`]: crate::RawLock

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use crate::error::Error;
use crate::lock::RawLock;

mod native;
pub use native::NativeMutex;

mod queue;

mod spin;
pub use spin::SpinFlag;

#[cfg(any(unix, windows))]
mod critical_section;
#[cfg(any(unix, windows))]
pub use critical_section::CriticalSection;

/// Names one of the locking strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// A native blocking mutex, see [`NativeMutex`].
    Native,
    /// An atomic spin flag, see [`SpinFlag`].
    SpinFlag,
    /// An OS critical section, see `CriticalSection`.
    CriticalSection,
}

impl BackendKind {
    /// All strategies, in their order of declaration.
    pub const ALL: [Self; 3] = [Self::Native, Self::SpinFlag, Self::CriticalSection];

    /// Whether this strategy exists on the current target.
    pub const fn is_available(self) -> bool {
        match self {
            Self::Native | Self::SpinFlag => true,
            Self::CriticalSection => cfg!(any(unix, windows)),
        }
    }

    /// The strategy to use when none was requested.
    ///
    /// Windows prefers its critical section over a hand-built spinlock. When
    /// the allocator uses thread-local free lists, the allocation lock tends
    /// to be held for long periods, if at all, so spinning would mostly
    /// waste time and the native mutex is picked. Otherwise the spin flag is
    /// used.
    pub const fn host_default(thread_local_alloc: bool) -> Self {
        if cfg!(windows) {
            Self::CriticalSection
        } else if thread_local_alloc {
            Self::Native
        } else {
            Self::SpinFlag
        }
    }

    /// The name this strategy parses from and displays as.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::SpinFlag => "spin",
            Self::CriticalSection => "critical-section",
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::UnknownBackend(name.to_owned()))
    }
}

/// The lock strategy selected at startup.
///
/// Dispatches every [`RawLock`] operation to the selected concrete strategy.
/// The selection is fixed for the lifetime of the value.
#[derive(Debug)]
pub enum Backend {
    /// See [`NativeMutex`].
    Native(NativeMutex),
    /// See [`SpinFlag`].
    SpinFlag(SpinFlag),
    /// See `CriticalSection`.
    #[cfg(any(unix, windows))]
    CriticalSection(CriticalSection),
}

impl Backend {
    /// Creates an unlocked backend of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] if `kind` does not exist on this target.
    pub fn new(kind: BackendKind) -> Result<Self, Error> {
        match kind {
            BackendKind::Native => Ok(Self::Native(NativeMutex::new())),
            BackendKind::SpinFlag => Ok(Self::SpinFlag(SpinFlag::new())),
            #[cfg(any(unix, windows))]
            BackendKind::CriticalSection => Ok(Self::CriticalSection(CriticalSection::new())),
            #[cfg(not(any(unix, windows)))]
            BackendKind::CriticalSection => Err(Error::Unsupported(kind)),
        }
    }

    /// The kind of the selected strategy.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Native(_) => BackendKind::Native,
            Self::SpinFlag(_) => BackendKind::SpinFlag,
            #[cfg(any(unix, windows))]
            Self::CriticalSection(_) => BackendKind::CriticalSection,
        }
    }
}

impl Default for Backend {
    /// The host default for an allocator without thread-local free lists.
    fn default() -> Self {
        match BackendKind::host_default(false) {
            BackendKind::Native => Self::Native(NativeMutex::new()),
            #[cfg(any(unix, windows))]
            BackendKind::CriticalSection => Self::CriticalSection(CriticalSection::new()),
            _ => Self::SpinFlag(SpinFlag::new()),
        }
    }
}

/// Forwards a method call to the selected strategy.
macro_rules! dispatch {
    ($self:ident, $lock:ident => $call:expr) => {
        match $self {
            Self::Native($lock) => $call,
            Self::SpinFlag($lock) => $call,
            #[cfg(any(unix, windows))]
            Self::CriticalSection($lock) => $call,
        }
    };
}

// SAFETY: Every variant implements `RawLock`, and the variant of a value
// never changes.
unsafe impl RawLock for Backend {
    #[inline]
    fn lock(&self) {
        dispatch!(self, lock => lock.lock());
    }

    #[inline]
    fn try_lock(&self) -> bool {
        dispatch!(self, lock => lock.try_lock())
    }

    #[inline]
    unsafe fn unlock(&self) {
        // SAFETY: Caller guaranteed that the current thread holds the lock.
        dispatch!(self, lock => unsafe { lock.unlock() });
    }

    #[inline]
    fn has_fast_path(&self) -> bool {
        dispatch!(self, lock => lock.has_fast_path())
    }

    fn name(&self) -> &'static str {
        dispatch!(self, lock => lock.name())
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Backend, BackendKind};
    use crate::error::Error;
    use crate::lock::RawLock;
    use crate::test::tests;

    #[test]
    fn parses_names() {
        assert_eq!("native".parse::<BackendKind>().unwrap(), BackendKind::Native);
        assert_eq!(" SPIN ".parse::<BackendKind>().unwrap(), BackendKind::SpinFlag);
        let kind = "critical-section".parse::<BackendKind>().unwrap();
        assert_eq!(kind, BackendKind::CriticalSection);
    }

    #[test]
    fn rejects_unknown_names() {
        let err = "futex".parse::<BackendKind>().unwrap_err();
        assert!(matches!(err, Error::UnknownBackend(ref name) if name == "futex"));
    }

    #[test]
    fn display_parses_back() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn thread_local_alloc_prefers_native() {
        if !cfg!(windows) {
            assert_eq!(BackendKind::host_default(true), BackendKind::Native);
            assert_eq!(BackendKind::host_default(false), BackendKind::SpinFlag);
        }
    }

    #[test]
    fn new_reports_its_kind() {
        for kind in BackendKind::ALL.into_iter().filter(|kind| kind.is_available()) {
            let backend = Backend::new(kind).unwrap();
            assert_eq!(backend.kind(), kind);
        }
    }

    #[test]
    fn only_critical_section_lacks_fast_path() {
        for kind in BackendKind::ALL.into_iter().filter(|kind| kind.is_available()) {
            let backend = Backend::new(kind).unwrap();
            assert_eq!(backend.has_fast_path(), kind != BackendKind::CriticalSection);
        }
    }

    #[test]
    fn default_matches_host_default() {
        assert_eq!(Backend::default().kind(), BackendKind::host_default(false));
    }

    #[test]
    fn lots_and_lots_dispatched() {
        tests::lots_and_lots::<Backend>();
    }

    #[test]
    fn try_lock_fails_while_held_dispatched() {
        tests::try_lock_fails_while_held::<Backend>();
    }
}
