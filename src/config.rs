use std::env;

use crate::backend::{Backend, BackendKind};
use crate::context::SyncContext;
use crate::error::Error;

/// Environment variable that overrides the backend choice.
pub const BACKEND_ENV: &str = "ALLOCLOCK_BACKEND";

/// Environment variable that states the process is already multithreaded.
pub const MULTITHREADED_ENV: &str = "ALLOCLOCK_MULTITHREADED";

/// Startup-time configuration of a [`SyncContext`].
///
/// # Example
///
/// ```
/// use alloclock::backend::BackendKind;
/// use alloclock::Config;
///
/// let ctx = Config::new().backend(BackendKind::SpinFlag).multithreaded(true).build()?;
/// assert_eq!(ctx.backend().kind(), BackendKind::SpinFlag);
/// assert!(ctx.locking_required());
/// # Ok::<(), alloclock::Error>(())
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    backend: Option<BackendKind>,
    thread_local_alloc: bool,
    multithreaded: bool,
}

impl Config {
    /// A configuration that picks the host default backend for a single
    /// threaded process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from [`BACKEND_ENV`] and [`MULTITHREADED_ENV`].
    ///
    /// Unset variables keep the defaults of [`Config::new`].
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that cannot be
    /// interpreted.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::new();
        if let Ok(name) = env::var(BACKEND_ENV) {
            config.backend = Some(name.parse()?);
        }
        if let Ok(value) = env::var(MULTITHREADED_ENV) {
            config.multithreaded = parse_flag(MULTITHREADED_ENV, &value)?;
        }
        Ok(config)
    }

    /// Selects the backend explicitly.
    #[must_use]
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = Some(kind);
        self
    }

    /// Hints that the allocator keeps thread-local free lists.
    ///
    /// The allocation lock is then held rarely but for long periods, so the
    /// default backend becomes the native mutex.
    #[must_use]
    pub fn thread_local_alloc(mut self, enabled: bool) -> Self {
        self.thread_local_alloc = enabled;
        self
    }

    /// States whether more than one thread may already be running, which
    /// disables lock elision from the start.
    #[must_use]
    pub fn multithreaded(mut self, multithreaded: bool) -> Self {
        self.multithreaded = multithreaded;
        self
    }

    /// The backend [`build`] will create.
    ///
    /// [`build`]: Config::build
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.unwrap_or_else(|| BackendKind::host_default(self.thread_local_alloc))
    }

    /// Creates the context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] if the selected backend does not exist
    /// on this target.
    pub fn build(&self) -> Result<SyncContext, Error> {
        let kind = self.backend_kind();
        let backend = Backend::new(kind)?;
        let explicit = self.backend.is_some();
        tracing::debug!(%kind, explicit, "allocation lock backend selected");
        Ok(SyncContext::with_elision(backend, self.multithreaded))
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, Error> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::InvalidEnv { var, value: value.to_owned() }),
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{parse_flag, Config, MULTITHREADED_ENV};
    use crate::backend::BackendKind;
    use crate::error::Error;
    use crate::lock::RawLock;

    #[test]
    fn defaults_to_host_backend() {
        let config = Config::new();
        assert_eq!(config.backend_kind(), BackendKind::host_default(false));
        let ctx = config.build().unwrap();
        assert!(!ctx.locking_required());
        assert!(!ctx.is_collecting());
    }

    #[test]
    fn explicit_backend_wins() {
        let config = Config::new().thread_local_alloc(true).backend(BackendKind::SpinFlag);
        assert_eq!(config.backend_kind(), BackendKind::SpinFlag);
        assert_eq!(config.build().unwrap().backend().name(), "spin-flag");
    }

    #[test]
    fn thread_local_alloc_picks_native() {
        if !cfg!(windows) {
            let config = Config::new().thread_local_alloc(true);
            assert_eq!(config.build().unwrap().backend().kind(), BackendKind::Native);
        }
    }

    #[test]
    fn multithreaded_disables_elision() {
        let ctx = Config::new().multithreaded(true).build().unwrap();
        assert!(ctx.locking_required());
    }

    #[test]
    fn builds_every_available_backend() {
        for kind in BackendKind::ALL.into_iter().filter(|kind| kind.is_available()) {
            let ctx = Config::new().backend(kind).multithreaded(true).build().unwrap();
            ctx.with_lock(|| assert!(ctx.backend().kind() == kind));
        }
    }

    #[test]
    fn parses_flags() {
        assert!(parse_flag(MULTITHREADED_ENV, " 1 ").unwrap());
        assert!(parse_flag(MULTITHREADED_ENV, "true").unwrap());
        assert!(!parse_flag(MULTITHREADED_ENV, "0").unwrap());
        assert!(!parse_flag(MULTITHREADED_ENV, "").unwrap());
        let err = parse_flag(MULTITHREADED_ENV, "maybe").unwrap_err();
        let expected = Error::InvalidEnv { var: MULTITHREADED_ENV, value: "maybe".to_owned() };
        assert_eq!(err, expected);
        assert_eq!(err.to_string(), "invalid value `maybe` for ALLOCLOCK_MULTITHREADED");
    }
}
