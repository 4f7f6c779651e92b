use core::fmt::{self, Display, Formatter};

use crate::backend::BackendKind;

/// Errors raised while configuring the allocation lock.
///
/// Once a [`SyncContext`] exists, none of its operations fail: discipline
/// violations are assertion failures in debug builds, and a failing OS
/// primitive aborts the process.
///
/// [`SyncContext`]: crate::SyncContext
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The name does not match any [`BackendKind`].
    UnknownBackend(String),
    /// The backend does not exist on the current target.
    Unsupported(BackendKind),
    /// An environment variable holds a value that cannot be interpreted.
    InvalidEnv {
        /// The variable name.
        var: &'static str,
        /// The offending value.
        value: String,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownBackend(name) => {
                write!(f, "unknown lock backend `{name}`, expected one of ")?;
                f.write_str("`native`, `spin` or `critical-section`")
            }
            Self::Unsupported(kind) => {
                write!(f, "lock backend `{kind}` is not available on this target")
            }
            Self::InvalidEnv { var, value } => write!(f, "invalid value `{value}` for {var}"),
        }
    }
}

impl std::error::Error for Error {}
