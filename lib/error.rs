//! Error types surfaced by the cache engine.
//!
//! No panic crosses the engine boundary on the request path. Objects that vanished underneath
//! the cache report [`CacheError::Stale`], directory cookies whose chunk was evicted report
//! [`CacheError::Expired`], and backend failures are carried through unchanged.
//!
//! Every variant maps to exactly one POSIX errno via [`CacheError::errno`]:
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Stale` | `ESTALE` |
//! | `Expired` | `EINVAL` |
//! | `ShutDown` | `ESHUTDOWN` |
//! | `NotADirectory` | `ENOTDIR` |
//! | `NoSpace` | `ENOMEM` |
//! | `Backend` | the wrapped OS error, or `EIO` |
//! | `BackendPanicked` | `EIO` |

use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;

/// Errors returned by cache operations.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The entry was killed, reclaimed, or never existed.
    #[error("cache entry is stale")]
    Stale,

    /// The chunk that issued this cookie is no longer resident. The caller must restart the
    /// enumeration from the beginning of the directory.
    #[error("directory cookie {0} has expired")]
    Expired(u64),

    /// The engine has been shut down.
    #[error("cache is shut down")]
    ShutDown,

    /// A directory operation was attempted on a non-directory object.
    #[error("object is not a directory")]
    NotADirectory,

    /// The entry store is at its hard limit and a forced release could not make room.
    #[error("entry store exhausted ({used} entries in use)")]
    NoSpace {
        /// Entries in use when the allocation was refused.
        used: u64,
    },

    /// The backend driver reported an error.
    #[error("backend error: {0}")]
    Backend(#[source] Arc<std::io::Error>),

    /// The backend driver panicked while an entry was being populated.
    #[error("backend panicked while populating an entry")]
    BackendPanicked,
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Backend(Arc::new(err))
    }
}

impl CacheError {
    /// The POSIX errno the protocol layer should report for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Stale => libc::ESTALE,
            Self::Expired(_) => libc::EINVAL,
            Self::ShutDown => libc::ESHUTDOWN,
            Self::NotADirectory => libc::ENOTDIR,
            Self::NoSpace { .. } => libc::ENOMEM,
            Self::Backend(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::BackendPanicked => libc::EIO,
        }
    }

    /// Whether the caller should treat the handle it used as stale.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }
}

/// Result alias used throughout the engine.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Report a reference-discipline violation by a caller (release without acquire, use after
/// kill, unpin without pin).
///
/// Debug builds panic so the offending caller shows up in the backtrace. Release builds log and
/// carry on, so one misbehaving request path cannot take the whole server down. Callers must
/// leave lane state consistent before calling this.
#[track_caller]
pub(crate) fn ref_violation(what: &'static str, detail: &dyn Debug) {
    tracing::error!(
        violation = what,
        detail = ?detail,
        "reference discipline violated, this is a programming bug"
    );
    if cfg!(debug_assertions) {
        panic!("reference discipline violated: {what} ({detail:?})");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_keep_their_errno() {
        let err = CacheError::from(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.errno(), libc::EACCES);

        let opaque = CacheError::from(std::io::Error::other("no errno here"));
        assert_eq!(opaque.errno(), libc::EIO);
    }

    #[test]
    fn only_stale_is_stale() {
        assert!(CacheError::Stale.is_stale());
        assert!(!CacheError::Expired(7).is_stale());
        assert_eq!(CacheError::NoSpace { used: 3 }.errno(), libc::ENOMEM);
    }
}
