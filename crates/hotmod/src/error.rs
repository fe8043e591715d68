//! Typed errors for the hotmod host.
//!
//! Every failure here is a broken build or deployment rather than a transient
//! condition, so the default reaction is a hard stop. Errors are still
//! returned as values; callers opt into the abort with [`OrAbort`].

use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::error;

/// Last platform-level failure message, process-wide.
static LAST_ERROR: Mutex<Option<String>> = parking_lot::const_mutex(None);

/// Errors raised by module loading, reloading and change monitoring
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HotmodError {
    /// The module path could not be resolved
    #[error("Invalid module path {path:?}: {source}")]
    InvalidPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The dynamic loader refused to open the library
    #[error("Failed to open library {path:?}: {reason}")]
    LibraryOpen { path: PathBuf, reason: String },

    /// The library does not provide the well-known export
    #[error("Module {path:?} does not export {symbol}: {reason}")]
    MissingExport {
        path: PathBuf,
        symbol: &'static str,
        reason: String,
    },

    /// The module was built against a different export layout
    #[error("Module {path:?} has ABI version {actual}, expected {expected}")]
    AbiMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    /// The private copy used to keep the original file replaceable could not be made
    #[error("Could not create temporary copy of {path:?}: {source}")]
    ShadowCopy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The dynamic loader failed to release the library
    #[error("Failed to close library {path:?}: {reason}")]
    LibraryClose { path: PathBuf, reason: String },

    /// Registering or removing a directory watch failed
    #[error("Watch error on {path:?}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// A previous reload failed and left the module without a loaded instance
    #[error("Module {path:?} is defunct after a failed reload")]
    Defunct { path: PathBuf },
}

/// Result type for hotmod operations
pub type HotmodResult<T> = Result<T, HotmodError>;

impl HotmodError {
    /// Record this error as the last platform failure and return it.
    pub(crate) fn recorded(self) -> Self {
        *LAST_ERROR.lock() = Some(self.to_string());
        self
    }
}

/// Message of the last platform-level failure seen by this process.
pub fn last_error() -> Option<String> {
    LAST_ERROR.lock().clone()
}

/// Turn an unrecoverable failure into a process abort.
pub trait OrAbort<T> {
    /// Return the value, or report `context` with the error and abort.
    fn or_abort(self, context: &str) -> T;
}

impl<T> OrAbort<T> for HotmodResult<T> {
    fn or_abort(self, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                let platform = last_error().unwrap_or_else(|| "no platform error".to_string());
                error!("{}: {} ({})", context, e, platform);
                eprintln!("{}: {} ({})", context, e, platform);
                std::process::abort();
            }
        }
    }
}
