use std::path::PathBuf;

use thiserror::Error;

/// Storage-specific error types.
///
/// A failed write never leaves a partially applied change behind: the
/// credential file on disk keeps its previous contents.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Bad location, user name or lifetime rule
    #[error(transparent)]
    Config(#[from] latchkey_core::Error),

    /// Reading or writing a file failed
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file exists but does not hold what we expect
    #[error("Malformed file {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    /// Password hashing could not run
    #[error("Password hashing failed: {0}")]
    Hashing(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Specialized result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
