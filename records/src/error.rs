//! Error types for record operations.

use common::StorageError;

/// Error type for record operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The key is absent or its latest revision is a tombstone.
    ///
    /// Find-style operations report this as `None` rather than an error.
    NotFound(String),

    /// The database handle was closed or never opened.
    NotConnected,

    /// Stored bytes could not be decoded.
    ///
    /// Scans skip these and collect them instead of aborting.
    CorruptRecord { key: String, reason: String },

    /// Transport or storage failures from the underlying bucket.
    /// Never retried by this crate.
    Connection(String),

    /// Invalid input or parameter errors.
    InvalidInput(String),

    /// Internal errors indicating bugs or invariant violations.
    Internal(String),
}

impl Error {
    /// Returns true for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound(key) => write!(f, "Not found: {}", key),
            Error::NotConnected => write!(f, "Not connected to storage"),
            Error::CorruptRecord { key, reason } => {
                write!(f, "Corrupt record at {}: {}", key, reason)
            }
            Error::Connection(msg) => write!(f, "Connection error: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Storage(msg) => Error::Connection(msg),
            StorageError::InvalidKey(msg) => Error::InvalidInput(msg),
            StorageError::Closed => Error::NotConnected,
            StorageError::Internal(msg) => Error::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization error: {}", err))
    }
}

/// Result type alias for record operations.
pub type Result<T> = std::result::Result<T, Error>;
