pub mod config;
pub mod factory;
pub mod in_memory;
pub mod pattern;

use async_trait::async_trait;
use bytes::Bytes;

/// The kind of write that produced the latest revision of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// A value was written.
    Put,
    /// The key was deleted. History, if retained, is kept.
    Delete,
    /// The key was deleted and its history compacted away.
    Purge,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Put => write!(f, "PUT"),
            Operation::Delete => write!(f, "DEL"),
            Operation::Purge => write!(f, "PURGE"),
        }
    }
}

/// The latest revision of a key in a bucket.
///
/// Deleted and purged keys are still reported by [`StorageRead::get`] as
/// tombstone entries with an empty value, so callers can tell "never written"
/// (`None`) apart from "deleted" (`Some` with [`Entry::is_tombstone`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Bytes,
    pub revision: u64,
    pub operation: Operation,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: Bytes, revision: u64, operation: Operation) -> Self {
        Self {
            key: key.into(),
            value,
            revision,
            operation,
        }
    }

    /// Returns true if this entry marks a deleted or purged key.
    pub fn is_tombstone(&self) -> bool {
        matches!(self.operation, Operation::Delete | Operation::Purge)
    }
}

/// An entry delivered by a [`Watcher`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEntry {
    pub entry: Entry,
    /// True for the value the key already held when the watch was opened.
    pub initial: bool,
}

/// Error type for storage operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Storage-related errors
    Storage(String),
    /// A key or key pattern violates the bucket's key rules
    InvalidKey(String),
    /// The bucket has been closed
    Closed,
    /// Internal errors
    Internal(String),
}

impl std::error::Error for StorageError {}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StorageError::Storage(msg) => write!(f, "Storage error: {}", msg),
            StorageError::InvalidKey(msg) => write!(f, "Invalid key: {}", msg),
            StorageError::Closed => write!(f, "Storage closed"),
            StorageError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl StorageError {
    /// Converts a storage error to StorageError::Storage.
    pub fn from_storage(e: impl std::fmt::Display) -> Self {
        StorageError::Storage(e.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Lazy iterator over key names.
#[async_trait]
pub trait KeyIterator {
    async fn next(&mut self) -> StorageResult<Option<String>>;
}

/// Lazy, effectively infinite iterator over the revisions of a single key.
///
/// Entries are delivered in write order. `next` returns `Ok(None)` only once
/// the bucket has been closed.
#[async_trait]
pub trait Watcher {
    async fn next(&mut self) -> StorageResult<Option<WatchEntry>>;
}

/// Read operations on a bucket.
#[async_trait]
pub trait StorageRead: Send + Sync {
    /// Returns the latest entry for a key, including tombstones.
    async fn get(&self, key: &str) -> StorageResult<Option<Entry>>;

    /// Returns an iterator over live (non-tombstoned) keys.
    ///
    /// `pattern` is a dot-separated key pattern where `*` matches exactly one
    /// token and a trailing `>` matches one or more tokens. `None` lists every
    /// key in the bucket.
    async fn keys(
        &self,
        pattern: Option<&str>,
    ) -> StorageResult<Box<dyn KeyIterator + Send + 'static>>;

    /// Collects all keys matching the pattern into a Vec.
    #[tracing::instrument(level = "trace", skip_all)]
    async fn list_keys(&self, pattern: Option<&str>) -> StorageResult<Vec<String>> {
        let mut iter = self.keys(pattern).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next().await? {
            keys.push(key);
        }
        Ok(keys)
    }
}

/// The storage type encapsulates access to a key-value bucket.
#[async_trait]
pub trait Storage: StorageRead {
    /// Writes a value and returns the revision assigned to it.
    async fn put(&self, key: &str, value: Bytes) -> StorageResult<u64>;

    /// Deletes a key, leaving a tombstone. No-op if the key is not live.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Returns true if [`purge`](Storage::purge) compacts history rather than
    /// falling back to a plain delete.
    fn supports_purge(&self) -> bool {
        false
    }

    /// Deletes a key and drops its retained history.
    ///
    /// The default implementation is a plain [`delete`](Storage::delete).
    async fn purge(&self, key: &str) -> StorageResult<()> {
        self.delete(key).await
    }

    /// Opens a change stream for a single key.
    ///
    /// The stream starts with the key's current entry, if any, flagged as
    /// [`WatchEntry::initial`], followed by every later revision.
    async fn watch(&self, key: &str) -> StorageResult<Box<dyn Watcher + Send + 'static>>;

    /// Closes the bucket. Later operations fail with [`StorageError::Closed`]
    /// and open watchers terminate.
    async fn close(&self) -> StorageResult<()>;
}
