//! Shared storage plumbing: the key-value bucket contract and its backends.

pub mod storage;

pub use storage::config::{InMemoryConfig, StorageConfig};
pub use storage::factory::create_storage;
pub use storage::in_memory::InMemoryStorage;
pub use storage::pattern::{KeyPattern, validate_key};
pub use storage::{
    Entry, KeyIterator, Operation, Storage, StorageError, StorageRead, StorageResult, WatchEntry,
    Watcher,
};
