//! Storage factory for creating storage instances from configuration.

use std::sync::Arc;

use super::config::StorageConfig;
use super::in_memory::InMemoryStorage;
use super::{Storage, StorageError, StorageResult};

/// Creates a storage instance based on the provided configuration.
///
/// # Arguments
///
/// * `config` - The storage configuration specifying the backend type and settings.
///
/// # Returns
///
/// Returns an `Arc<dyn Storage>` on success, or a `StorageError` if the
/// configuration is invalid.
pub async fn create_storage(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    match config {
        StorageConfig::InMemory(in_memory) => {
            if in_memory.history == 0 {
                return Err(StorageError::Storage(
                    "in-memory history must retain at least one revision".to_string(),
                ));
            }
            if in_memory.watch_capacity == 0 {
                return Err(StorageError::Storage(
                    "in-memory watch capacity must be positive".to_string(),
                ));
            }
            tracing::debug!(
                history = in_memory.history,
                watch_capacity = in_memory.watch_capacity,
                "creating in-memory storage"
            );
            Ok(Arc::new(InMemoryStorage::with_config(in_memory.clone())))
        }
    }
}
