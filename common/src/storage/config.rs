//! Storage backend configuration.

use serde::{Deserialize, Serialize};

/// Number of revisions retained per key by default.
pub const DEFAULT_HISTORY: usize = 1;

/// Capacity of the change channel feeding watchers.
pub const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// Selects and configures the bucket backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// A process-local bucket held in memory.
    InMemory(InMemoryConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::InMemory(InMemoryConfig::default())
    }
}

/// Settings for the in-memory bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    /// Revisions retained per key, tombstones included. Must be at least 1.
    pub history: usize,

    /// Buffered change notifications before slow watchers start lagging.
    ///
    /// A lagging watcher re-reads the key and resumes from its latest entry,
    /// so intermediate revisions may be skipped but the final state is never
    /// missed.
    pub watch_capacity: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            history: DEFAULT_HISTORY,
            watch_capacity: DEFAULT_WATCH_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_default_to_in_memory_storage() {
        // when
        let config = StorageConfig::default();

        // then
        assert_eq!(config, StorageConfig::InMemory(InMemoryConfig::default()));
    }

    #[test]
    fn should_deserialize_in_memory_config_with_defaults() {
        // given
        let json = r#"{"type": "InMemory", "history": 5}"#;

        // when
        let config: StorageConfig = serde_json::from_str(json).unwrap();

        // then
        assert_eq!(
            config,
            StorageConfig::InMemory(InMemoryConfig {
                history: 5,
                watch_capacity: DEFAULT_WATCH_CAPACITY,
            })
        );
    }
}
