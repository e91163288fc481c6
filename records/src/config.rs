//! Configuration for opening a [`Database`](crate::Database) and declaring models.

use common::StorageConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Shard count used when a model does not declare one.
pub const DEFAULT_SHARD_COUNT: u32 = 16;

/// Configuration for opening a [`Database`](crate::Database).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend configuration.
    pub storage: StorageConfig,

    /// Shard count for models that do not set their own.
    pub default_shard_count: u32,

    /// Purge rather than delete keys during truncation when the backend
    /// supports history compaction.
    pub purge_on_truncate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            default_shard_count: DEFAULT_SHARD_COUNT,
            purge_on_truncate: true,
        }
    }
}

/// Declaration of a model: its name, informational schema, sharding, and
/// indexed fields.
///
/// # Example
///
/// ```ignore
/// let users = ModelDefinition::new("User")
///     .attribute("name", json!({"type": "STRING"}))
///     .attribute("email", json!({"type": "STRING"}))
///     .index("email");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// Model name, used as the first token of every storage key.
    pub name: String,

    /// Declared fields. Informational only; never enforced.
    #[serde(default)]
    pub attributes: Map<String, Value>,

    /// Number of shards. Falls back to [`Config::default_shard_count`].
    #[serde(default)]
    pub shard_count: Option<u32>,

    /// Fields maintained in secondary indexes.
    #[serde(default)]
    pub indexes: Vec<String>,
}

impl ModelDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Map::new(),
            shard_count: None,
            indexes: Vec::new(),
        }
    }

    pub fn attribute(mut self, name: impl Into<String>, definition: Value) -> Self {
        self.attributes.insert(name.into(), definition);
        self
    }

    pub fn shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = Some(shard_count);
        self
    }

    pub fn index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(field.into());
        self
    }
}
