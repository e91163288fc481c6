//! Database handle owning the bucket connection and the model registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use common::{Storage, create_storage};

use crate::config::{Config, ModelDefinition};
use crate::connection::Connection;
use crate::error::Result;
use crate::model::Model;

/// The main entry point: a connection to one bucket plus the models defined
/// on it.
///
/// All models share the bucket handle. After [`close`](Database::close) every
/// operation on every model, including models obtained earlier, fails with
/// [`Error::NotConnected`](crate::Error::NotConnected).
///
/// # Example
///
/// ```ignore
/// use records::{Config, Database, ModelDefinition, Predicate};
///
/// let db = Database::open(Config::default()).await?;
/// let users = db.define(ModelDefinition::new("User").index("email"))?;
///
/// users.create(record).await?;
/// let alice = users
///     .find_one(&Predicate::new().equals("email", json!("alice@example.com")))
///     .await?;
///
/// db.close().await?;
/// ```
pub struct Database {
    connection: Arc<Connection>,
    config: Config,
    models: RwLock<HashMap<String, Arc<Model>>>,
}

impl Database {
    /// Opens a database on the bucket described by `config.storage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend cannot be initialized.
    pub async fn open(config: Config) -> Result<Self> {
        let storage = create_storage(&config.storage).await?;
        Ok(Self::with_storage(storage, config))
    }

    /// Creates a database on an existing bucket. `config.storage` is ignored.
    pub fn with_storage(storage: Arc<dyn Storage>, config: Config) -> Self {
        Self {
            connection: Arc::new(Connection::new(storage)),
            config,
            models: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Declares a model and registers it under its name.
    ///
    /// Defining a name again replaces the registry entry; handles to the
    /// previous model keep working against the same keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`](crate::Error::InvalidInput) if the
    /// model name, shard count, or an index field is invalid.
    pub fn define(&self, definition: ModelDefinition) -> Result<Arc<Model>> {
        let model = Arc::new(Model::new(
            Arc::clone(&self.connection),
            definition,
            &self.config,
        )?);
        tracing::debug!(
            model = %model.name(),
            shard_count = model.shard_count(),
            indexes = ?model.indexes(),
            "defined model"
        );
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.name().to_string(), Arc::clone(&model));
        Ok(model)
    }

    /// Returns the model registered under `name`.
    pub fn model(&self, name: &str) -> Option<Arc<Model>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of the registered models, sorted.
    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Returns the shared bucket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`](crate::Error::NotConnected) after
    /// [`close`](Database::close).
    pub fn storage(&self) -> Result<Arc<dyn Storage>> {
        self.connection.storage()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Detaches every model from the bucket and closes it.
    ///
    /// Running watches end. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        match self.connection.disconnect() {
            Some(storage) => {
                tracing::debug!("closing database");
                storage.close().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}
