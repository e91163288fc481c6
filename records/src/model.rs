//! The per-model entry point combining storage, indexes, queries, and change
//! notification.

use std::sync::Arc;

use crate::config::{Config, ModelDefinition};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::index::{IndexFields, IndexManager};
use crate::key::KeyRouter;
use crate::predicate::Predicate;
use crate::query::{Plan, Query, QueryEngine};
use crate::record::{ID_FIELD, Record, record_id, value_as_id};
use crate::storage::RecordStore;
use crate::subscribe::{ChangeEvent, SubscriptionId, Subscribers};
use crate::truncate::{TruncateOperator, TruncateReport};
use crate::watch::{ChangeWatcher, WatchHandle};

/// A named record type stored in the shared bucket.
///
/// Every mutation writes the record first, then updates the secondary indexes,
/// then notifies subscribers. None of these steps is atomic with the others:
/// if index maintenance fails the record write stays in place and the error is
/// returned.
///
/// # Example
///
/// ```ignore
/// let users = db.define(ModelDefinition::new("User").index("email"))?;
///
/// users.create(json!({"id": 1, "email": "a@x.com"}).as_object().cloned().unwrap()).await?;
/// let found = users
///     .find_one(&Predicate::new().equals("email", json!("a@x.com")))
///     .await?;
/// ```
pub struct Model {
    definition: ModelDefinition,
    store: RecordStore,
    fields: IndexFields,
    indexes: IndexManager,
    engine: QueryEngine,
    watcher: ChangeWatcher,
    truncator: TruncateOperator,
    subscribers: Subscribers,
}

impl Model {
    pub(crate) fn new(
        connection: Arc<Connection>,
        definition: ModelDefinition,
        config: &Config,
    ) -> Result<Self> {
        let shard_count = definition.shard_count.unwrap_or(config.default_shard_count);
        let router = KeyRouter::new(definition.name.clone(), shard_count)?;
        let fields = IndexFields::new(definition.indexes.clone())?;

        let store = RecordStore::new(connection, router);
        let indexes = IndexManager::new(store.clone(), fields.clone());
        let engine = QueryEngine::new(store.clone(), indexes.clone());
        let watcher = ChangeWatcher::new(store.clone());
        let truncator =
            TruncateOperator::new(store.clone(), indexes.clone(), config.purge_on_truncate);

        Ok(Self {
            definition,
            store,
            fields,
            indexes,
            engine,
            watcher,
            truncator,
            subscribers: Subscribers::default(),
        })
    }

    pub fn name(&self) -> &str {
        self.store.router().model()
    }

    /// The definition the model was declared with. Its `indexes` reflect the
    /// declaration, not later calls to [`set_indexes`](Self::set_indexes).
    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn shard_count(&self) -> u32 {
        self.store.router().shard_count()
    }

    pub fn router(&self) -> &KeyRouter {
        self.store.router()
    }

    /// Record-level access, bypassing index maintenance and notification.
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.indexes
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    /// Currently indexed fields.
    pub fn indexes(&self) -> Vec<String> {
        self.indexes.fields()
    }

    /// Replaces the indexed field set.
    ///
    /// Later mutations maintain the new set and queries plan against it.
    /// Existing records are not re-indexed, so a newly added field only finds
    /// records written after the change.
    pub fn set_indexes(&self, fields: Vec<String>) -> Result<()> {
        self.fields.replace(fields)?;
        tracing::debug!(model = %self.name(), indexes = ?self.indexes(), "replaced index fields");
        Ok(())
    }

    /// Shows how a predicate would be resolved.
    pub fn plan(&self, predicate: &Predicate) -> Plan {
        self.engine.plan(predicate)
    }

    /// Writes a record, overwriting any existing record with the same id.
    ///
    /// Index entries of an overwritten record are moved to the new values.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.name()))]
    pub async fn create(&self, values: Record) -> Result<Record> {
        let id = record_id(&values)?;
        let previous = self.find_for_write(id).await?;

        let record = self.store.create(values).await?;
        match &previous {
            Some(old) => self.indexes.on_update(old, &record).await?,
            None => self.indexes.on_create(&record).await?,
        }
        self.subscribers.notify(&ChangeEvent::create(record.clone()));
        Ok(record)
    }

    /// Writes several records in order, with the same semantics as
    /// [`create`](Self::create) for each.
    ///
    /// Every record must carry a valid id; nothing is written otherwise. A
    /// storage failure part way leaves the earlier records in place.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.name(), count = values.len()))]
    pub async fn create_all(&self, values: Vec<Record>) -> Result<Vec<Record>> {
        for record in &values {
            record_id(record)?;
        }
        let mut created = Vec::with_capacity(values.len());
        for record in values {
            created.push(self.create(record).await?);
        }
        Ok(created)
    }

    pub async fn find_by_id(&self, id: u64) -> Result<Option<Record>> {
        self.store.find(id).await
    }

    pub async fn find_one(&self, predicate: &Predicate) -> Result<Option<Record>> {
        self.engine.find_one(predicate).await
    }

    pub async fn find_all(&self, predicate: &Predicate) -> Result<Vec<Record>> {
        self.engine.find_all(predicate).await
    }

    pub async fn query(&self, query: &Query) -> Result<Vec<Record>> {
        self.engine.query(query).await
    }

    pub async fn count(&self, predicate: &Predicate) -> Result<usize> {
        self.engine.count(predicate).await
    }

    /// Shallow-merges `values` into the record with the given id.
    ///
    /// Returns the merged record, or `None` if no live record has that id.
    /// `values` may carry `id` only if it equals `id`.
    #[tracing::instrument(level = "debug", skip(self, values), fields(model = %self.name()))]
    pub async fn update(&self, id: u64, values: Record) -> Result<Option<Record>> {
        check_update_id(Some(id), &values)?;
        let Some(old) = self.store.find(id).await? else {
            return Ok(None);
        };
        self.apply_update(old, &values).await.map(Some)
    }

    /// Shallow-merges `values` into every record matching `predicate` and
    /// returns how many were updated. `values` may not carry `id`.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.name()))]
    pub async fn update_where(&self, values: Record, predicate: &Predicate) -> Result<usize> {
        check_update_id(None, &values)?;
        let matched = self.engine.find_all(predicate).await?;
        let count = matched.len();
        for old in matched {
            self.apply_update(old, &values).await?;
        }
        Ok(count)
    }

    /// Merges into the existing record when one is live, or creates it.
    ///
    /// Returns the stored record and whether it was created.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.name()))]
    pub async fn upsert(&self, values: Record) -> Result<(Record, bool)> {
        let id = record_id(&values)?;
        match self.find_for_write(id).await? {
            Some(old) => Ok((self.apply_update(old, &values).await?, false)),
            None => Ok((self.create(values).await?, true)),
        }
    }

    /// Deletes the record with the given id. Returns false if there was none.
    ///
    /// An undecodable record is deleted without index maintenance or
    /// notification, since its indexed values are unknown.
    #[tracing::instrument(level = "debug", skip(self), fields(model = %self.name()))]
    pub async fn destroy(&self, id: u64) -> Result<bool> {
        match self.store.find(id).await {
            Ok(Some(old)) => {
                self.apply_destroy(old).await?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(Error::CorruptRecord { key, reason }) => {
                tracing::warn!(key = %key, reason = %reason, "destroying corrupt record");
                self.store.delete(id).await?;
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// Deletes every record matching `predicate` and returns how many were
    /// deleted.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.name()))]
    pub async fn destroy_where(&self, predicate: &Predicate) -> Result<usize> {
        let matched = self.engine.find_all(predicate).await?;
        let count = matched.len();
        for old in matched {
            self.apply_destroy(old).await?;
        }
        Ok(count)
    }

    /// Removes every record and index entry of the model.
    pub async fn truncate(&self) -> Result<TruncateReport> {
        self.truncator.truncate().await
    }

    /// Watches one record. See [`ChangeWatcher::watch`].
    pub async fn watch<F>(
        &self,
        id: u64,
        columns: Option<Vec<String>>,
        callback: F,
    ) -> Result<WatchHandle>
    where
        F: FnMut(Record) + Send + 'static,
    {
        self.watcher.watch(id, columns, callback).await
    }

    /// Registers a callback for every create, update, and destroy made
    /// through this model.
    ///
    /// With `columns`, the callback only receives events whose changed
    /// columns include at least one of them. Callbacks run synchronously on
    /// the mutating task and should not block.
    pub fn subscribe<F>(&self, callback: F, columns: Option<Vec<String>>) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback, columns)
    }

    /// Removes a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Reads the current record before a write. A corrupt record reads as
    /// absent so it can be overwritten.
    async fn find_for_write(&self, id: u64) -> Result<Option<Record>> {
        match self.store.find(id).await {
            Err(Error::CorruptRecord { key, reason }) => {
                tracing::warn!(key = %key, reason = %reason, "overwriting corrupt record");
                Ok(None)
            }
            result => result,
        }
    }

    async fn apply_update(&self, old: Record, values: &Record) -> Result<Record> {
        let id = record_id(&old)?;
        let mut merged = old.clone();
        merged.extend(values.clone());

        self.store.put(id, &merged).await?;
        self.indexes.on_update(&old, &merged).await?;
        self.subscribers
            .notify(&ChangeEvent::update(old, merged.clone(), values));
        Ok(merged)
    }

    async fn apply_destroy(&self, old: Record) -> Result<()> {
        let id = record_id(&old)?;
        self.store.delete(id).await?;
        self.indexes.on_destroy(&old).await?;
        self.subscribers.notify(&ChangeEvent::destroy(old));
        Ok(())
    }
}

fn check_update_id(target: Option<u64>, values: &Record) -> Result<()> {
    let Some(value) = values.get(ID_FIELD) else {
        return Ok(());
    };
    match target {
        Some(id) if value_as_id(value) == Some(id) => Ok(()),
        Some(id) => Err(Error::InvalidInput(format!(
            "update values carry id {} but target record is {}",
            value, id
        ))),
        None => Err(Error::InvalidInput(format!(
            "bulk update values may not set '{}'",
            ID_FIELD
        ))),
    }
}
