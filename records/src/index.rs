//! Secondary index maintenance.
//!
//! Every indexed field of a model owns one bucket key per distinct value:
//!
//! ```text
//! User.index.email.alice_example_com -> [1, 7]
//! ```
//!
//! The value is the list of ids whose record currently holds that value, in
//! insertion order. Entries are updated by read-modify-write after each record
//! mutation. Two writers updating the same entry at once can lose one update;
//! the bucket exposes revisions so a compare-and-swap can be added later.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use common::{Storage, StorageRead};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::key::validate_name;
use crate::record::{Record, record_id};
use crate::serde::{decode_ids, encode_ids};
use crate::storage::RecordStore;

/// The indexed field set of a model.
///
/// Shared by the model, its index manager, and its query engine so that
/// reassigning the set is seen by all of them.
#[derive(Debug, Clone, Default)]
pub(crate) struct IndexFields(Arc<RwLock<Arc<[String]>>>);

impl IndexFields {
    pub(crate) fn new(fields: Vec<String>) -> Result<Self> {
        Ok(Self(Arc::new(RwLock::new(normalize(fields)?))))
    }

    /// Returns the current fields. The snapshot is unaffected by later
    /// reassignment.
    pub(crate) fn snapshot(&self) -> Arc<[String]> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn replace(&self, fields: Vec<String>) -> Result<()> {
        let fields = normalize(fields)?;
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = fields;
        Ok(())
    }

    pub(crate) fn contains(&self, field: &str) -> bool {
        self.snapshot().iter().any(|f| f == field)
    }
}

/// Validates field names and drops duplicates, keeping first occurrences.
fn normalize(fields: Vec<String>) -> Result<Arc<[String]>> {
    let mut seen = BTreeSet::new();
    let mut normalized = Vec::with_capacity(fields.len());
    for field in fields {
        validate_name("index field", &field)?;
        if seen.insert(field.clone()) {
            normalized.push(field);
        }
    }
    Ok(normalized.into())
}

/// Keeps the index entries of one model consistent with its records.
#[derive(Clone)]
pub struct IndexManager {
    store: RecordStore,
    fields: IndexFields,
}

impl IndexManager {
    pub(crate) fn new(store: RecordStore, fields: IndexFields) -> Self {
        Self { store, fields }
    }

    /// Returns the currently indexed fields.
    pub fn fields(&self) -> Vec<String> {
        self.fields.snapshot().to_vec()
    }

    pub fn is_indexed(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    /// Adds a newly created record to the entry of each indexed field it
    /// carries.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn on_create(&self, record: &Record) -> Result<()> {
        let id = record_id(record)?;
        for field in self.fields.snapshot().iter() {
            if let Some(value) = record.get(field) {
                let key = self.store.router().index_key(field, value);
                self.add_id(&key, id).await?;
            }
        }
        Ok(())
    }

    /// Moves the record between entries for every indexed field whose value
    /// changed from `old` to `new`.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn on_update(&self, old: &Record, new: &Record) -> Result<()> {
        let id = record_id(new)?;
        let router = self.store.router();
        for field in self.fields.snapshot().iter() {
            let old_key = old.get(field).map(|v| router.index_key(field, v));
            let new_key = new.get(field).map(|v| router.index_key(field, v));
            if old_key == new_key {
                continue;
            }
            if let Some(key) = old_key {
                self.remove_id(&key, id).await?;
            }
            if let Some(key) = new_key {
                self.add_id(&key, id).await?;
            }
        }
        Ok(())
    }

    /// Removes a destroyed record from the entry of each indexed field it
    /// carries.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn on_destroy(&self, record: &Record) -> Result<()> {
        let id = record_id(record)?;
        for field in self.fields.snapshot().iter() {
            if let Some(value) = record.get(field) {
                let key = self.store.router().index_key(field, value);
                self.remove_id(&key, id).await?;
            }
        }
        Ok(())
    }

    /// Returns the ids stored under `field == value`, in insertion order.
    ///
    /// Because values are sanitized into keys, the ids may include records
    /// whose value only collides with `value`.
    #[tracing::instrument(level = "trace", skip(self, value))]
    pub async fn lookup(&self, field: &str, value: &Value) -> Result<Vec<u64>> {
        let key = self.store.router().index_key(field, value);
        self.read_ids(&key).await
    }

    /// Removes every index key of the model and returns how many live keys
    /// were removed.
    ///
    /// Entries for the values seen in `records` are removed first, then any
    /// key left under the model's index namespace is swept.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.store.router().model()))]
    pub async fn truncate_indexes(&self, records: &[Record], purge: bool) -> Result<usize> {
        let storage = self.store.storage()?;
        let router = self.store.router();

        let mut keys = BTreeSet::new();
        for field in self.fields.snapshot().iter() {
            for record in records {
                if let Some(value) = record.get(field) {
                    keys.insert(router.index_key(field, value));
                }
            }
        }

        let mut removed = 0;
        for key in &keys {
            let live = storage
                .get(key)
                .await?
                .is_some_and(|entry| !entry.is_tombstone());
            if live {
                self.store.remove_key(key, purge).await?;
                removed += 1;
            }
        }

        let leftover = storage
            .list_keys(Some(&router.all_indexes_pattern()))
            .await?;
        if !leftover.is_empty() {
            tracing::debug!(count = leftover.len(), "sweeping index keys");
        }
        for key in &leftover {
            self.store.remove_key(key, purge).await?;
        }
        removed += leftover.len();

        Ok(removed)
    }

    async fn add_id(&self, key: &str, id: u64) -> Result<()> {
        let mut ids = self.read_ids(key).await?;
        if ids.contains(&id) {
            return Ok(());
        }
        ids.push(id);
        self.write_ids(key, &ids).await
    }

    async fn remove_id(&self, key: &str, id: u64) -> Result<()> {
        let mut ids = self.read_ids(key).await?;
        let before = ids.len();
        ids.retain(|existing| *existing != id);
        if ids.len() == before {
            return Ok(());
        }
        if ids.is_empty() {
            self.store.storage()?.delete(key).await?;
            return Ok(());
        }
        self.write_ids(key, &ids).await
    }

    /// Reads an entry; absent, deleted, and undecodable entries read as empty.
    async fn read_ids(&self, key: &str) -> Result<Vec<u64>> {
        let entry = self.store.storage()?.get(key).await?;
        let Some(entry) = entry else {
            return Ok(Vec::new());
        };
        if entry.is_tombstone() {
            return Ok(Vec::new());
        }
        match decode_ids(key, &entry.value) {
            Ok(ids) => Ok(ids),
            Err(Error::CorruptRecord { reason, .. }) => {
                tracing::warn!(key = %key, reason = %reason, "treating corrupt index entry as empty");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    async fn write_ids(&self, key: &str, ids: &[u64]) -> Result<()> {
        let value = encode_ids(ids)?;
        self.store.storage()?.put(key, value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::connection::Connection;
    use crate::key::KeyRouter;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn manager(fields: &[&str]) -> IndexManager {
        let store = RecordStore::new(
            Connection::in_memory(),
            KeyRouter::new("User", 16).unwrap(),
        );
        let fields = IndexFields::new(fields.iter().map(|f| f.to_string()).collect()).unwrap();
        IndexManager::new(store, fields)
    }

    async fn raw(manager: &IndexManager, key: &str) -> Option<Bytes> {
        manager
            .store
            .storage()
            .unwrap()
            .get(key)
            .await
            .unwrap()
            .filter(|entry| !entry.is_tombstone())
            .map(|entry| entry.value)
    }

    #[tokio::test]
    async fn should_append_ids_in_insertion_order() {
        // given
        let manager = manager(&["email"]);

        // when
        manager
            .on_create(&record(json!({"id": 7, "email": "a@x.com"})))
            .await
            .unwrap();
        manager
            .on_create(&record(json!({"id": 1, "email": "a@x.com"})))
            .await
            .unwrap();

        // then
        assert_eq!(
            raw(&manager, "User.index.email.a_x_com").await,
            Some(Bytes::from("[7,1]"))
        );
        assert_eq!(
            manager.lookup("email", &json!("a@x.com")).await.unwrap(),
            vec![7, 1]
        );
    }

    #[tokio::test]
    async fn should_not_duplicate_ids() {
        // given
        let manager = manager(&["email"]);
        let alice = record(json!({"id": 1, "email": "a@x.com"}));

        // when
        manager.on_create(&alice).await.unwrap();
        manager.on_create(&alice).await.unwrap();

        // then
        assert_eq!(
            manager.lookup("email", &json!("a@x.com")).await.unwrap(),
            vec![1]
        );
    }

    #[tokio::test]
    async fn should_skip_unindexed_and_absent_fields() {
        // given
        let manager = manager(&["email", "age"]);

        // when
        manager
            .on_create(&record(json!({"id": 1, "name": "Alice", "age": 30})))
            .await
            .unwrap();

        // then
        let keys = manager.store.storage().unwrap().list_keys(None).await.unwrap();
        assert_eq!(keys, vec!["User.index.age.30".to_string()]);
    }

    #[tokio::test]
    async fn should_move_id_between_entries_on_update() {
        // given
        let manager = manager(&["email"]);
        let old = record(json!({"id": 1, "email": "old@x.com"}));
        let new = record(json!({"id": 1, "email": "new@x.com"}));
        manager.on_create(&old).await.unwrap();

        // when
        manager.on_update(&old, &new).await.unwrap();

        // then
        assert!(raw(&manager, "User.index.email.old_x_com").await.is_none());
        assert_eq!(
            manager.lookup("email", &json!("new@x.com")).await.unwrap(),
            vec![1]
        );
    }

    #[tokio::test]
    async fn should_keep_entry_with_remaining_ids_on_update() {
        // given
        let manager = manager(&["team"]);
        manager
            .on_create(&record(json!({"id": 1, "team": "red"})))
            .await
            .unwrap();
        manager
            .on_create(&record(json!({"id": 2, "team": "red"})))
            .await
            .unwrap();

        // when
        manager
            .on_update(
                &record(json!({"id": 1, "team": "red"})),
                &record(json!({"id": 1, "team": "blue"})),
            )
            .await
            .unwrap();

        // then
        assert_eq!(manager.lookup("team", &json!("red")).await.unwrap(), vec![2]);
        assert_eq!(manager.lookup("team", &json!("blue")).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn should_only_add_or_remove_when_field_is_one_sided() {
        // given
        let manager = manager(&["email"]);
        let without = record(json!({"id": 1}));
        let with = record(json!({"id": 1, "email": "a@x.com"}));

        // when
        manager.on_update(&without, &with).await.unwrap();
        let added = manager.lookup("email", &json!("a@x.com")).await.unwrap();
        manager.on_update(&with, &without).await.unwrap();
        let removed = manager.lookup("email", &json!("a@x.com")).await.unwrap();

        // then
        assert_eq!(added, vec![1]);
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn should_not_write_when_indexed_value_is_unchanged() {
        // given
        let manager = manager(&["email"]);
        let alice = record(json!({"id": 1, "email": "a@x.com", "age": 30}));
        manager.on_create(&alice).await.unwrap();
        let storage = manager.store.storage().unwrap();
        let before = storage.get("User.index.email.a_x_com").await.unwrap().unwrap();

        // when
        let older_age = record(json!({"id": 1, "email": "a@x.com", "age": 31}));
        manager.on_update(&alice, &older_age).await.unwrap();

        // then
        let after = storage.get("User.index.email.a_x_com").await.unwrap().unwrap();
        assert_eq!(before.revision, after.revision);
    }

    #[tokio::test]
    async fn should_delete_entry_when_last_id_is_removed() {
        // given
        let manager = manager(&["email"]);
        let alice = record(json!({"id": 1, "email": "a@x.com"}));
        manager.on_create(&alice).await.unwrap();

        // when
        manager.on_destroy(&alice).await.unwrap();

        // then
        assert!(raw(&manager, "User.index.email.a_x_com").await.is_none());
        let keys = manager.store.storage().unwrap().list_keys(None).await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn should_treat_corrupt_entry_as_empty() {
        // given
        let manager = manager(&["email"]);
        manager
            .store
            .storage()
            .unwrap()
            .put("User.index.email.a_x_com", Bytes::from("oops"))
            .await
            .unwrap();

        // when
        manager
            .on_create(&record(json!({"id": 3, "email": "a@x.com"})))
            .await
            .unwrap();

        // then
        assert_eq!(
            manager.lookup("email", &json!("a@x.com")).await.unwrap(),
            vec![3]
        );
    }

    #[tokio::test]
    async fn should_truncate_seen_and_leftover_index_keys() {
        // given
        let manager = manager(&["email"]);
        let alice = record(json!({"id": 1, "email": "a@x.com"}));
        manager.on_create(&alice).await.unwrap();
        let storage = manager.store.storage().unwrap();
        storage
            .put("User.index.email.orphan", Bytes::from("[9]"))
            .await
            .unwrap();
        storage
            .put("User.index.retired.x", Bytes::from("[9]"))
            .await
            .unwrap();
        storage
            .put("User.shard_1.1", Bytes::from(r#"{"id":1}"#))
            .await
            .unwrap();

        // when
        let removed = manager.truncate_indexes(&[alice], false).await.unwrap();

        // then
        assert_eq!(removed, 3);
        let keys = storage.list_keys(None).await.unwrap();
        assert_eq!(keys, vec!["User.shard_1.1".to_string()]);
    }

    #[test]
    fn should_reject_invalid_index_field_names() {
        let result = IndexFields::new(vec!["profile.email".to_string()]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn should_deduplicate_index_fields() {
        // given
        let fields = IndexFields::new(vec!["email".into(), "age".into(), "email".into()]).unwrap();

        // when
        fields.replace(vec!["age".into(), "age".into()]).unwrap();

        // then
        assert_eq!(&*fields.snapshot(), &["age".to_string()]);
        assert!(!fields.contains("email"));
    }
}
