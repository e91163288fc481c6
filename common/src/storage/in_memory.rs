use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use super::config::InMemoryConfig;
use super::pattern::{KeyPattern, validate_key};
use super::{
    Entry, KeyIterator, Operation, Storage, StorageError, StorageRead, StorageResult, WatchEntry,
    Watcher,
};

/// Bucket contents shared between the storage handle and its watchers.
struct State {
    revision: u64,
    /// Retained revisions per key, oldest first. The back entry is the latest.
    data: BTreeMap<String, VecDeque<Entry>>,
    /// `None` once the storage has been closed.
    changes: Option<broadcast::Sender<Entry>>,
}

impl State {
    fn latest(&self, key: &str) -> Option<&Entry> {
        self.data.get(key).and_then(|history| history.back())
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.changes.is_none() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn append(&mut self, entry: Entry, history: usize) {
        let retained = self.data.entry(entry.key.clone()).or_default();
        retained.push_back(entry.clone());
        while retained.len() > history {
            retained.pop_front();
        }
        self.notify(entry);
    }

    fn notify(&self, entry: Entry) {
        if let Some(changes) = &self.changes {
            // no receivers just means nobody is watching
            let _ = changes.send(entry);
        }
    }
}

/// In-memory implementation of the Storage trait using a BTreeMap.
///
/// Every write is assigned a bucket-wide, monotonically increasing revision.
/// Deletes and purges leave tombstone entries so that reads and watchers can
/// distinguish deleted keys from keys that never existed. Up to
/// [`InMemoryConfig::history`] revisions are retained per key; a purge drops
/// all of them in favour of a single purge marker.
pub struct InMemoryStorage {
    state: Arc<RwLock<State>>,
    history: usize,
}

impl InMemoryStorage {
    /// Creates a new InMemoryStorage instance with default settings.
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    /// Creates a new InMemoryStorage instance with the given settings.
    pub fn with_config(config: InMemoryConfig) -> Self {
        let (changes, _) = broadcast::channel(config.watch_capacity.max(1));
        Self {
            state: Arc::new(RwLock::new(State {
                revision: 0,
                data: BTreeMap::new(),
                changes: Some(changes),
            })),
            history: config.history.max(1),
        }
    }

    /// Returns the retained revisions of a key, oldest first.
    pub fn history(&self, key: &str) -> StorageResult<Vec<Entry>> {
        let state = self.read()?;
        Ok(state
            .data
            .get(key)
            .map(|retained| retained.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|e| StorageError::Internal(format!("Failed to acquire read lock: {}", e)))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|e| StorageError::Internal(format!("Failed to acquire write lock: {}", e)))
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageRead for InMemoryStorage {
    /// Retrieves the latest entry for a key, tombstones included.
    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, key: &str) -> StorageResult<Option<Entry>> {
        validate_key(key)?;
        let state = self.read()?;
        state.ensure_open()?;
        Ok(state.latest(key).cloned())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn keys(
        &self,
        pattern: Option<&str>,
    ) -> StorageResult<Box<dyn KeyIterator + Send + 'static>> {
        let pattern = pattern.map(KeyPattern::parse).transpose()?;
        let prefix = pattern
            .as_ref()
            .map(KeyPattern::literal_prefix)
            .unwrap_or_default();

        let state = self.read()?;
        state.ensure_open()?;
        let keys: VecDeque<String> = state
            .data
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(_, retained)| retained.back().is_some_and(|entry| !entry.is_tombstone()))
            .filter(|(key, _)| pattern.as_ref().is_none_or(|p| p.matches(key)))
            .map(|(key, _)| key.clone())
            .collect();

        Ok(Box::new(InMemoryKeyIterator { keys }))
    }
}

struct InMemoryKeyIterator {
    keys: VecDeque<String>,
}

#[async_trait]
impl KeyIterator for InMemoryKeyIterator {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn next(&mut self) -> StorageResult<Option<String>> {
        Ok(self.keys.pop_front())
    }
}

/// Watcher over a single key, fed by the bucket's change channel.
struct InMemoryWatcher {
    key: String,
    state: Arc<RwLock<State>>,
    changes: broadcast::Receiver<Entry>,
    initial: Option<Entry>,
    last_revision: u64,
}

impl InMemoryWatcher {
    fn deliver(&mut self, entry: Entry, initial: bool) -> Option<WatchEntry> {
        if entry.revision <= self.last_revision {
            return None;
        }
        self.last_revision = entry.revision;
        Some(WatchEntry { entry, initial })
    }
}

#[async_trait]
impl Watcher for InMemoryWatcher {
    async fn next(&mut self) -> StorageResult<Option<WatchEntry>> {
        if let Some(entry) = self.initial.take() {
            return Ok(self.deliver(entry, true));
        }

        loop {
            match self.changes.recv().await {
                Ok(entry) => {
                    if entry.key != self.key {
                        continue;
                    }
                    if let Some(delivered) = self.deliver(entry, false) {
                        return Ok(Some(delivered));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed revisions cannot be replayed; resume from the
                    // key's latest entry so the final state is still seen.
                    tracing::debug!(key = %self.key, skipped, "watcher lagged, resyncing");
                    let latest = {
                        let state = self.state.read().map_err(|e| {
                            StorageError::Internal(format!("Failed to acquire read lock: {}", e))
                        })?;
                        state.latest(&self.key).cloned()
                    };
                    if let Some(entry) = latest {
                        if let Some(delivered) = self.deliver(entry, false) {
                            return Ok(Some(delivered));
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    /// Writes a value, returning its revision.
    #[tracing::instrument(level = "trace", skip_all)]
    async fn put(&self, key: &str, value: Bytes) -> StorageResult<u64> {
        validate_key(key)?;
        let mut state = self.write()?;
        state.ensure_open()?;
        let revision = state.next_revision();
        state.append(Entry::new(key, value, revision, Operation::Put), self.history);
        Ok(revision)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let mut state = self.write()?;
        state.ensure_open()?;
        let live = state.latest(key).is_some_and(|entry| !entry.is_tombstone());
        if live {
            let revision = state.next_revision();
            state.append(
                Entry::new(key, Bytes::new(), revision, Operation::Delete),
                self.history,
            );
        }
        Ok(())
    }

    fn supports_purge(&self) -> bool {
        true
    }

    /// Replaces every retained revision of the key with a single purge marker.
    #[tracing::instrument(level = "trace", skip_all)]
    async fn purge(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let mut state = self.write()?;
        state.ensure_open()?;
        let purgeable = state
            .latest(key)
            .is_some_and(|entry| entry.operation != Operation::Purge);
        if purgeable {
            let revision = state.next_revision();
            let marker = Entry::new(key, Bytes::new(), revision, Operation::Purge);
            state
                .data
                .insert(key.to_string(), VecDeque::from([marker.clone()]));
            state.notify(marker);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn watch(&self, key: &str) -> StorageResult<Box<dyn Watcher + Send + 'static>> {
        validate_key(key)?;
        // Subscribing and reading the current entry under one lock means no
        // write can land between the two.
        let state = self.read()?;
        let changes = state.changes.as_ref().ok_or(StorageError::Closed)?.subscribe();
        let initial = state.latest(key).cloned();

        Ok(Box::new(InMemoryWatcher {
            key: key.to_string(),
            state: Arc::clone(&self.state),
            changes,
            initial,
            last_revision: 0,
        }))
    }

    async fn close(&self) -> StorageResult<()> {
        let mut state = self.write()?;
        // dropping the sender terminates every open watcher
        state.changes = None;
        Ok(())
    }
}

/// Injected failure that fires either once or on every call.
#[cfg(feature = "test-utils")]
#[derive(Clone)]
enum Failure {
    /// Error is returned once, then automatically cleared.
    Once(StorageError),
    /// Error is returned on every subsequent call until explicitly cleared.
    Persistent(StorageError),
}

#[cfg(feature = "test-utils")]
type FailSlot = arc_swap::ArcSwap<Option<Failure>>;

/// Checks a [`FailSlot`] and returns an error if one is set.
///
/// For [`Failure::Once`], the slot is atomically swapped to `None` so the
/// error fires exactly once. For [`Failure::Persistent`], the slot is left
/// unchanged.
#[cfg(feature = "test-utils")]
fn check_failure(slot: &FailSlot) -> StorageResult<()> {
    let guard = slot.load();
    match guard.as_ref() {
        None => Ok(()),
        Some(Failure::Persistent(err)) => Err(err.clone()),
        Some(Failure::Once(_)) => {
            let prev = slot.swap(Arc::new(None));
            match prev.as_ref() {
                Some(Failure::Once(err)) => Err(err.clone()),
                _ => Ok(()),
            }
        }
    }
}

/// A storage wrapper that delegates to an inner [`Storage`] but can inject
/// failures into `get`, `put`, `delete`/`purge`, and `keys` on demand.
///
/// Gated behind the `test-utils` feature.
///
/// # Example
///
/// ```ignore
/// let inner = Arc::new(InMemoryStorage::new());
/// let storage = FailingStorage::wrap(inner);
/// storage.fail_put(StorageError::Storage("connection reset".into()));
/// // every put call now returns Err(...)
///
/// storage.clear_put();
/// ```
#[cfg(feature = "test-utils")]
pub struct FailingStorage {
    inner: Arc<dyn Storage>,
    fail_get: FailSlot,
    fail_put: FailSlot,
    fail_delete: FailSlot,
    fail_keys: FailSlot,
}

#[cfg(feature = "test-utils")]
impl FailingStorage {
    /// Wraps an existing storage, with all failure injections initially `None`.
    pub fn wrap(inner: Arc<dyn Storage>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_get: arc_swap::ArcSwap::from_pointee(None),
            fail_put: arc_swap::ArcSwap::from_pointee(None),
            fail_delete: arc_swap::ArcSwap::from_pointee(None),
            fail_keys: arc_swap::ArcSwap::from_pointee(None),
        })
    }

    /// Makes `get` return the given error on every subsequent call.
    pub fn fail_get(&self, err: StorageError) {
        self.fail_get.store(Arc::new(Some(Failure::Persistent(err))));
    }

    /// Makes `put` return the given error on every subsequent call.
    pub fn fail_put(&self, err: StorageError) {
        self.fail_put.store(Arc::new(Some(Failure::Persistent(err))));
    }

    /// Makes `put` return the given error on the next call only.
    pub fn fail_put_once(&self, err: StorageError) {
        self.fail_put.store(Arc::new(Some(Failure::Once(err))));
    }

    /// Stops injecting `put` failures.
    pub fn clear_put(&self) {
        self.fail_put.store(Arc::new(None));
    }

    /// Makes `delete` and `purge` return the given error on every subsequent call.
    pub fn fail_delete(&self, err: StorageError) {
        self.fail_delete
            .store(Arc::new(Some(Failure::Persistent(err))));
    }

    /// Makes `keys` return the given error on every subsequent call.
    pub fn fail_keys(&self, err: StorageError) {
        self.fail_keys.store(Arc::new(Some(Failure::Persistent(err))));
    }
}

#[cfg(feature = "test-utils")]
#[async_trait]
impl StorageRead for FailingStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Entry>> {
        check_failure(&self.fail_get)?;
        self.inner.get(key).await
    }

    async fn keys(
        &self,
        pattern: Option<&str>,
    ) -> StorageResult<Box<dyn KeyIterator + Send + 'static>> {
        check_failure(&self.fail_keys)?;
        self.inner.keys(pattern).await
    }
}

#[cfg(feature = "test-utils")]
#[async_trait]
impl Storage for FailingStorage {
    async fn put(&self, key: &str, value: Bytes) -> StorageResult<u64> {
        check_failure(&self.fail_put)?;
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        check_failure(&self.fail_delete)?;
        self.inner.delete(key).await
    }

    fn supports_purge(&self) -> bool {
        self.inner.supports_purge()
    }

    async fn purge(&self, key: &str) -> StorageResult<()> {
        check_failure(&self.fail_delete)?;
        self.inner.purge(key).await
    }

    async fn watch(&self, key: &str) -> StorageResult<Box<dyn Watcher + Send + 'static>> {
        self.inner.watch(key).await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}
