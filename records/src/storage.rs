//! Record-level storage wrapper.
//!
//! [`RecordStore`] wraps the shared bucket with the key routing and value
//! encoding of one model: records live at router-built keys, reads treat
//! tombstones as absent, and scans tolerate undecodable values.

use std::sync::Arc;

use common::{Entry, KeyIterator, Storage, StorageRead};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::key::KeyRouter;
use crate::record::{Record, Scan, ScannedRecord, record_id};
use crate::serde::{decode_record, encode_record};

/// CRUD and scan operations for the records of one model.
#[derive(Clone)]
pub struct RecordStore {
    connection: Arc<Connection>,
    router: KeyRouter,
}

impl RecordStore {
    pub(crate) fn new(connection: Arc<Connection>, router: KeyRouter) -> Self {
        Self { connection, router }
    }

    pub fn router(&self) -> &KeyRouter {
        &self.router
    }

    pub(crate) fn storage(&self) -> Result<Arc<dyn Storage>> {
        self.connection.storage()
    }

    /// Writes a record at the key derived from its `id`.
    ///
    /// Any existing record with the same id is overwritten; creating twice is
    /// an upsert, not an error.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn create(&self, values: Record) -> Result<Record> {
        let id = record_id(&values)?;
        self.put(id, &values).await?;
        Ok(values)
    }

    /// Reads a record, failing with [`Error::NotFound`] if it is absent or
    /// deleted.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn get(&self, id: u64) -> Result<Record> {
        let key = self.router.record_key(id);
        let entry = self.storage()?.get(&key).await?;
        match entry {
            Some(entry) if !entry.is_tombstone() => decode_record(&key, &entry.value),
            _ => Err(Error::NotFound(key)),
        }
    }

    /// Like [`get`](Self::get), but maps [`Error::NotFound`] to `None`.
    pub async fn find(&self, id: u64) -> Result<Option<Record>> {
        match self.get(id).await {
            Ok(record) => Ok(Some(record)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes `values` as the full record for `id`, returning the revision.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn put(&self, id: u64, values: &Record) -> Result<u64> {
        let key = self.router.record_key(id);
        let value = encode_record(values)?;
        Ok(self.storage()?.put(&key, value).await?)
    }

    /// Deletes a record, leaving a tombstone. No-op if it does not exist.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn delete(&self, id: u64) -> Result<()> {
        let key = self.router.record_key(id);
        self.remove_key(&key, false).await
    }

    /// Deletes a record and compacts its history where the bucket supports it.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn purge(&self, id: u64) -> Result<()> {
        let key = self.router.record_key(id);
        self.remove_key(&key, true).await
    }

    /// Removes any key of this model, purging when asked and supported.
    pub(crate) async fn remove_key(&self, key: &str, purge: bool) -> Result<()> {
        let storage = self.storage()?;
        if purge && storage.supports_purge() {
            storage.purge(key).await?;
        } else {
            storage.delete(key).await?;
        }
        Ok(())
    }

    /// Reads every live record of one shard in key order.
    ///
    /// Undecodable values are logged and collected in [`Scan::errors`];
    /// storage failures abort the scan.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn scan_shard(&self, shard: u32) -> Result<Scan> {
        let storage = self.storage()?;
        let pattern = self.router.shard_pattern(shard);
        let mut keys = storage.keys(Some(&pattern)).await?;

        let mut scan = Scan::default();
        while let Some(key) = keys.next().await? {
            // the key may have been deleted since it was listed
            let Some(entry) = storage.get(&key).await? else {
                continue;
            };
            if entry.is_tombstone() {
                continue;
            }
            match decode_entry(entry) {
                Ok(scanned) => scan.records.push(scanned),
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "skipping corrupt record");
                    scan.errors.push(err);
                }
            }
        }
        Ok(scan)
    }

    /// Scans shards `0..shard_count` in order.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn scan_all(&self) -> Result<Scan> {
        let mut scan = Scan::default();
        for shard in 0..self.router.shard_count() {
            scan.extend(self.scan_shard(shard).await?);
        }
        Ok(scan)
    }
}

fn decode_entry(entry: Entry) -> Result<ScannedRecord> {
    let record = decode_record(&entry.key, &entry.value)?;
    Ok(ScannedRecord {
        key: entry.key,
        record,
    })
}
