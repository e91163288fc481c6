//! Bulk removal of every record and index entry of a model.

use crate::error::{Error, Result};
use crate::index::IndexManager;
use crate::storage::RecordStore;

/// Outcome of a truncation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TruncateReport {
    /// Record keys removed, corrupt ones included.
    pub records: usize,
    /// Index keys removed.
    pub index_keys: usize,
    /// Record keys whose value could not be decoded.
    pub corrupt_records: usize,
}

/// Clears a model's shards and indexes.
///
/// Not atomic: a failure part way leaves the remaining keys in place, and
/// writes racing with the truncation may survive it. Running it again
/// finishes the job.
pub struct TruncateOperator {
    store: RecordStore,
    indexes: IndexManager,
    purge: bool,
}

impl TruncateOperator {
    /// Creates an operator. With `purge`, keys are purged rather than
    /// deleted when the bucket supports it.
    pub(crate) fn new(store: RecordStore, indexes: IndexManager, purge: bool) -> Self {
        Self {
            store,
            indexes,
            purge,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.store.router().model()))]
    pub async fn truncate(&self) -> Result<TruncateReport> {
        let scan = self.store.scan_all().await?;

        let mut keys = Vec::with_capacity(scan.records.len() + scan.errors.len());
        let mut records = Vec::with_capacity(scan.records.len());
        for scanned in scan.records {
            keys.push(scanned.key);
            records.push(scanned.record);
        }
        let mut corrupt_records = 0;
        for err in scan.errors {
            if let Error::CorruptRecord { key, .. } = err {
                keys.push(key);
                corrupt_records += 1;
            }
        }

        for key in &keys {
            self.store.remove_key(key, self.purge).await?;
        }
        let index_keys = self.indexes.truncate_indexes(&records, self.purge).await?;

        let report = TruncateReport {
            records: keys.len(),
            index_keys,
            corrupt_records,
        };
        tracing::debug!(?report, "truncated model");
        Ok(report)
    }
}
