//! Data types for record operations.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Name of the primary identifier field every record must carry.
pub const ID_FIELD: &str = "id";

/// A record: field name to JSON value.
pub type Record = Map<String, Value>;

/// Interprets a JSON value as a primary id.
pub fn value_as_id(value: &Value) -> Option<u64> {
    value.as_u64()
}

/// Extracts the primary id of a record.
///
/// Fails with [`Error::InvalidInput`] when `id` is missing or is not a
/// non-negative integer.
pub fn record_id(record: &Record) -> Result<u64> {
    match record.get(ID_FIELD) {
        Some(value) => value_as_id(value).ok_or_else(|| {
            Error::InvalidInput(format!(
                "field '{}' must be a non-negative integer, got {}",
                ID_FIELD, value
            ))
        }),
        None => Err(Error::InvalidInput(format!(
            "record is missing primary field '{}'",
            ID_FIELD
        ))),
    }
}

/// A decoded record together with the key it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedRecord {
    pub key: String,
    pub record: Record,
}

/// Output of a shard scan.
///
/// Undecodable records do not abort a scan; they are reported in `errors`
/// as [`Error::CorruptRecord`] while the remaining records are still returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scan {
    pub records: Vec<ScannedRecord>,
    pub errors: Vec<Error>,
}

impl Scan {
    pub(crate) fn extend(&mut self, other: Scan) {
        self.records.extend(other.records);
        self.errors.extend(other.errors);
    }

    /// Drops the keys and returns only the decoded records.
    pub fn into_records(self) -> Vec<Record> {
        self.records.into_iter().map(|scanned| scanned.record).collect()
    }
}
