//! Value encoding for records and index entries.
//!
//! ```text
//! record value: UTF-8 JSON object    {"id":1,"name":"Alice"}
//! index value:  UTF-8 JSON id array  [1,3,7]
//! ```
//!
//! Index ids keep insertion order. An empty id array is never written; the
//! key is deleted instead.

use bytes::Bytes;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::record::Record;

/// Encodes a record as JSON bytes.
pub fn encode_record(record: &Record) -> Result<Bytes> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(|e| Error::Internal(format!("failed to encode record: {}", e)))
}

/// Decodes JSON bytes read from `key` into a record.
///
/// Fails with [`Error::CorruptRecord`] if the bytes are not a JSON object.
pub fn decode_record(key: &str, value: &[u8]) -> Result<Record> {
    match serde_json::from_slice::<Value>(value) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(other) => Err(Error::CorruptRecord {
            key: key.to_string(),
            reason: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
        Err(e) => Err(Error::CorruptRecord {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Encodes an index entry's id list.
pub fn encode_ids(ids: &[u64]) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(ids)?))
}

/// Decodes an index entry's id list.
pub fn decode_ids(key: &str, value: &[u8]) -> Result<Vec<u64>> {
    serde_json::from_slice(value).map_err(|e| Error::CorruptRecord {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn should_encode_record_as_json_text() {
        // given
        let record = json!({"id": 1, "name": "Alice"}).as_object().cloned().unwrap();

        // when
        let encoded = encode_record(&record).unwrap();

        // then
        assert_eq!(encoded, Bytes::from(r#"{"id":1,"name":"Alice"}"#));
    }

    #[test]
    fn should_decode_record() {
        // given
        let bytes = br#"{"id":1,"tags":["a","b"],"nested":{"x":null}}"#;

        // when
        let record = decode_record("User.shard_1.1", bytes).unwrap();

        // then
        assert_eq!(record["tags"], json!(["a", "b"]));
        assert_eq!(record["nested"], json!({"x": null}));
    }

    #[test]
    fn should_fail_with_corrupt_record_on_malformed_json() {
        // when
        let result = decode_record("User.shard_1.1", b"{not json");

        // then
        match result {
            Err(Error::CorruptRecord { key, .. }) => assert_eq!(key, "User.shard_1.1"),
            other => panic!("expected CorruptRecord, got {:?}", other),
        }
    }

    #[test]
    fn should_fail_with_corrupt_record_on_non_object() {
        let result = decode_record("User.shard_1.1", b"[1,2]");
        assert!(matches!(result, Err(Error::CorruptRecord { .. })));
    }

    #[test]
    fn should_encode_ids_in_insertion_order() {
        let encoded = encode_ids(&[7, 1, 3]).unwrap();
        assert_eq!(encoded, Bytes::from("[7,1,3]"));
        assert_eq!(decode_ids("k", &encoded).unwrap(), vec![7, 1, 3]);
    }

    #[test]
    fn should_fail_to_decode_invalid_ids() {
        let result = decode_ids("User.index.email.x", br#"["a"]"#);
        assert!(matches!(result, Err(Error::CorruptRecord { .. })));
    }
}
