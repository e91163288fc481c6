//! Storage key construction and shard routing.
//!
//! ```text
//! record key: <model>.shard_<id mod shard_count>.<id>
//! index key:  <model>.index.<field>.<sanitized value>
//! ```
//!
//! Placement is a pure function of the id; the shard count is fixed for the
//! lifetime of a model so no rebalancing is ever needed.

use serde_json::Value;

use crate::error::{Error, Result};

const SHARD_TOKEN_PREFIX: &str = "shard_";
const INDEX_TOKEN: &str = "index";
const SANITIZED_CHAR: char = '_';

/// Checks a model or field name. Names become single key tokens, so they are
/// limited to `[A-Za-z0-9_-]`.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput(format!("{} name is empty", kind)));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-')))
    {
        return Err(Error::InvalidInput(format!(
            "{} name '{}' contains invalid character '{}'",
            kind, name, c
        )));
    }
    Ok(())
}

/// Magnitude from which `f64` can no longer represent every integer.
const EXACT_F64_LIMIT: f64 = 9_007_199_254_740_992.0;

/// Renders a field value as the text used in its index key.
///
/// Strings are used as-is; every other value uses its JSON text, except that
/// integral floats render as integers so `30` and `30.0` share a key.
pub fn render_index_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) if !n.is_i64() && !n.is_u64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => (f as i64).to_string(),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Returns true if every value equal to `value` renders to the same index key.
///
/// Numbers compare by value through `f64` once they leave the exact integer
/// range, so such values must be answered by a scan.
pub fn has_exact_index_key(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64().is_some_and(|f| f.abs() < EXACT_F64_LIMIT),
        _ => true,
    }
}

/// Replaces every character outside `[A-Za-z0-9/_-]` with `_`.
///
/// Distinct values can collide (`a@b` and `a.b` both become `a_b`); readers
/// of an index entry must re-check the field value. An empty input becomes
/// `_` because the bucket rejects empty key tokens.
pub fn sanitize(value: &str) -> String {
    if value.is_empty() {
        return SANITIZED_CHAR.to_string();
    }
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-') {
                c
            } else {
                SANITIZED_CHAR
            }
        })
        .collect()
}

/// Maps ids to shards and builds the storage keys of one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRouter {
    model: String,
    shard_count: u32,
}

impl KeyRouter {
    /// Creates a router, validating the model name and shard count.
    pub fn new(model: impl Into<String>, shard_count: u32) -> Result<Self> {
        let model = model.into();
        validate_name("model", &model)?;
        if shard_count == 0 {
            return Err(Error::InvalidInput(format!(
                "model '{}' must have at least one shard",
                model
            )));
        }
        Ok(Self { model, shard_count })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn shard_of(&self, id: u64) -> u32 {
        // the remainder is below shard_count, so it fits in u32
        (id % u64::from(self.shard_count)) as u32
    }

    pub fn record_key(&self, id: u64) -> String {
        format!(
            "{}.{}{}.{}",
            self.model,
            SHARD_TOKEN_PREFIX,
            self.shard_of(id),
            id
        )
    }

    pub fn index_key(&self, field: &str, value: &Value) -> String {
        format!(
            "{}.{}.{}.{}",
            self.model,
            INDEX_TOKEN,
            field,
            sanitize(&render_index_value(value))
        )
    }

    /// Pattern enumerating every record key in one shard.
    pub fn shard_pattern(&self, shard: u32) -> String {
        format!("{}.{}{}.>", self.model, SHARD_TOKEN_PREFIX, shard)
    }

    /// Pattern enumerating every index key of one field.
    pub fn index_pattern(&self, field: &str) -> String {
        format!("{}.{}.{}.>", self.model, INDEX_TOKEN, field)
    }

    /// Pattern enumerating every index key of the model, whatever the field.
    pub fn all_indexes_pattern(&self) -> String {
        format!("{}.{}.>", self.model, INDEX_TOKEN)
    }

    /// Pattern enumerating every key owned by the model.
    pub fn model_pattern(&self) -> String {
        format!("{}.>", self.model)
    }
}
