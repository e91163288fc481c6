//! Field predicates evaluated against decoded records.
//!
//! A [`Predicate`] is an ordered list of per-field conditions, all of which
//! must hold. A condition is either a bare value (equality) or a set of
//! [`Operator`]s evaluated in order until one fails.
//!
//! Predicates can be built in code or parsed from JSON:
//!
//! ```ignore
//! let adults = Predicate::new()
//!     .op("age", Operator::GreaterOrEqual(json!(18)))
//!     .equals("team", json!("red"));
//!
//! let same = Predicate::from_json(&json!({
//!     "age": {"$gte": 18},
//!     "team": "red"
//! }))?;
//! ```

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::record::Record;

/// A comparison applied to a single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Equal(Value),
    NotEqual(Value),
    GreaterThan(Value),
    GreaterOrEqual(Value),
    LessThan(Value),
    LessOrEqual(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Like(LikePattern),
}

impl Operator {
    /// Evaluates the operator against a field value, `None` when the record
    /// lacks the field.
    ///
    /// A missing field only satisfies the negative operators. Values that
    /// cannot be ordered against each other fail every range comparison.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return matches!(self, Operator::NotEqual(_) | Operator::NotIn(_));
        };
        match self {
            Operator::Equal(expected) => values_equal(value, expected),
            Operator::NotEqual(expected) => !values_equal(value, expected),
            Operator::GreaterThan(bound) => {
                compare_values(value, bound) == Some(Ordering::Greater)
            }
            Operator::GreaterOrEqual(bound) => matches!(
                compare_values(value, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::LessThan(bound) => compare_values(value, bound) == Some(Ordering::Less),
            Operator::LessOrEqual(bound) => matches!(
                compare_values(value, bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In(candidates) => candidates.iter().any(|c| values_equal(value, c)),
            Operator::NotIn(candidates) => !candidates.iter().any(|c| values_equal(value, c)),
            Operator::Like(pattern) => value.as_str().is_some_and(|s| pattern.is_match(s)),
        }
    }

    fn from_json(name: &str, operand: &Value) -> Result<Self> {
        let operator = match name {
            "$eq" => Operator::Equal(operand.clone()),
            "$ne" => Operator::NotEqual(operand.clone()),
            "$gt" => Operator::GreaterThan(operand.clone()),
            "$gte" => Operator::GreaterOrEqual(operand.clone()),
            "$lt" => Operator::LessThan(operand.clone()),
            "$lte" => Operator::LessOrEqual(operand.clone()),
            "$in" => Operator::In(operand_list(name, operand)?),
            "$notIn" => Operator::NotIn(operand_list(name, operand)?),
            "$like" => match operand {
                Value::String(pattern) => Operator::Like(LikePattern::new(pattern)?),
                other => {
                    return Err(Error::InvalidInput(format!(
                        "operator '$like' expects a string, got {}",
                        other
                    )));
                }
            },
            unknown => {
                return Err(Error::InvalidInput(format!(
                    "unknown operator '{}'",
                    unknown
                )));
            }
        };
        Ok(operator)
    }
}

fn operand_list(name: &str, operand: &Value) -> Result<Vec<Value>> {
    match operand {
        Value::Array(values) => Ok(values.clone()),
        other => Err(Error::InvalidInput(format!(
            "operator '{}' expects an array, got {}",
            name, other
        ))),
    }
}

/// A SQL `LIKE` pattern: `%` matches any run of characters, `_` exactly one.
///
/// Matching is anchored to the whole value and case-insensitive.
#[derive(Debug, Clone)]
pub struct LikePattern {
    pattern: String,
    regex: Regex,
}

impl LikePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut translated = String::with_capacity(pattern.len() + 2);
        translated.push('^');
        let mut buf = [0u8; 4];
        for c in pattern.chars() {
            match c {
                '%' => translated.push_str(".*"),
                '_' => translated.push('.'),
                other => translated.push_str(&regex::escape(other.encode_utf8(&mut buf))),
            }
        }
        translated.push('$');

        let regex = RegexBuilder::new(&translated)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| Error::InvalidInput(format!("invalid like pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

/// The condition placed on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The field must equal the value.
    Equals(Value),
    /// Every operator must hold.
    Operators(Vec<Operator>),
}

impl Condition {
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Condition::Equals(expected) => value.is_some_and(|v| values_equal(v, expected)),
            Condition::Operators(operators) => operators.iter().all(|op| op.matches(value)),
        }
    }

    /// Parses a JSON condition. Objects whose keys all start with `$` are
    /// operator sets; anything else is an equality value.
    fn from_json(field: &str, condition: &Value) -> Result<Self> {
        let Value::Object(map) = condition else {
            return Ok(Condition::Equals(condition.clone()));
        };
        let operator_keys = map.keys().filter(|k| k.starts_with('$')).count();
        if operator_keys == 0 {
            return Ok(Condition::Equals(condition.clone()));
        }
        if operator_keys != map.len() {
            return Err(Error::InvalidInput(format!(
                "condition on '{}' mixes operators and plain keys",
                field
            )));
        }
        let operators = map
            .iter()
            .map(|(name, operand)| Operator::from_json(name, operand))
            .collect::<Result<Vec<_>>>()?;
        Ok(Condition::Operators(operators))
    }
}

/// A conjunction of field conditions. An empty predicate matches every
/// record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    conditions: Vec<(String, Condition)>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `field` to equal `value`, replacing any earlier condition on
    /// the field.
    pub fn equals(mut self, field: impl Into<String>, value: Value) -> Self {
        let field = field.into();
        self.conditions.retain(|(f, _)| *f != field);
        self.conditions.push((field, Condition::Equals(value)));
        self
    }

    /// Adds an operator to the conditions on `field`.
    pub fn op(mut self, field: impl Into<String>, operator: Operator) -> Self {
        let field = field.into();
        match self.conditions.iter_mut().find(|(f, _)| *f == field) {
            Some((_, condition)) => {
                let previous = std::mem::replace(condition, Condition::Operators(Vec::new()));
                let mut operators = match previous {
                    Condition::Operators(operators) => operators,
                    Condition::Equals(value) => vec![Operator::Equal(value)],
                };
                operators.push(operator);
                *condition = Condition::Operators(operators);
            }
            None => self
                .conditions
                .push((field, Condition::Operators(vec![operator]))),
        }
        self
    }

    /// Parses a JSON object of field conditions, e.g.
    /// `{"age": {"$gt": 20}, "name": "Bob"}`. `null` is the empty predicate.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => {
                let conditions = map
                    .iter()
                    .map(|(field, condition)| {
                        Condition::from_json(field, condition).map(|c| (field.clone(), c))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self { conditions })
            }
            other => Err(Error::InvalidInput(format!(
                "predicate must be a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[(String, Condition)] {
        &self.conditions
    }

    /// Returns the field and value when the predicate is exactly one
    /// equality test, the shape that can be served by a key lookup.
    pub fn single_equality(&self) -> Option<(&str, &Value)> {
        let [(field, condition)] = self.conditions.as_slice() else {
            return None;
        };
        match condition {
            Condition::Equals(value) => Some((field.as_str(), value)),
            Condition::Operators(operators) => match operators.as_slice() {
                [Operator::Equal(value)] => Some((field.as_str(), value)),
                _ => None,
            },
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(field, condition)| condition.matches(record.get(field)))
    }
}

impl From<Record> for Predicate {
    /// Equality on every field of the record.
    fn from(record: Record) -> Self {
        Self {
            conditions: record
                .into_iter()
                .map(|(field, value)| (field, Condition::Equals(value)))
                .collect(),
        }
    }
}

/// JSON equality, except that numbers compare by numeric value so `1` equals
/// `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Orders two values of the same kind: numbers, strings, or booleans.
///
/// Returns `None` for mixed kinds, nulls, arrays, and objects.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return Some(x.cmp(&y));
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return Some(x.cmp(&y));
            }
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
