//! Query planning and execution.
//!
//! The bucket only supports point reads and key enumeration, so every
//! predicate is resolved by one of three plans:
//!
//! | Plan          | When                                   | Cost                 |
//! |---------------|----------------------------------------|----------------------|
//! | `PrimaryKey`  | single equality on `id`                | one read             |
//! | `Index`       | single equality on an indexed field    | one read per id      |
//! |               | (numbers below 2^53 in magnitude)      |                      |
//! | `Scan`        | anything else                          | every record         |
//!
//! Records fetched through an index are re-checked against the predicate, so
//! sanitized-key collisions and stale ids never leak into results.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::index::IndexManager;
use crate::key::has_exact_index_key;
use crate::predicate::{Predicate, compare_values};
use crate::record::{ID_FIELD, Record, value_as_id};
use crate::storage::RecordStore;

/// Sort direction of one ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "ASC" => Ok(Direction::Asc),
            "DESC" => Ok(Direction::Desc),
            other => Err(Error::InvalidInput(format!(
                "unknown sort direction '{}'",
                other
            ))),
        }
    }
}

/// A predicate plus ordering, pagination, and projection.
///
/// # Example
///
/// ```ignore
/// let page = Query::new()
///     .filter(Predicate::new().op("age", Operator::GreaterThan(json!(20))))
///     .order_by("age", Direction::Desc)
///     .offset(10)
///     .limit(10)
///     .attributes(["id", "name"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub predicate: Predicate,
    pub order: Vec<(String, Direction)>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub attributes: Option<Vec<String>>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order.push((field.into(), direction));
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = Some(attributes.into_iter().map(Into::into).collect());
        self
    }

    /// Parses a JSON query:
    ///
    /// ```text
    /// {
    ///   "where": {"age": {"$gt": 20}},
    ///   "order": [["age", "DESC"], ["name", "ASC"]],
    ///   "offset": 1,
    ///   "limit": 10,
    ///   "attributes": ["id", "name"]
    /// }
    /// ```
    ///
    /// Every member is optional. An order entry may also be a bare field name,
    /// sorted ascending.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::InvalidInput(format!(
                "query must be a JSON object, got {}",
                value
            )));
        };

        let mut query = Query::new();
        for (name, member) in map {
            match name.as_str() {
                "where" => query.predicate = Predicate::from_json(member)?,
                "order" => query.order = parse_order(member)?,
                "offset" => query.offset = parse_count(name, member)?,
                "limit" => query.limit = Some(parse_count(name, member)?),
                "attributes" => query.attributes = Some(parse_attributes(member)?),
                other => {
                    return Err(Error::InvalidInput(format!(
                        "unknown query member '{}'",
                        other
                    )));
                }
            }
        }
        Ok(query)
    }

    /// Sorts, paginates, and projects matched records.
    ///
    /// The sort is stable. Records missing an ordering field sort first.
    /// Values of different kinds order as null, boolean, number, string,
    /// array, object; arrays and objects keep their relative order.
    pub fn apply(&self, mut records: Vec<Record>) -> Vec<Record> {
        if !self.order.is_empty() {
            records.sort_by(|a, b| self.compare(a, b));
        }

        let records = records
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX));

        match &self.attributes {
            Some(attributes) => records.map(|r| project(r, attributes)).collect(),
            None => records.collect(),
        }
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for (field, direction) in &self.order {
            let ordering = match (a.get(field), b.get(field)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => kind_rank(x)
                    .cmp(&kind_rank(y))
                    .then_with(|| compare_values(x, y).unwrap_or(Ordering::Equal)),
            };
            let ordering = match direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn project(mut record: Record, attributes: &[String]) -> Record {
    record.retain(|field, _| attributes.iter().any(|a| a == field));
    record
}

fn parse_order(value: &Value) -> Result<Vec<(String, Direction)>> {
    let Value::Array(entries) = value else {
        return Err(Error::InvalidInput(format!(
            "order must be an array, got {}",
            value
        )));
    };
    entries
        .iter()
        .map(|entry| match entry {
            Value::String(field) => Ok((field.clone(), Direction::Asc)),
            Value::Array(pair) => match pair.as_slice() {
                [Value::String(field)] => Ok((field.clone(), Direction::Asc)),
                [Value::String(field), Value::String(direction)] => {
                    Ok((field.clone(), Direction::parse(direction)?))
                }
                _ => Err(Error::InvalidInput(format!(
                    "invalid order entry {}",
                    entry
                ))),
            },
            other => Err(Error::InvalidInput(format!(
                "invalid order entry {}",
                other
            ))),
        })
        .collect()
}

fn parse_count(name: &str, value: &Value) -> Result<usize> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "{} must be a non-negative integer, got {}",
                name, value
            ))
        })
}

fn parse_attributes(value: &Value) -> Result<Vec<String>> {
    let invalid = || {
        Error::InvalidInput(format!(
            "attributes must be an array of field names, got {}",
            value
        ))
    };
    let Value::Array(names) = value else {
        return Err(invalid());
    };
    names
        .iter()
        .map(|name| name.as_str().map(str::to_string).ok_or_else(invalid))
        .collect()
}

/// How a predicate is resolved against the bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Read a single record by id.
    PrimaryKey(u64),
    /// Read the id list of one index entry, then each listed record.
    Index { field: String, value: Value },
    /// Read every record of every shard.
    Scan,
}

/// Resolves predicates for one model.
#[derive(Clone)]
pub struct QueryEngine {
    store: RecordStore,
    indexes: IndexManager,
}

impl QueryEngine {
    pub(crate) fn new(store: RecordStore, indexes: IndexManager) -> Self {
        Self { store, indexes }
    }

    /// Chooses the cheapest plan that can answer `predicate`.
    pub fn plan(&self, predicate: &Predicate) -> Plan {
        match predicate.single_equality() {
            Some((field, value)) if field == ID_FIELD => match value_as_id(value) {
                Some(id) => Plan::PrimaryKey(id),
                // no record can hold a non-integer id
                None => Plan::Scan,
            },
            Some((field, value))
                if self.indexes.is_indexed(field) && has_exact_index_key(value) =>
            {
                Plan::Index {
                    field: field.to_string(),
                    value: value.clone(),
                }
            }
            _ => Plan::Scan,
        }
    }

    /// Returns the first record matching `predicate`, or `None`.
    ///
    /// Index plans return the first live match in index insertion order; scans
    /// return the first match in shard-then-key order and stop at the first
    /// shard that has one.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.store.router().model()))]
    pub async fn find_one(&self, predicate: &Predicate) -> Result<Option<Record>> {
        let plan = self.plan(predicate);
        tracing::debug!(?plan, "resolving find_one");
        match plan {
            Plan::PrimaryKey(id) => Ok(self
                .store
                .find(id)
                .await?
                .filter(|record| predicate.matches(record))),
            Plan::Index { field, value } => {
                for id in self.indexes.lookup(&field, &value).await? {
                    if let Some(record) = self.fetch_indexed(id, predicate).await? {
                        return Ok(Some(record));
                    }
                }
                Ok(None)
            }
            Plan::Scan => {
                for shard in 0..self.store.router().shard_count() {
                    let scan = self.store.scan_shard(shard).await?;
                    let found = scan
                        .into_records()
                        .into_iter()
                        .find(|record| predicate.matches(record));
                    if found.is_some() {
                        return Ok(found);
                    }
                }
                Ok(None)
            }
        }
    }

    /// Returns every record matching `predicate`.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.store.router().model()))]
    pub async fn find_all(&self, predicate: &Predicate) -> Result<Vec<Record>> {
        let plan = self.plan(predicate);
        tracing::debug!(?plan, "resolving find_all");
        match plan {
            Plan::PrimaryKey(id) => Ok(self
                .store
                .find(id)
                .await?
                .filter(|record| predicate.matches(record))
                .into_iter()
                .collect()),
            Plan::Index { field, value } => {
                let mut records = Vec::new();
                for id in self.indexes.lookup(&field, &value).await? {
                    if let Some(record) = self.fetch_indexed(id, predicate).await? {
                        records.push(record);
                    }
                }
                Ok(records)
            }
            Plan::Scan => {
                let scan = self.store.scan_all().await?;
                Ok(scan
                    .into_records()
                    .into_iter()
                    .filter(|record| predicate.matches(record))
                    .collect())
            }
        }
    }

    /// Runs a full query: match, then sort, paginate, and project.
    pub async fn query(&self, query: &Query) -> Result<Vec<Record>> {
        let records = self.find_all(&query.predicate).await?;
        Ok(query.apply(records))
    }

    pub async fn count(&self, predicate: &Predicate) -> Result<usize> {
        Ok(self.find_all(predicate).await?.len())
    }

    /// Reads a record listed in an index entry. Missing, deleted, corrupt,
    /// and non-matching records are skipped.
    async fn fetch_indexed(&self, id: u64, predicate: &Predicate) -> Result<Option<Record>> {
        match self.store.find(id).await {
            Ok(record) => Ok(record.filter(|record| predicate.matches(record))),
            Err(Error::CorruptRecord { key, reason }) => {
                tracing::warn!(key = %key, reason = %reason, "skipping corrupt indexed record");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use common::Storage;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::connection::Connection;
    use crate::index::IndexFields;
    use crate::key::KeyRouter;
    use crate::predicate::Operator;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn engine(shard_count: u32, indexes: &[&str]) -> QueryEngine {
        let store = RecordStore::new(
            Connection::in_memory(),
            KeyRouter::new("User", shard_count).unwrap(),
        );
        let fields = IndexFields::new(indexes.iter().map(|f| f.to_string()).collect()).unwrap();
        let indexes = IndexManager::new(store.clone(), fields);
        QueryEngine::new(store, indexes)
    }

    async fn insert(engine: &QueryEngine, value: Value) {
        let record = record(value);
        engine.store.create(record.clone()).await.unwrap();
        engine.indexes.on_create(&record).await.unwrap();
    }

    #[rstest]
    #[case(Predicate::new().equals("id", json!(3)), Plan::PrimaryKey(3))]
    #[case(Predicate::new().equals("id", json!("3")), Plan::Scan)]
    #[case(
        Predicate::new().equals("email", json!("a@x.com")),
        Plan::Index { field: "email".to_string(), value: json!("a@x.com") }
    )]
    #[case(Predicate::new().equals("name", json!("Alice")), Plan::Scan)]
    #[case(
        Predicate::new().equals("email", json!(30.0)),
        Plan::Index { field: "email".to_string(), value: json!(30.0) }
    )]
    #[case(Predicate::new().equals("email", json!(u64::MAX)), Plan::Scan)]
    #[case(
        Predicate::new().equals("email", json!("a@x.com")).equals("name", json!("A")),
        Plan::Scan
    )]
    #[case(Predicate::new().op("email", Operator::NotEqual(json!("x"))), Plan::Scan)]
    #[case(Predicate::new(), Plan::Scan)]
    fn should_choose_plan(#[case] predicate: Predicate, #[case] expected: Plan) {
        assert_eq!(engine(16, &["email"]).plan(&predicate), expected);
    }

    #[tokio::test]
    async fn should_find_one_by_primary_key() {
        // given
        let engine = engine(16, &[]);
        insert(&engine, json!({"id": 7, "name": "Alice"})).await;

        // when
        let found = engine
            .find_one(&Predicate::new().equals("id", json!(7)))
            .await
            .unwrap();

        // then
        assert_eq!(found, Some(record(json!({"id": 7, "name": "Alice"}))));
    }

    #[tokio::test]
    async fn should_return_none_when_nothing_matches() {
        // given
        let engine = engine(16, &["email"]);
        insert(&engine, json!({"id": 1, "email": "a@x.com", "name": "Alice"})).await;

        // then
        for predicate in [
            Predicate::new().equals("id", json!(2)),
            Predicate::new().equals("email", json!("b@x.com")),
            Predicate::new().equals("name", json!("Bob")),
        ] {
            assert_eq!(engine.find_one(&predicate).await.unwrap(), None);
            assert!(engine.find_all(&predicate).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn should_find_all_through_index_in_insertion_order() {
        // given
        let engine = engine(16, &["email"]);
        insert(&engine, json!({"id": 9, "email": "shared@x.com"})).await;
        insert(&engine, json!({"id": 2, "email": "shared@x.com"})).await;
        insert(&engine, json!({"id": 5, "email": "other@x.com"})).await;

        // when
        let found = engine
            .find_all(&Predicate::new().equals("email", json!("shared@x.com")))
            .await
            .unwrap();

        // then
        let ids: Vec<&Value> = found.iter().map(|r| &r["id"]).collect();
        assert_eq!(ids, vec![&json!(9), &json!(2)]);
    }

    #[tokio::test]
    async fn should_filter_sanitization_collisions_on_index_path() {
        // given
        let engine = engine(16, &["email"]);
        insert(&engine, json!({"id": 1, "email": "a@b"})).await;
        insert(&engine, json!({"id": 2, "email": "a.b"})).await;

        // when
        let found = engine
            .find_all(&Predicate::new().equals("email", json!("a.b")))
            .await
            .unwrap();
        let first = engine
            .find_one(&Predicate::new().equals("email", json!("a.b")))
            .await
            .unwrap();

        // then
        assert_eq!(found, vec![record(json!({"id": 2, "email": "a.b"}))]);
        assert_eq!(first, Some(record(json!({"id": 2, "email": "a.b"}))));
    }

    #[rstest]
    #[case(json!(30), json!(30.0))]
    #[case(json!(30.0), json!(30))]
    #[case(json!(-4), json!(-4.0))]
    #[case(json!(2.5), json!(2.5))]
    #[tokio::test]
    async fn should_agree_with_scan_on_numeric_equality(
        #[case] stored: Value,
        #[case] queried: Value,
    ) {
        // given
        let indexed = engine(16, &["age"]);
        let scanned = engine(16, &[]);
        for engine in [&indexed, &scanned] {
            insert(engine, json!({"id": 1, "age": stored.clone()})).await;
            insert(engine, json!({"id": 2, "age": 99})).await;
        }
        let predicate = Predicate::new().equals("age", queried);

        // when
        let via_index = indexed.find_all(&predicate).await.unwrap();
        let via_scan = scanned.find_all(&predicate).await.unwrap();

        // then
        assert!(matches!(indexed.plan(&predicate), Plan::Index { .. }));
        assert_eq!(via_index.len(), 1);
        assert_eq!(via_index, via_scan);
    }

    #[tokio::test]
    async fn should_answer_large_numbers_with_scan() {
        // given
        let engine = engine(16, &["age"]);
        insert(&engine, json!({"id": 1, "age": 9_007_199_254_740_993u64})).await;
        let predicate = Predicate::new().equals("age", json!(9_007_199_254_740_992.0));

        // when
        let found = engine.find_all(&predicate).await.unwrap();

        // then
        assert_eq!(engine.plan(&predicate), Plan::Scan);
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn should_skip_stale_index_ids() {
        // given
        let engine = engine(16, &["email"]);
        insert(&engine, json!({"id": 1, "email": "a@x.com"})).await;
        insert(&engine, json!({"id": 2, "email": "a@x.com"})).await;
        engine.store.delete(1).await.unwrap();

        // when
        let found = engine
            .find_one(&Predicate::new().equals("email", json!("a@x.com")))
            .await
            .unwrap();

        // then
        assert_eq!(found.unwrap()["id"], json!(2));
    }

    #[tokio::test]
    async fn should_scan_in_shard_then_key_order() {
        // given
        let engine = engine(2, &[]);
        for id in [3, 2, 1, 4] {
            insert(&engine, json!({"id": id, "team": "red"})).await;
        }

        // when
        let first = engine
            .find_one(&Predicate::new().equals("team", json!("red")))
            .await
            .unwrap();
        let all = engine
            .find_all(&Predicate::new().equals("team", json!("red")))
            .await
            .unwrap();

        // then
        assert_eq!(first.unwrap()["id"], json!(2));
        let ids: Vec<u64> = all.iter().filter_map(|r| r["id"].as_u64()).collect();
        assert_eq!(ids, vec![2, 4, 1, 3]);
    }

    #[tokio::test]
    async fn should_skip_corrupt_records_during_scan_queries() {
        // given
        let engine = engine(1, &[]);
        insert(&engine, json!({"id": 1, "age": 30})).await;
        engine
            .store
            .storage()
            .unwrap()
            .put("User.shard_0.2", Bytes::from("not json"))
            .await
            .unwrap();

        // when
        let count = engine.count(&Predicate::new()).await.unwrap();

        // then
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn should_sort_paginate_and_project() {
        // given
        let engine = engine(4, &[]);
        insert(&engine, json!({"id": 1, "name": "Ann", "age": 30})).await;
        insert(&engine, json!({"id": 2, "name": "Bob", "age": 25})).await;
        insert(&engine, json!({"id": 3, "name": "Cid", "age": 30})).await;
        insert(&engine, json!({"id": 4, "name": "Dee", "age": 41})).await;
        let query = Query::new()
            .filter(Predicate::new().op("age", Operator::GreaterOrEqual(json!(25))))
            .order_by("age", Direction::Desc)
            .order_by("name", Direction::Asc)
            .offset(1)
            .limit(2)
            .attributes(["name"]);

        // when
        let page = engine.query(&query).await.unwrap();

        // then
        assert_eq!(
            page,
            vec![record(json!({"name": "Ann"})), record(json!({"name": "Cid"}))]
        );
    }

    #[test]
    fn should_order_mixed_kinds_and_missing_fields() {
        // given
        let records = vec![
            record(json!({"id": 1, "v": "x"})),
            record(json!({"id": 2, "v": [2]})),
            record(json!({"id": 3, "v": 1})),
            record(json!({"id": 4})),
            record(json!({"id": 5, "v": [1]})),
        ];

        // when
        let sorted = Query::new().order_by("v", Direction::Asc).apply(records);

        // then
        let ids: Vec<u64> = sorted.iter().filter_map(|r| r["id"].as_u64()).collect();
        assert_eq!(ids, vec![4, 3, 1, 2, 5]);
    }

    #[test]
    fn should_parse_query_from_json() {
        // when
        let query = Query::from_json(&json!({
            "where": {"age": {"$gt": 20}},
            "order": [["age", "desc"], "name"],
            "offset": 2,
            "limit": 5,
            "attributes": ["id", "name"]
        }))
        .unwrap();

        // then
        assert_eq!(
            query,
            Query::new()
                .filter(Predicate::new().op("age", Operator::GreaterThan(json!(20))))
                .order_by("age", Direction::Desc)
                .order_by("name", Direction::Asc)
                .offset(2)
                .limit(5)
                .attributes(["id", "name"])
        );
    }

    #[rstest]
    #[case(json!({"limit": -1}))]
    #[case(json!({"order": [["age", "sideways"]]}))]
    #[case(json!({"attributes": [1]}))]
    #[case(json!({"group": ["age"]}))]
    fn should_reject_invalid_json_queries(#[case] value: Value) {
        assert!(matches!(Query::from_json(&value), Err(Error::InvalidInput(_))));
    }
}
