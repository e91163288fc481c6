//! OpenData Records - relational-style records over a key-value bucket.
//!
//! Records provides create/find/update/destroy, secondary indexes, predicate
//! queries, per-record watches, and model-level change subscriptions on top
//! of a bucket that only offers single-key reads and writes, wildcard key
//! listing, and single-key change streams.
//!
//! # Architecture
//!
//! Each model owns a key namespace in the shared bucket:
//!
//! ```text
//! User.shard_10.42                 record 42, in shard 42 mod 16
//! User.index.email.alice_x_com     ids of records whose email is alice@x.com
//! ```
//!
//! Mutations write the record, then update the index entries, then notify
//! subscribers. Queries are served by a primary-key read, an index lookup, or
//! a scan of every shard, depending on the predicate.
//!
//! # Key Concepts
//!
//! - **Database**: the bucket connection and the registry of models.
//! - **Model**: CRUD, queries, truncation, watches, and subscriptions for one
//!   record type.
//! - **Predicate** / **Query**: field conditions, plus ordering, pagination,
//!   and projection.
//!
//! # Example
//!
//! ```ignore
//! use records::{Config, Database, ModelDefinition, Operator, Predicate};
//! use serde_json::json;
//!
//! let db = Database::open(Config::default()).await?;
//! let users = db.define(ModelDefinition::new("User").index("email"))?;
//!
//! users.create(json!({"id": 1, "email": "a@x.com", "age": 30}).as_object().cloned().unwrap()).await?;
//!
//! let by_email = users
//!     .find_one(&Predicate::new().equals("email", json!("a@x.com")))
//!     .await?;
//! let adults = users
//!     .find_all(&Predicate::new().op("age", Operator::GreaterOrEqual(json!(18))))
//!     .await?;
//!
//! let handle = users
//!     .watch(1, Some(vec!["age".into()]), |record| println!("{:?}", record))
//!     .await?;
//! handle.stop().await?;
//! ```

mod config;
mod connection;
mod database;
mod error;
mod index;
mod key;
mod model;
mod predicate;
mod query;
mod record;
mod serde;
mod storage;
mod subscribe;
mod truncate;
mod watch;

pub use config::{Config, DEFAULT_SHARD_COUNT, ModelDefinition};
pub use database::Database;
pub use error::{Error, Result};
pub use index::IndexManager;
pub use key::{KeyRouter, sanitize};
pub use model::Model;
pub use predicate::{Condition, LikePattern, Operator, Predicate};
pub use query::{Direction, Plan, Query, QueryEngine};
pub use record::{ID_FIELD, Record, Scan, ScannedRecord};
pub use storage::RecordStore;
pub use subscribe::{ChangeEvent, ChangeOperation, SubscriptionId};
pub use truncate::{TruncateOperator, TruncateReport};
pub use watch::{ChangeWatcher, WatchHandle};
