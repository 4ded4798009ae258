//! Storage port for the engine.
//!
//! A narrow, adapter-neutral query surface over a relational store. The
//! engine depends only on this trait; drivers live outside the crate. The
//! in-memory adapter in [`memory`] is the reference implementation and the
//! one the test suite runs against.

pub mod memory;
pub mod predicate;

pub use memory::MemoryOrm;
pub use predicate::{Direction, Predicate};

use crate::error::AuthResult;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// A stored row: column name to JSON value.
pub type Row = Map<String, Value>;

/// Ordering and pagination options for [`Orm::find_many`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Sort columns, applied in order.
    pub order_by: Vec<(String, Direction)>,
    /// Maximum number of rows to return.
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Sort by a single column.
    #[must_use]
    pub fn order_by(column: impl Into<String>, direction: Direction) -> Self {
        Self {
            order_by: vec![(column.into(), direction)],
            limit: None,
        }
    }

    /// Cap the number of returned rows.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Abstract query surface over a relational store.
///
/// The port is agnostic to transactions; the engine uses careful ordering
/// and idempotent deletes where it needs consistency.
#[async_trait]
pub trait Orm: Send + Sync {
    /// Return the first row matching the predicate, or `None`.
    async fn find_first(&self, table: &str, filter: &Predicate) -> AuthResult<Option<Row>>;

    /// Return all rows matching the predicate, ordered and limited.
    async fn find_many(
        &self,
        table: &str,
        filter: &Predicate,
        options: FindOptions,
    ) -> AuthResult<Vec<Row>>;

    /// Insert a row; returns the created row with server-assigned fields.
    async fn create(&self, table: &str, values: Row) -> AuthResult<Row>;

    /// Merge `set` into every matching row; returns the match count.
    async fn update_many(&self, table: &str, filter: &Predicate, set: Row) -> AuthResult<u64>;

    /// Delete every matching row; returns the delete count.
    async fn delete_many(&self, table: &str, filter: &Predicate) -> AuthResult<u64>;

    /// Count matching rows.
    async fn count(&self, table: &str, filter: &Predicate) -> AuthResult<u64>;

    /// Update the first matching row, or insert `create` when none matches.
    async fn upsert(
        &self,
        table: &str,
        filter: &Predicate,
        create: Row,
        update: Row,
    ) -> AuthResult<Row>;
}

/// Build a row from `(column, value)` pairs.
#[must_use]
pub fn row(pairs: Vec<(&str, Value)>) -> Row {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Deserialize a row into a typed struct.
pub fn from_row<T: serde::de::DeserializeOwned>(row: Row) -> AuthResult<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

/// Serialize a typed struct into a row.
pub fn to_row<T: serde::Serialize>(value: &T) -> AuthResult<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(crate::error::AuthError::internal(
            "Row types must serialize to JSON objects",
        )),
    }
}
