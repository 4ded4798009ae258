//! In-memory storage adapter.
//!
//! Reference implementation of the [`Orm`] port backed by per-table row
//! vectors. Used by the test suite and by embedders that want an
//! ephemeral store.

use crate::error::AuthResult;
use crate::orm::predicate::{compare, Direction, Predicate};
use crate::orm::{FindOptions, Orm, Row};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory [`Orm`] implementation.
#[derive(Default)]
pub struct MemoryOrm {
    tables: RwLock<HashMap<String, Vec<Row>>>,
}

impl MemoryOrm {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row in a table, for assertions in tests.
    pub async fn dump(&self, table: &str) -> Vec<Row> {
        let tables = self.tables.read().await;
        tables.get(table).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Orm for MemoryOrm {
    async fn find_first(&self, table: &str, filter: &Predicate) -> AuthResult<Option<Row>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| filter.matches(r)).cloned()))
    }

    async fn find_many(
        &self,
        table: &str,
        filter: &Predicate,
        options: FindOptions,
    ) -> AuthResult<Vec<Row>> {
        let tables = self.tables.read().await;
        let mut matched: Vec<Row> = tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();

        for (column, direction) in options.order_by.iter().rev() {
            matched.sort_by(|a, b| {
                let ord = match (a.get(column), b.get(column)) {
                    (Some(x), Some(y)) => {
                        compare(x, y).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                match direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }

        if let Some(limit) = options.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn create(&self, table: &str, mut values: Row) -> AuthResult<Row> {
        values
            .entry("id".to_string())
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));

        let mut tables = self.tables.write().await;
        tables
            .entry(table.to_string())
            .or_default()
            .push(values.clone());
        Ok(values)
    }

    async fn update_many(&self, table: &str, filter: &Predicate, set: Row) -> AuthResult<u64> {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };

        let mut count = 0;
        for row in rows.iter_mut().filter(|r| filter.matches(r)) {
            for (k, v) in &set {
                row.insert(k.clone(), v.clone());
            }
            count += 1;
        }
        Ok(count)
    }

    async fn delete_many(&self, table: &str, filter: &Predicate) -> AuthResult<u64> {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };

        let before = rows.len();
        rows.retain(|r| !filter.matches(r));
        Ok((before - rows.len()) as u64)
    }

    async fn count(&self, table: &str, filter: &Predicate) -> AuthResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).count() as u64)
            .unwrap_or(0))
    }

    async fn upsert(
        &self,
        table: &str,
        filter: &Predicate,
        create: Row,
        update: Row,
    ) -> AuthResult<Row> {
        {
            let mut tables = self.tables.write().await;
            if let Some(rows) = tables.get_mut(table) {
                if let Some(row) = rows.iter_mut().find(|r| filter.matches(r)) {
                    for (k, v) in &update {
                        row.insert(k.clone(), v.clone());
                    }
                    return Ok(row.clone());
                }
            }
        }
        self.create(table, create).await
    }
}
