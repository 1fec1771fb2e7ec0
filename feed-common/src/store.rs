use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::feedkey::FeedEntryKey;

/// Enumeration of errors for operations against the feed store.
/// Only transient failures surface here; `not found` and `already exists`
/// are modelled as [`DeleteOutcome`] / [`InsertOutcome`] variants instead,
/// since under at-least-once delivery they are expected results.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("feed store connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("feed store {command} failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("feed store is unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a point insert. `AlreadyExists` means a prior or concurrent
/// execution of the same logical event already converged to this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Outcome of a point delete. `NotFound` means there was no contrary entry
/// to retract (or a concurrent execution already retracted it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// A key-value table holding the daily subscriptions feed.
///
/// Individual inserts and deletes are atomic per key; no multi-key
/// transaction is offered, and the reconciler does not need one.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Insert an entry at `key`, storing `version` alongside it.
    async fn insert_entry(
        &self,
        key: &FeedEntryKey,
        version: i64,
    ) -> Result<InsertOutcome, StoreError>;

    /// Delete the entry at exactly `key`.
    async fn delete_entry(&self, key: &FeedEntryKey) -> Result<DeleteOutcome, StoreError>;

    /// Idempotently create the backing table. Must complete before any
    /// traffic reaches the reconciler.
    async fn ensure_table(&self) -> Result<(), StoreError>;
}

/// Feed store backed by a PostgreSQL table keyed on (partition_key, row_key).
pub struct PgFeedStore {
    table: String,
    pool: PgPool,
}

impl PgFeedStore {
    pub async fn new(url: &str, table: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self::new_from_pool(pool, table))
    }

    pub fn new_from_pool(pool: PgPool, table: &str) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }
}

#[async_trait]
impl FeedStore for PgFeedStore {
    async fn insert_entry(
        &self,
        key: &FeedEntryKey,
        version: i64,
    ) -> Result<InsertOutcome, StoreError> {
        // Table names cannot be bound as query parameters; the name comes
        // from our own configuration, not user input.
        let base_query = format!(
            r#"
INSERT INTO "{0}" (partition_key, row_key, version)
VALUES ($1, $2, $3)
ON CONFLICT (partition_key, row_key) DO NOTHING
            "#,
            &self.table
        );

        let result = sqlx::query(&base_query)
            .bind(&key.partition_key)
            .bind(&key.row_key)
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn delete_entry(&self, key: &FeedEntryKey) -> Result<DeleteOutcome, StoreError> {
        let base_query = format!(
            r#"
DELETE FROM "{0}" WHERE partition_key = $1 AND row_key = $2
            "#,
            &self.table
        );

        let result = sqlx::query(&base_query)
            .bind(&key.partition_key)
            .bind(&key.row_key)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            Ok(DeleteOutcome::NotFound)
        } else {
            Ok(DeleteOutcome::Deleted)
        }
    }

    async fn ensure_table(&self) -> Result<(), StoreError> {
        let base_query = format!(
            r#"
CREATE TABLE IF NOT EXISTS "{0}" (
    partition_key TEXT NOT NULL,
    row_key TEXT NOT NULL,
    version BIGINT NOT NULL,
    inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (partition_key, row_key)
)
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "CREATE TABLE".to_owned(),
                error,
            })?;

        Ok(())
    }
}

/// In-process feed store for tests and local runs.
///
/// Stored entries are keyed by row key, which embeds the partition key.
/// Transient failures can be injected per operation to exercise the
/// reconciler's retry contract without a real backend.
#[derive(Default)]
pub struct MemoryFeedStore {
    entries: Mutex<BTreeMap<String, i64>>,
    failing_inserts: Mutex<u32>,
    failing_deletes: Mutex<u32>,
}

impl MemoryFeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` inserts fail with a transient error.
    pub fn fail_next_inserts(&self, count: u32) {
        *self.failing_inserts.lock().expect("poisoned MemoryFeedStore lock") = count;
    }

    /// Make the next `count` deletes fail with a transient error.
    pub fn fail_next_deletes(&self, count: u32) {
        *self.failing_deletes.lock().expect("poisoned MemoryFeedStore lock") = count;
    }

    pub fn contains(&self, key: &FeedEntryKey) -> bool {
        self.entries
            .lock()
            .expect("poisoned MemoryFeedStore lock")
            .contains_key(&key.row_key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("poisoned MemoryFeedStore lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row keys under a partition key prefix, the way feed readers
    /// enumerate a day's delta.
    pub fn rows_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .expect("poisoned MemoryFeedStore lock")
            .keys()
            .filter(|row_key| row_key.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn take_failure(counter: &Mutex<u32>) -> bool {
        let mut remaining = counter.lock().expect("poisoned MemoryFeedStore lock");
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn insert_entry(
        &self,
        key: &FeedEntryKey,
        version: i64,
    ) -> Result<InsertOutcome, StoreError> {
        if Self::take_failure(&self.failing_inserts) {
            return Err(StoreError::Unavailable("injected insert failure".to_owned()));
        }

        let mut entries = self.entries.lock().expect("poisoned MemoryFeedStore lock");
        if entries.contains_key(&key.row_key) {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            entries.insert(key.row_key.clone(), version);
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn delete_entry(&self, key: &FeedEntryKey) -> Result<DeleteOutcome, StoreError> {
        if Self::take_failure(&self.failing_deletes) {
            return Err(StoreError::Unavailable("injected delete failure".to_owned()));
        }

        let mut entries = self.entries.lock().expect("poisoned MemoryFeedStore lock");
        if entries.remove(&key.row_key).is_some() {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::NotFound)
        }
    }

    async fn ensure_table(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
