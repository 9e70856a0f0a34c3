//! Boundary between the statistics daemon and the engine it maintains.
//!
//! The daemon only sees the engine through these traits: a [`Database`]
//! that reports whether it is still up and hands out connections, and a
//! [`StatsTransaction`] owned by one worker for the duration of a job.

use std::fmt;

use serde::Serialize;
use strum_macros::Display;

use crate::error::DaemonError;

/// Schema-qualified table identity. Used to deduplicate refresh requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TableId {
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

pub type IndexId = u64;

/// An index as described by the catalog when the job started. May be stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub id: IndexId,
    pub name: String,
    /// Number of key columns, not counting the row locator.
    pub key_columns: usize,
}

/// A single key column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Key equality for distinct counting. Null is never equal to anything,
    /// including another null.
    pub fn same_as(&self, other: &Value) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

pub type RowLocation = u64;

/// One index entry: the key columns plus the locator of the base row.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub key: Vec<Value>,
    pub location: RowLocation,
}

impl IndexRow {
    pub fn new(key: Vec<Value>, location: RowLocation) -> Self {
        Self { key, location }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum Isolation {
    ReadUncommitted,
    RepeatableRead,
}

/// Forward cursor over an index, in key order.
pub trait IndexScan {
    /// Replaces the contents of `batch` with up to `max_rows` rows and returns
    /// how many were fetched. Zero means the scan is exhausted.
    fn fetch_next_batch(
        &mut self,
        batch: &mut Vec<IndexRow>,
        max_rows: usize,
    ) -> Result<usize, DaemonError>;
}

/// One row of index statistics: the cardinality of the first `column_count`
/// key columns of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsRow {
    pub table: TableId,
    pub index: IndexId,
    pub column_count: usize,
    pub row_count: u64,
    pub cardinality: u64,
}

/// A transactional connection owned by a single statistics worker.
///
/// Every method may fail with [`DaemonError::LockTimeout`] when the lock
/// manager gives up waiting; the daemon applies its own retry policy on top.
pub trait StatsTransaction: Send {
    /// Current indexes of `table`.
    fn index_descriptors(&mut self, table: &TableId) -> Result<Vec<IndexDescriptor>, DaemonError>;

    fn open_index_scan(
        &mut self,
        table: &TableId,
        index: &IndexDescriptor,
        isolation: Isolation,
    ) -> Result<Box<dyn IndexScan>, DaemonError>;

    /// Records the store's row count estimate for the table. This is a
    /// store-level hint and is not undone by [`rollback`](Self::rollback).
    fn set_row_estimate(&mut self, table: &TableId, rows: u64) -> Result<(), DaemonError>;

    /// Invalidates compiled plans that depend on the table's statistics,
    /// switching the catalog into write mode first.
    fn invalidate_dependents(&mut self, table: &TableId) -> Result<(), DaemonError>;

    fn drop_statistics(&mut self, table: &TableId, index: IndexId) -> Result<(), DaemonError>;

    fn insert_statistics(&mut self, row: StatisticsRow) -> Result<(), DaemonError>;

    /// Whether the index is still present in the catalog.
    fn index_exists(&mut self, table: &TableId, index: IndexId) -> Result<bool, DaemonError>;

    fn commit(&mut self) -> Result<(), DaemonError>;

    /// Rolls back the unit of work, releasing every lock it holds.
    fn rollback(&mut self) -> Result<(), DaemonError>;

    /// True when the transaction holds no uncommitted work.
    fn is_pristine(&self) -> bool;
}

/// The engine as seen by the daemon.
pub trait Database: Send + Sync {
    /// False once the engine has begun shutting down.
    fn is_active(&self) -> bool;

    /// Opens the connection a worker uses for its jobs.
    fn connect(&self) -> Result<Box<dyn StatsTransaction>, DaemonError>;
}
