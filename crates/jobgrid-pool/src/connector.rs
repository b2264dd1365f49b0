//! Raw connection traits and the minimal value model the pool exposes
//!
//! The pool is generic over a [`Connector`] so the leasing logic above it
//! can be tested against a scriptable fake while production runs on
//! Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DriverError;

/// A single SQL parameter or result column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<Option<DateTime<Utc>>> for SqlValue {
    fn from(v: Option<DateTime<Utc>>) -> Self {
        match v {
            Some(t) => Self::Timestamp(t),
            None => Self::Null,
        }
    }
}

/// One result row, columns in select order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One physical database connection.
///
/// The pool owns the transaction demarcation; implementations only need to
/// run statements and report driver failures verbatim.
#[async_trait]
pub trait RawConnection: Send + 'static {
    /// Open a transaction on this connection
    async fn begin(&mut self) -> Result<(), DriverError>;

    /// Execute one statement, returning any result rows
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DriverError>;

    /// Commit the open transaction
    async fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back the open transaction
    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Close the connection. Errors are ignored by the pool.
    async fn close(self);
}

/// Opens physical connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: RawConnection;

    async fn connect(&self) -> Result<Self::Connection, DriverError>;
}
