// src/warehouse/mod.rs

//! Narrow interface to the warehouse.
//!
//! The core never owns warehouse schema; DDL is supplied externally. Operators
//! only need three things from a warehouse:
//! - the column list of a table (for staging loads),
//! - atomic execution of a batch of statements (one transaction),
//! - scalar queries (for quality checks).
//!
//! [`sqlite`] is the reference implementation; [`locks`] provides the
//! per-table write serialization used by load operators.

pub mod locks;
pub mod sqlite;

use std::cmp::Ordering;
use std::fmt::{self, Debug};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::OperatorError;

pub use locks::TableLocks;
pub use sqlite::SqliteWarehouse;

/// Loosely typed scalar exchanged with the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Integer(i) => Some(*i as f64),
            SqlValue::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// Ordering used by quality checks.
    ///
    /// Numbers compare numerically across integer/real, text compares
    /// lexicographically, NULL is only comparable to NULL.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        match (self, other) {
            (SqlValue::Null, SqlValue::Null) => Some(Ordering::Equal),
            (SqlValue::Null, _) | (_, SqlValue::Null) => None,
            (SqlValue::Text(a), SqlValue::Text(b)) => Some(a.cmp(b)),
            (SqlValue::Integer(a), SqlValue::Integer(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Convert a JSON scalar from a source record.
    ///
    /// Nested arrays/objects are kept as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
            },
            serde_json::Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Real(r) => write!(f, "{r}"),
            SqlValue::Text(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

/// One parameterised statement of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarehouseError {
    /// Busy, locked, connection-level trouble.
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),

    /// The statement itself is wrong (syntax, missing table, constraint).
    #[error("warehouse query failed: {0}")]
    Query(String),
}

impl From<WarehouseError> for OperatorError {
    fn from(err: WarehouseError) -> Self {
        match err {
            WarehouseError::Unavailable(_) => OperatorError::Transient(err.to_string()),
            WarehouseError::Query(_) => OperatorError::Permanent(err.to_string()),
        }
    }
}

/// Warehouse as seen by operators.
pub trait Warehouse: Send + Sync + Debug {
    /// Column names of `table`, in declaration order. Empty if the table does
    /// not exist.
    fn table_columns(&self, table: &str) -> Result<Vec<String>, WarehouseError>;

    /// Execute all statements in one transaction. On error nothing is
    /// committed. Returns the total number of affected rows.
    fn execute_atomic(&self, statements: &[Statement]) -> Result<usize, WarehouseError>;

    /// First column of the first row, or `Null` if the query returned no rows.
    fn query_scalar(&self, sql: &str) -> Result<SqlValue, WarehouseError>;

    /// All rows of a query.
    fn query_rows(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>, WarehouseError>;

    /// Run an externally supplied DDL/setup script.
    fn execute_script(&self, sql: &str) -> Result<(), WarehouseError>;
}

/// Quote a (possibly schema-qualified) identifier.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}
