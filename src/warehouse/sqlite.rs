// src/warehouse/sqlite.rs

//! SQLite-backed reference warehouse.
//!
//! A small pool of connections is shared by all concurrently running
//! operators. File-backed databases use WAL mode plus a busy timeout so that
//! writers to different tables can proceed; busy/locked errors surface as
//! [`WarehouseError::Unavailable`] and are therefore retried.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::debug;

use super::{quote_ident, SqlValue, Statement, Warehouse, WarehouseError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl FromSql for SqlValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(r) => SqlValue::Real(r),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                SqlValue::Text(String::from_utf8_lossy(t).into_owned())
            }
        })
    }
}

fn classify(err: rusqlite::Error) -> WarehouseError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
            ) =>
        {
            WarehouseError::Unavailable(err.to_string())
        }
        _ => WarehouseError::Query(err.to_string()),
    }
}

pub struct SqliteWarehouse {
    location: String,
    pool: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl fmt::Debug for SqliteWarehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteWarehouse")
            .field("location", &self.location)
            .field("pool_size", &self.pool.len())
            .finish_non_exhaustive()
    }
}

impl SqliteWarehouse {
    /// Open (or create) a file-backed warehouse with `pool_size` connections.
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> Result<Self, WarehouseError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| WarehouseError::Unavailable(format!("creating {parent:?}: {e}")))?;
            }
        }

        let mut pool = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(classify)?;
            conn.busy_timeout(BUSY_TIMEOUT).map_err(classify)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
                .map_err(classify)?;
            pool.push(Mutex::new(conn));
        }

        debug!(path = ?path, pool_size = pool.len(), "opened sqlite warehouse");

        Ok(Self {
            location: path.display().to_string(),
            pool,
            next: AtomicUsize::new(0),
        })
    }

    /// Private in-memory warehouse (single connection).
    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Ok(Self {
            location: ":memory:".to_string(),
            pool: vec![Mutex::new(conn)],
            next: AtomicUsize::new(0),
        })
    }

    fn acquire(&self) -> Result<MutexGuard<'_, Connection>, WarehouseError> {
        // Prefer an idle connection, otherwise wait on the round-robin pick.
        for slot in &self.pool {
            if let Ok(guard) = slot.try_lock() {
                return Ok(guard);
            }
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[idx]
            .lock()
            .map_err(|_| WarehouseError::Unavailable("warehouse connection poisoned".to_string()))
    }
}

impl Warehouse for SqliteWarehouse {
    fn table_columns(&self, table: &str) -> Result<Vec<String>, WarehouseError> {
        let pragma = match table.split_once('.') {
            Some((schema, name)) => format!(
                "PRAGMA {}.table_info({})",
                quote_ident(schema),
                quote_ident(name)
            ),
            None => format!("PRAGMA table_info({})", quote_ident(table)),
        };

        let conn = self.acquire()?;
        let mut stmt = conn.prepare(&pragma).map_err(classify)?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(classify)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(classify)?;
        Ok(columns)
    }

    fn execute_atomic(&self, statements: &[Statement]) -> Result<usize, WarehouseError> {
        let mut conn = self.acquire()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify)?;

        let mut affected = 0;
        for statement in statements {
            affected += tx
                .execute(&statement.sql, params_from_iter(statement.params.iter()))
                .map_err(classify)?;
        }

        // Dropping `tx` on the error paths above rolls back.
        tx.commit().map_err(classify)?;
        Ok(affected)
    }

    fn query_scalar(&self, sql: &str) -> Result<SqlValue, WarehouseError> {
        let conn = self.acquire()?;
        let value = conn
            .query_row(sql, [], |row| row.get::<_, SqlValue>(0))
            .optional()
            .map_err(classify)?;
        Ok(value.unwrap_or(SqlValue::Null))
    }

    fn query_rows(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>, WarehouseError> {
        let conn = self.acquire()?;
        let mut stmt = conn.prepare(sql).map_err(classify)?;
        let width = stmt.column_count();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, SqlValue>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(classify)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(classify)?;
        Ok(rows)
    }

    fn execute_script(&self, sql: &str) -> Result<(), WarehouseError> {
        let conn = self.acquire()?;
        conn.execute_batch(sql).map_err(classify)
    }
}
