// src/warehouse/locks.rs

//! Per-table advisory write locks.
//!
//! Writers to the same table (staging reloads, truncate-insert replacements)
//! are serialized for the duration of their transaction; writers to different
//! tables hold different locks and run fully in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

#[derive(Debug, Default)]
pub struct TableLocks {
    tables: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TableLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the write lock for `table`.
    ///
    /// Table names are compared case-insensitively. A panic inside a previous
    /// holder does not poison the lock for later writers.
    pub fn with_table<R>(&self, table: &str, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(tables.entry(table.to_lowercase()).or_default())
        };

        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        trace!(table, "acquired table write lock");
        f()
    }
}
