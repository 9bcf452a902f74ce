// src/connections.rs

//! Connection/credential provider.
//!
//! Operators refer to connections by symbolic name (`"warehouse"`,
//! `"object-store"`). The provider hands back an opaque, ready-to-use handle;
//! nothing in the core parses or stores raw credentials.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::config::model::ConnectionConfig;
use crate::errors::{BatchdagError, OperatorError, Result};
use crate::storage::{LocalObjectStore, ObjectStore};
use crate::warehouse::{SqliteWarehouse, Warehouse};

pub trait ConnectionProvider: Send + Sync {
    fn warehouse(&self, name: &str) -> std::result::Result<Arc<dyn Warehouse>, OperatorError>;
    fn object_store(&self, name: &str)
    -> std::result::Result<Arc<dyn ObjectStore>, OperatorError>;
}

/// Name → handle lookup built from `[connections.<name>]` or by hand in tests.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    warehouses: HashMap<String, Arc<dyn Warehouse>>,
    object_stores: HashMap<String, Arc<dyn ObjectStore>>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut warehouses: Vec<_> = self.warehouses.keys().collect();
        warehouses.sort();
        let mut stores: Vec<_> = self.object_stores.keys().collect();
        stores.sort();
        f.debug_struct("ConnectionRegistry")
            .field("warehouses", &warehouses)
            .field("object_stores", &stores)
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_warehouse(mut self, name: impl Into<String>, wh: Arc<dyn Warehouse>) -> Self {
        self.warehouses.insert(name.into(), wh);
        self
    }

    pub fn with_object_store(mut self, name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        self.object_stores.insert(name.into(), store);
        self
    }

    /// Open every configured connection. Relative paths resolve against
    /// `base_dir` (the directory holding the config file).
    pub fn from_config(
        connections: &std::collections::BTreeMap<String, ConnectionConfig>,
        base_dir: &Path,
    ) -> Result<Self> {
        let mut registry = Self::new();

        for (name, conn) in connections {
            match conn {
                ConnectionConfig::Sqlite { path, pool_size } => {
                    let wh = if path == ":memory:" {
                        SqliteWarehouse::open_in_memory()
                    } else {
                        SqliteWarehouse::open(base_dir.join(path), *pool_size)
                    }
                    .map_err(|e| {
                        BatchdagError::ConfigError(format!("connection '{name}': {e}"))
                    })?;
                    debug!(connection = %name, ?wh, "registered warehouse connection");
                    registry = registry.with_warehouse(name.clone(), Arc::new(wh));
                }
                ConnectionConfig::Local { root } => {
                    let store = LocalObjectStore::new(base_dir.join(root));
                    debug!(connection = %name, root = ?store.root(), "registered object store");
                    registry = registry.with_object_store(name.clone(), Arc::new(store));
                }
            }
        }

        Ok(registry)
    }
}

impl ConnectionProvider for ConnectionRegistry {
    fn warehouse(&self, name: &str) -> std::result::Result<Arc<dyn Warehouse>, OperatorError> {
        self.warehouses
            .get(name)
            .cloned()
            .ok_or_else(|| OperatorError::Permanent(format!("no warehouse connection named '{name}'")))
    }

    fn object_store(
        &self,
        name: &str,
    ) -> std::result::Result<Arc<dyn ObjectStore>, OperatorError> {
        self.object_stores
            .get(name)
            .cloned()
            .ok_or_else(|| {
                OperatorError::Permanent(format!("no object-store connection named '{name}'"))
            })
    }
}
