// src/storage/mod.rs

//! Object storage input.
//!
//! Partitions live under a key prefix resolved from the logical run date,
//! e.g. `log_data/2018/11/05/`. Stores expose just enough to list a partition
//! and read each object.

use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::errors::OperatorError;

pub mod memory;

pub use memory::MemoryObjectStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("object store read failed for '{key}': {message}")]
    Read { key: String, message: String },

    #[error("object '{0}' not found")]
    NotFound(String),
}

impl From<ObjectStoreError> for OperatorError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::Read { .. } => OperatorError::Transient(err.to_string()),
            ObjectStoreError::NotFound(_) => OperatorError::Permanent(err.to_string()),
        }
    }
}

/// Abstract object store interface.
pub trait ObjectStore: Send + Sync + Debug {
    /// Keys of all objects under `prefix`, sorted. A prefix with no objects
    /// yields an empty list rather than an error.
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

/// Object store rooted at a local directory; keys are `/`-separated paths
/// relative to the root.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collect_files(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), ObjectStoreError> {
        let entries = fs::read_dir(dir).map_err(|e| read_error(dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| read_error(dir, e))?.path();
            if path.is_dir() {
                self.collect_files(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

fn read_error(path: &Path, err: std::io::Error) -> ObjectStoreError {
    ObjectStoreError::Read {
        key: path.display().to_string(),
        message: err.to_string(),
    }
}

impl ObjectStore for LocalObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let dir = self.root.join(prefix.trim_start_matches('/'));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        self.collect_files(&dir, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.root.join(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(read_error(&path, e)),
        }
    }
}
