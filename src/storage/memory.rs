// src/storage/memory.rs

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::{ObjectStore, ObjectStoreError};

/// In-memory object store for tests and dry runs.
///
/// `fail_next_reads(n)` makes the next `n` list calls fail with a transient
/// read error, which is how retry behaviour is exercised without a network.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    failures_left: Arc<Mutex<u32>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, contents: impl Into<Vec<u8>>) {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(key.into(), contents.into());
    }

    pub fn fail_next_reads(&self, n: u32) {
        let mut left = self.failures_left.lock().unwrap_or_else(|e| e.into_inner());
        *left = n;
    }

    fn take_failure(&self, key: &str) -> Result<(), ObjectStoreError> {
        let mut left = self.failures_left.lock().unwrap_or_else(|e| e.into_inner());
        if *left > 0 {
            *left -= 1;
            return Err(ObjectStoreError::Read {
                key: key.to_string(),
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        self.take_failure(prefix)?;
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }
}
