//! In-memory storage.

use crate::{SecureStore, StorageResult};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// In-memory storage for ephemeral sessions and tests.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SecureStore for MemoryStore {
    fn put(&self, key: &str, blob: &[u8]) -> StorageResult<()> {
        self.data().insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data().get(key).cloned())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.data().remove(key);
        Ok(())
    }
}
