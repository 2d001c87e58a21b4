//! Storage trait definitions.

use crate::StorageResult;

/// Trait for secure blob storage backends.
///
/// Implementations must make `put` and `delete` atomic per key: a reader sees
/// either the previous blob or the new one, never a mix.
pub trait SecureStore: Send + Sync {
    /// Store a blob, replacing any previous value.
    fn put(&self, key: &str, blob: &[u8]) -> StorageResult<()>;

    /// Retrieve a blob.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Delete a blob. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> StorageResult<()>;

    /// Check if a key exists
    fn has(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}
