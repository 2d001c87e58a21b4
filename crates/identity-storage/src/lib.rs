//! Secure storage abstraction for the Peach identity session.
//!
//! Credentials are stored as opaque blobs under string keys. Every backend
//! replaces a key's value atomically, so a crash never leaves a partially
//! written credential behind.
//!
//! Backends:
//! - **[`MemoryStore`]**: process-local map, used for ephemeral sessions and tests
//! - **[`FileStore`]**: one private file per key, replaced via temp file + rename
//! - **`KeychainStore`** (feature `os-keychain`): the OS credential store via `keyring`

mod file;
mod keys;
mod memory;
mod traits;

#[cfg(feature = "os-keychain")]
mod keychain;

pub use file::FileStore;
pub use keys::StorageKeys;
pub use memory::MemoryStore;
pub use traits::SecureStore;

#[cfg(feature = "os-keychain")]
pub use keychain::KeychainStore;

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Service name used to scope every stored entry.
pub const SERVICE_NAME: &str = "org.peach.identity";

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend-specific failure (keychain locked, service unavailable, ...)
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Key contains characters the backend cannot address safely
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// Stored blob could not be encoded or decoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Create the default persistent store rooted at `dir`.
///
/// With the `os-keychain` feature the OS credential store is used instead and
/// `dir` is ignored.
pub fn create_store(dir: &Path) -> StorageResult<Arc<dyn SecureStore>> {
    #[cfg(feature = "os-keychain")]
    {
        let _ = dir;
        let store = keychain::KeychainStore::new(SERVICE_NAME)?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "os-keychain"))]
    {
        let store = FileStore::open(dir)?;
        Ok(Arc::new(store))
    }
}
