//! OS credential store backend via `keyring`.

use crate::{SecureStore, StorageError, StorageResult};
use keyring::Entry;
use tracing::debug;

/// Stores blobs in the platform credential store (Keychain, Secret Service,
/// Windows Credential Manager).
pub struct KeychainStore {
    service: String,
}

impl KeychainStore {
    pub fn new(service: &str) -> StorageResult<Self> {
        Ok(Self {
            service: service.to_string(),
        })
    }

    fn entry(&self, key: &str) -> StorageResult<Entry> {
        Entry::new(&self.service, key).map_err(map_keyring_error)
    }
}

impl SecureStore for KeychainStore {
    fn put(&self, key: &str, blob: &[u8]) -> StorageResult<()> {
        debug!(service = %self.service, key = %key, "Setting secret");
        self.entry(key)?
            .set_secret(blob)
            .map_err(map_keyring_error)
    }

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        debug!(service = %self.service, key = %key, "Getting secret");
        match self.entry(key)?.get_secret() {
            Ok(blob) => Ok(Some(blob)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(map_keyring_error(e)),
        }
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        debug!(service = %self.service, key = %key, "Deleting secret");
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(map_keyring_error(e)),
        }
    }
}

fn map_keyring_error(err: keyring::Error) -> StorageError {
    match err {
        keyring::Error::BadEncoding(_) => StorageError::Encoding(err.to_string()),
        keyring::Error::TooLong(..) | keyring::Error::Invalid(..) => {
            StorageError::InvalidKey(err.to_string())
        }
        other => StorageError::Backend(other.to_string()),
    }
}
