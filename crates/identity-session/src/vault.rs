//! Typed credential persistence on top of a [`SecureStore`].

use crate::credential::Credential;
use crate::profile::Profile;
use identity_storage::{SecureStore, StorageError, StorageKeys, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Reads and writes the session's credential and profile blobs.
///
/// The whole credential is serialized into one blob under one key, so the
/// store's atomic put replaces it in a single step.
#[derive(Clone)]
pub struct CredentialVault {
    store: Arc<dyn SecureStore>,
    credential_key: String,
    profile_key: String,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn SecureStore>, namespace: &str) -> Self {
        Self {
            store,
            credential_key: StorageKeys::credential(namespace),
            profile_key: StorageKeys::profile(namespace),
        }
    }

    pub fn credential_key(&self) -> &str {
        &self.credential_key
    }

    pub fn load(&self) -> StorageResult<Option<Credential>> {
        self.read(&self.credential_key)
    }

    pub fn save(&self, credential: &Credential) -> StorageResult<()> {
        debug!(identity = %credential.identity(), "Persisting credential");
        self.write(&self.credential_key, credential)
    }

    /// Remove the cached profile, then the credential.
    ///
    /// The credential delete is the commit point: on error the credential is
    /// still persisted and the session keeps its phase.
    pub fn clear(&self) -> StorageResult<()> {
        debug!("Clearing persisted credential");
        self.store.delete(&self.profile_key)?;
        self.store.delete(&self.credential_key)
    }

    pub fn profile_key(&self) -> &str {
        &self.profile_key
    }

    pub fn load_profile(&self) -> StorageResult<Option<Profile>> {
        self.read(&self.profile_key)
    }

    pub fn save_profile(&self, profile: &Profile) -> StorageResult<()> {
        self.write(&self.profile_key, profile)
    }

    /// Raw persisted credential bytes, as written by [`save`](Self::save).
    pub fn raw_credential(&self) -> StorageResult<Option<Vec<u8>>> {
        self.store.get(&self.credential_key)
    }

    /// Serialized form of a credential, identical to what `save` writes.
    pub fn encode(credential: &Credential) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(credential).map_err(|e| StorageError::Encoding(e.to_string()))
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.store.get(key)? {
            Some(blob) => serde_json::from_slice(&blob)
                .map(Some)
                .map_err(|e| StorageError::Encoding(e.to_string())),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        let blob = serde_json::to_vec(value).map_err(|e| StorageError::Encoding(e.to_string()))?;
        self.store.put(key, &blob)
    }
}
