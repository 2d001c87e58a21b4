//! Storage key constants.

/// Storage keys used by the identity session
pub struct StorageKeys;

impl StorageKeys {
    /// Serialized session credential (JSON blob)
    pub const SESSION_CREDENTIAL: &'static str = "session_credential";

    /// Cached account profile (JSON blob)
    pub const SESSION_PROFILE: &'static str = "session_profile";

    /// Credential key scoped to a namespace, e.g. one per identity provider.
    pub fn credential(namespace: &str) -> String {
        Self::scoped(namespace, Self::SESSION_CREDENTIAL)
    }

    /// Profile key scoped to a namespace.
    pub fn profile(namespace: &str) -> String {
        Self::scoped(namespace, Self::SESSION_PROFILE)
    }

    fn scoped(namespace: &str, key: &str) -> String {
        if namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", namespace, key)
        }
    }
}
