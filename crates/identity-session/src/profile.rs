//! Account profile cached alongside the credential.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    #[default]
    Unspecified,
    Female,
    Male,
    Other,
}

/// Account details as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Provider-internal user id; matches the credential identity.
    pub uid: String,
    /// Id that is safe to show to other users.
    #[serde(default)]
    pub public_uid: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default)]
    pub birthdate: Option<NaiveDate>,
    #[serde(default)]
    pub verified: bool,
}

impl Profile {
    /// Minimal profile with only the uid set.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            public_uid: None,
            display_name: None,
            email_address: None,
            first_name: None,
            last_name: None,
            gender: Gender::Unspecified,
            birthdate: None,
            verified: false,
        }
    }

    /// Display name, falling back to "first last", then the email address.
    pub fn preferred_name(&self) -> Option<String> {
        if let Some(name) = self.display_name.as_ref().filter(|n| !n.is_empty()) {
            return Some(name.clone());
        }
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !full.is_empty() {
            return Some(full);
        }
        self.email_address.clone()
    }
}
