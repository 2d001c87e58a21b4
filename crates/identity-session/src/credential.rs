//! Credential value type.
//!
//! A [`Credential`] is immutable once built. Refreshing produces a new value
//! that replaces the old one; nothing mutates tokens in place.

use crate::clock::chrono_duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Reasons a credential cannot be constructed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential expires at {expires_at} which is not after issue time {issued_at}")]
    ExpiryNotAfterIssue {
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },

    #[error("access token is empty")]
    EmptyAccessToken,

    #[error("identity is empty")]
    EmptyIdentity,
}

/// Access/refresh token pair with expiry and the identity it was issued to.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CredentialRecord")]
pub struct Credential {
    access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
    issued_at: DateTime<Utc>,
    identity: String,
}

/// Unvalidated wire form; every deserialized credential passes through
/// [`Credential::new`].
#[derive(Deserialize)]
struct CredentialRecord {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
    issued_at: DateTime<Utc>,
    identity: String,
}

impl TryFrom<CredentialRecord> for Credential {
    type Error = CredentialError;

    fn try_from(record: CredentialRecord) -> Result<Self, Self::Error> {
        Credential::new(
            record.access_token,
            record.refresh_token,
            record.issued_at,
            record.expires_at,
            record.identity,
        )
    }
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        identity: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let access_token = access_token.into();
        let identity = identity.into();

        if access_token.is_empty() {
            return Err(CredentialError::EmptyAccessToken);
        }
        if identity.is_empty() {
            return Err(CredentialError::EmptyIdentity);
        }
        if expires_at <= issued_at {
            return Err(CredentialError::ExpiryNotAfterIssue {
                issued_at,
                expires_at,
            });
        }

        Ok(Self {
            access_token,
            // An empty refresh token is the same as none
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            expires_at,
            issued_at,
            identity,
        })
    }

    /// Build from a relative lifetime, as returned by OAuth `expires_in`.
    pub fn from_expires_in(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        issued_at: DateTime<Utc>,
        expires_in: Duration,
        identity: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let expires_at = issued_at
            .checked_add_signed(chrono_duration(expires_in))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::new(access_token, refresh_token, issued_at, expires_at, identity)
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// True when `now + skew >= expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        is_expired(self, now, skew)
    }

    /// Time left before `expires_at`, or `None` if already past it.
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Copy of this credential with a different refresh token. Used when a
    /// refresh response omits the refresh token and the old one stays valid.
    pub fn with_refresh_token(&self, refresh_token: Option<String>) -> Self {
        Self {
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            ..self.clone()
        }
    }
}

/// True when `now + clock_skew_tolerance >= credential.expires_at`.
pub fn is_expired(
    credential: &Credential,
    now: DateTime<Utc>,
    clock_skew_tolerance: Duration,
) -> bool {
    now.checked_add_signed(chrono_duration(clock_skew_tolerance))
        .map_or(true, |skewed| skewed >= credential.expires_at)
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}
