//! Error types for the identity session.

use crate::credential::CredentialError;
use identity_storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error type for session operations.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Provider unreachable, connection reset, or 5xx
    #[error("Network error: {0}")]
    Network(String),

    /// Provider call exceeded the request timeout
    #[error("Request timed out")]
    Timeout,

    /// Authorization code (or password) rejected
    #[error("Authorization grant rejected")]
    InvalidGrant,

    /// Refresh token rejected by the provider
    #[error("Refresh token rejected")]
    InvalidRefreshToken,

    /// Provider answered with something we could not interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Provider refused to create the account, e.g. the email is taken
    #[error("Sign-up rejected: {0}")]
    SignUpRejected(String),

    /// Provider no longer accepts the access token
    #[error("Access token not accepted")]
    Unauthorized,

    /// SecureStore failure; in-memory state was left at the last persisted value
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Already signed in")]
    AlreadySignedIn,

    #[error("Sign-in already in progress")]
    SignInInProgress,

    /// Result discarded because the session was signed out or restarted meanwhile
    #[error("Operation superseded by a newer session")]
    Superseded,

    /// Provider returned a credential violating its invariants
    #[error("Invalid credential: {0}")]
    InvalidCredential(#[from] CredentialError),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuthError::Network(_)
                | AuthError::Timeout
                | AuthError::Protocol(_)
                | AuthError::Storage(_)
        )
    }

    /// Errors that end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidGrant | AuthError::InvalidRefreshToken | AuthError::Unauthorized
        )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::Timeout
        } else if err.is_decode() {
            AuthError::Protocol(err.to_string())
        } else {
            AuthError::Network(err.to_string())
        }
    }
}

/// Result type alias using AuthError.
pub type AuthResult<T> = Result<T, AuthError>;

/// Why a session ended up `Invalid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidReason {
    /// Sign-in grant rejected
    InvalidGrant,
    /// Refresh token rejected
    RefreshTokenRejected,
    /// Provider kept answering with malformed responses
    RepeatedProtocolErrors { count: u32 },
    /// Provider confirmed the access token is no longer accepted
    Unauthorized,
    /// Credential expired and there was no refresh token to renew it
    ExpiredWithoutRefreshToken,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::InvalidGrant => write!(f, "authorization grant rejected"),
            InvalidReason::RefreshTokenRejected => write!(f, "refresh token rejected"),
            InvalidReason::RepeatedProtocolErrors { count } => {
                write!(f, "{} consecutive protocol errors", count)
            }
            InvalidReason::Unauthorized => write!(f, "access token no longer accepted"),
            InvalidReason::ExpiredWithoutRefreshToken => {
                write!(f, "credential expired without a refresh token")
            }
        }
    }
}
