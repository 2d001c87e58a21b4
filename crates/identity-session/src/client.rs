//! Identity provider client contract.

use crate::credential::Credential;
use crate::error::{AuthError, AuthResult};
use crate::profile::Profile;
use async_trait::async_trait;

/// Network exchange with the identity provider.
///
/// Calls are time-boxed by the session, so implementations need not enforce
/// their own deadline. Errors must be classified:
/// - [`AuthError::Network`] / [`AuthError::Timeout`] for transport failures
/// - [`AuthError::InvalidGrant`] / [`AuthError::InvalidRefreshToken`] for rejected grants
/// - [`AuthError::Protocol`] for responses that cannot be interpreted
#[async_trait]
pub trait IdentityProviderClient: Send + Sync {
    /// Exchange an authorization code for a credential.
    async fn exchange_auth_code(&self, code: &str) -> AuthResult<Credential>;

    /// Exchange a refresh token for a new credential. The result may omit the
    /// refresh token when the provider keeps the old one valid.
    async fn refresh(&self, refresh_token: &str) -> AuthResult<Credential>;

    /// Resource-owner password grant. Not every provider supports it.
    async fn exchange_password(&self, _email: &str, _password: &str) -> AuthResult<Credential> {
        Err(AuthError::Protocol(
            "password grant not supported by this provider".to_string(),
        ))
    }

    /// Register a new account and return its first credential.
    /// [`AuthError::SignUpRejected`] means the provider refused the account.
    async fn sign_up(&self, _email: &str, _password: &str) -> AuthResult<Credential> {
        Err(AuthError::Protocol(
            "sign-up not supported by this provider".to_string(),
        ))
    }

    /// Fetch the account profile. [`AuthError::Unauthorized`] means the access
    /// token is no longer accepted.
    async fn fetch_profile(&self, _access_token: &str) -> AuthResult<Profile> {
        Err(AuthError::Protocol(
            "profile endpoint not supported by this provider".to_string(),
        ))
    }
}
