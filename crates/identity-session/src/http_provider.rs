//! OAuth 2.0 token endpoint client.

use crate::client::IdentityProviderClient;
use crate::clock::Clock;
use crate::credential::Credential;
use crate::error::{AuthError, AuthResult};
use crate::profile::{Gender, Profile};
use async_trait::async_trait;
use chrono::NaiveDate;
use identity_config_and_utils::ProviderSettings;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Successful token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    user: Option<TokenUser>,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
}

/// RFC 6749 error body.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Userinfo response; accepts OpenID Connect claim names and a few common
/// alternatives.
#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    #[serde(alias = "id", alias = "uid")]
    sub: String,
    #[serde(default, alias = "public_uid")]
    preferred_username: Option<String>,
    #[serde(default, alias = "display_name")]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, alias = "first_name")]
    given_name: Option<String>,
    #[serde(default, alias = "last_name")]
    family_name: Option<String>,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default)]
    birthdate: Option<String>,
    #[serde(default, alias = "verified")]
    email_verified: Option<bool>,
}

impl From<UserInfoResponse> for Profile {
    fn from(info: UserInfoResponse) -> Self {
        let gender = match info.gender.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("female") => Gender::Female,
            Some("male") => Gender::Male,
            Some("other") => Gender::Other,
            _ => Gender::Unspecified,
        };
        Profile {
            uid: info.sub,
            public_uid: info.preferred_username,
            display_name: info.name,
            email_address: info.email,
            first_name: info.given_name,
            last_name: info.family_name,
            gender,
            birthdate: info
                .birthdate
                .and_then(|b| NaiveDate::parse_from_str(&b, "%Y-%m-%d").ok()),
            verified: info.email_verified.unwrap_or(false),
        }
    }
}

/// Which grant a token request carries; decides how `invalid_grant` maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantKind {
    AuthorizationCode,
    RefreshToken,
    Password,
}

/// [`IdentityProviderClient`] over a standard OAuth 2.0 token endpoint and an
/// optional userinfo endpoint.
pub struct OAuthProviderClient {
    http: Client,
    token_url: Url,
    userinfo_url: Option<Url>,
    signup_url: Option<Url>,
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
    clock: Arc<dyn Clock>,
}

impl OAuthProviderClient {
    pub fn new(settings: &ProviderSettings, clock: Arc<dyn Clock>) -> AuthResult<Self> {
        let token_url = Url::parse(&settings.token_url)?;
        let userinfo_url = settings
            .userinfo_url
            .as_deref()
            .map(Url::parse)
            .transpose()?;
        let signup_url = settings
            .signup_url
            .as_deref()
            .map(Url::parse)
            .transpose()?;
        if settings.client_id.trim().is_empty() {
            return Err(AuthError::Config("provider client_id is empty".to_string()));
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            token_url,
            userinfo_url,
            signup_url,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            redirect_uri: settings.redirect_uri.clone(),
            clock,
        })
    }

    async fn token_request(
        &self,
        kind: GrantKind,
        params: Vec<(&str, String)>,
    ) -> AuthResult<Credential> {
        debug!(url = %self.token_url, grant = ?kind, "Requesting token");
        self.post_for_credential(&self.token_url, params, |status, body| {
            map_token_error(kind, status, body)
        })
        .await
    }

    /// POST a form with the client credentials and turn a token response into
    /// a credential. `map_error` classifies non-success responses.
    async fn post_for_credential(
        &self,
        url: &Url,
        mut params: Vec<(&str, String)>,
        map_error: impl Fn(StatusCode, &[u8]) -> AuthError,
    ) -> AuthResult<Credential> {
        params.push(("client_id", self.client_id.clone()));
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(url.clone())
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(map_error(status, &body));
        }

        let token: TokenResponse = parse_json(&body)?;
        let issued_at = self.clock.now();

        let identity = match token
            .sub
            .or(token.user_id)
            .or(token.user.map(|u| u.id))
        {
            Some(identity) => identity,
            None => self.fetch_user_info(&token.access_token).await?.sub,
        };

        Ok(Credential::from_expires_in(
            token.access_token,
            token.refresh_token,
            issued_at,
            Duration::from_secs(token.expires_in),
            identity,
        )?)
    }

    async fn fetch_user_info(&self, access_token: &str) -> AuthResult<UserInfoResponse> {
        let Some(url) = &self.userinfo_url else {
            return Err(AuthError::Protocol(
                "token response has no subject and no userinfo endpoint is configured"
                    .to_string(),
            ));
        };

        let response = self
            .http
            .get(url.clone())
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        match status {
            s if s.is_success() => parse_json(&body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::Unauthorized),
            s if is_retryable_status(s) => Err(AuthError::Network(format!(
                "userinfo endpoint returned {}",
                s
            ))),
            s => Err(AuthError::Protocol(format!(
                "userinfo endpoint returned {}",
                s
            ))),
        }
    }
}

#[async_trait]
impl IdentityProviderClient for OAuthProviderClient {
    async fn exchange_auth_code(&self, code: &str) -> AuthResult<Credential> {
        let mut params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
        ];
        if let Some(redirect_uri) = &self.redirect_uri {
            params.push(("redirect_uri", redirect_uri.clone()));
        }
        self.token_request(GrantKind::AuthorizationCode, params).await
    }

    async fn refresh(&self, refresh_token: &str) -> AuthResult<Credential> {
        let params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        self.token_request(GrantKind::RefreshToken, params).await
    }

    async fn exchange_password(&self, email: &str, password: &str) -> AuthResult<Credential> {
        let params = vec![
            ("grant_type", "password".to_string()),
            ("username", email.to_string()),
            ("password", password.to_string()),
        ];
        self.token_request(GrantKind::Password, params).await
    }

    async fn sign_up(&self, email: &str, password: &str) -> AuthResult<Credential> {
        let Some(url) = &self.signup_url else {
            return Err(AuthError::Protocol(
                "no sign-up endpoint is configured".to_string(),
            ));
        };

        debug!(url = %url, "Registering account");
        let params = vec![
            ("email", email.to_string()),
            ("password", password.to_string()),
        ];
        self.post_for_credential(url, params, map_sign_up_error).await
    }

    async fn fetch_profile(&self, access_token: &str) -> AuthResult<Profile> {
        self.fetch_user_info(access_token).await.map(Profile::from)
    }
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> AuthResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| AuthError::Protocol(format!("malformed response body: {}", e)))
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn map_token_error(kind: GrantKind, status: StatusCode, body: &[u8]) -> AuthError {
    if is_retryable_status(status) {
        return AuthError::Network(format!("token endpoint returned {}", status));
    }

    let Ok(error) = serde_json::from_slice::<TokenErrorResponse>(body) else {
        return AuthError::Protocol(format!(
            "token endpoint returned {} without an OAuth error body",
            status
        ));
    };

    warn!(
        status = %status,
        error = %error.error,
        description = error.error_description.as_deref().unwrap_or(""),
        "Token endpoint rejected request"
    );

    match (error.error.as_str(), kind) {
        ("invalid_grant", GrantKind::RefreshToken) => AuthError::InvalidRefreshToken,
        ("invalid_grant", _) => AuthError::InvalidGrant,
        ("temporarily_unavailable", _) => {
            AuthError::Network("token endpoint temporarily unavailable".to_string())
        }
        (other, _) => AuthError::Protocol(format!("token endpoint error: {}", other)),
    }
}

fn map_sign_up_error(status: StatusCode, body: &[u8]) -> AuthError {
    if is_retryable_status(status) {
        return AuthError::Network(format!("sign-up endpoint returned {}", status));
    }

    let error = serde_json::from_slice::<TokenErrorResponse>(body).ok();
    match (status, error) {
        (_, Some(error)) => {
            warn!(status = %status, error = %error.error, "Sign-up rejected");
            AuthError::SignUpRejected(error.error_description.unwrap_or(error.error))
        }
        (StatusCode::CONFLICT, None) => {
            AuthError::SignUpRejected("account already exists".to_string())
        }
        (s, None) if s.is_client_error() => {
            AuthError::SignUpRejected(format!("sign-up endpoint returned {}", s))
        }
        (s, None) => AuthError::Protocol(format!("sign-up endpoint returned {}", s)),
    }
}
