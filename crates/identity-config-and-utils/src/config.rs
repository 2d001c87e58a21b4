//! Configuration management for the identity session.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default token endpoint (can be overridden at compile time via PEACH_IDENTITY_TOKEN_URL).
pub const DEFAULT_TOKEN_URL: &str = match option_env!("PEACH_IDENTITY_TOKEN_URL") {
    Some(url) => url,
    None => "https://id.peach.cool/oauth/token",
};

/// Default OAuth client id (can be overridden at compile time via PEACH_IDENTITY_CLIENT_ID).
pub const DEFAULT_CLIENT_ID: &str = match option_env!("PEACH_IDENTITY_CLIENT_ID") {
    Some(id) => id,
    None => "peach-identity-cli",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default namespace prefix for stored credential keys.
pub const DEFAULT_STORAGE_NAMESPACE: &str = "peach";

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Identity provider endpoints and client registration.
    #[serde(default)]
    pub provider: ProviderSettings,
    /// Session timing knobs.
    #[serde(default)]
    pub session: SessionSettings,
    /// Reachability probe.
    #[serde(default)]
    pub reachability: ReachabilitySettings,
    /// Prefix for credential storage keys.
    #[serde(default = "default_storage_namespace")]
    pub storage_namespace: String,
}

/// Identity provider endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Userinfo endpoint used for profile fetches and unauthorization checks.
    #[serde(default)]
    pub userinfo_url: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Redirect URI sent with the authorization code grant.
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Account registration endpoint. Answers with a token response.
    #[serde(default)]
    pub signup_url: Option<String>,
}

/// Session timing configuration, in seconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionSettings {
    /// Refresh this long before the credential expires.
    pub safety_margin_secs: u64,
    /// Never schedule a refresh sooner than this from now.
    pub min_refresh_interval_secs: u64,
    /// A credential is treated as expired this long before `expires_at`.
    pub clock_skew_tolerance_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Upper bound on a single provider call.
    pub request_timeout_secs: u64,
    /// Consecutive protocol errors tolerated before the session is invalidated.
    pub max_protocol_errors: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            safety_margin_secs: 60,
            min_refresh_interval_secs: 30,
            clock_skew_tolerance_secs: 5,
            backoff_base_secs: 2,
            backoff_max_secs: 300,
            request_timeout_secs: 30,
            max_protocol_errors: 3,
        }
    }
}

impl SessionSettings {
    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.min_refresh_interval_secs)
    }

    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::from_secs(self.clock_skew_tolerance_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Reachability probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReachabilitySettings {
    /// Host to probe. Defaults to the token endpoint host when unset.
    pub probe_host: Option<String>,
    pub probe_port: u16,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for ReachabilitySettings {
    fn default() -> Self {
        Self {
            probe_host: None,
            probe_port: 443,
            probe_interval_secs: 10,
            probe_timeout_secs: 3,
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_storage_namespace() -> String {
    DEFAULT_STORAGE_NAMESPACE.to_string()
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            userinfo_url: None,
            client_id: default_client_id(),
            client_secret: None,
            redirect_uri: None,
            signup_url: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            provider: ProviderSettings::default(),
            session: SessionSettings::default(),
            reachability: ReachabilitySettings::default(),
            storage_namespace: default_storage_namespace(),
        }
    }
}

impl Config {
    /// Load configuration from the config file, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `PEACH_IDENTITY_*` overrides from `lookup`. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(level) = get("PEACH_IDENTITY_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(url) = get("PEACH_IDENTITY_TOKEN_URL") {
            self.provider.token_url = url;
        }
        if let Some(url) = get("PEACH_IDENTITY_USERINFO_URL") {
            self.provider.userinfo_url = Some(url);
        }
        if let Some(id) = get("PEACH_IDENTITY_CLIENT_ID") {
            self.provider.client_id = id;
        }
        if let Some(url) = get("PEACH_IDENTITY_SIGNUP_URL") {
            self.provider.signup_url = Some(url);
        }
    }

    /// Check URLs parse and timing values are coherent.
    pub fn validate(&self) -> CoreResult<()> {
        self.token_url()?;
        self.userinfo_url()?;
        if let Some(url) = &self.provider.signup_url {
            Url::parse(url)?;
        }

        let s = &self.session;
        if s.backoff_base_secs == 0 {
            return Err(CoreError::Config("backoff_base_secs must be > 0".into()));
        }
        if s.backoff_max_secs < s.backoff_base_secs {
            return Err(CoreError::Config(
                "backoff_max_secs must be >= backoff_base_secs".into(),
            ));
        }
        if s.request_timeout_secs == 0 {
            return Err(CoreError::Config("request_timeout_secs must be > 0".into()));
        }
        if s.max_protocol_errors == 0 {
            return Err(CoreError::Config("max_protocol_errors must be > 0".into()));
        }
        if self.provider.client_id.trim().is_empty() {
            return Err(CoreError::Config("provider.client_id is empty".into()));
        }
        Ok(())
    }

    /// Get the token endpoint as a parsed URL.
    pub fn token_url(&self) -> CoreResult<Url> {
        Url::parse(&self.provider.token_url).map_err(CoreError::from)
    }

    /// Get the userinfo endpoint, if configured.
    pub fn userinfo_url(&self) -> CoreResult<Option<Url>> {
        self.provider
            .userinfo_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(CoreError::from)
    }

    /// Host the reachability probe should dial.
    pub fn probe_host(&self) -> Option<String> {
        self.reachability.probe_host.clone().or_else(|| {
            self.token_url()
                .ok()
                .and_then(|url| url.host_str().map(str::to_string))
        })
    }
}
