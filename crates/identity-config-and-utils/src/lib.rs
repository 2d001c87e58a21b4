//! Configuration, paths, and logging bootstrap for the Peach identity session.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, ProviderSettings, ReachabilitySettings, SessionSettings, DEFAULT_CLIENT_ID,
    DEFAULT_LOG_LEVEL, DEFAULT_STORAGE_NAMESPACE, DEFAULT_TOKEN_URL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
