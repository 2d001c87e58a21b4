//! # Observability
//!
//! Centralized logging layer for the Peach identity workspace.
//!
//! Binaries call `observability::init_with_config()` once at startup and use
//! standard `tracing` macros everywhere else. Libraries never install a
//! subscriber themselves.
//!
//! When a log path is configured, every event is appended as one JSON line.
//! Field values that look like secrets (tokens, passwords, authorization
//! codes) are replaced with `[REDACTED]` before they reach the file.
//!
//! ## Usage
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "peach-identity".into(),
//!         default_level: "debug".into(),
//!         log_path: Some("/tmp/identity.jsonl".into()),
//!         also_stderr: true,
//!     });
//!
//!     tracing::info!("ready");
//! }
//! ```

mod json_layer;
mod redact;
mod writer;

pub use json_layer::{JsonLayer, LogEntry};
pub use redact::{sanitize_value, REDACTED};
pub use writer::{CentralLogWriter, WriterFactory};

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every JSON log line.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// JSONL log file. No file output when `None`.
    pub log_path: Option<PathBuf>,

    /// Also emit compact logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: true,
        }
    }
}

/// Initialize logging with default settings for `service_name`.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging with custom configuration.
///
/// Installing a second global subscriber is ignored. If the log file cannot be
/// opened, logging continues on stderr only and a warning is emitted.
pub fn init_with_config(config: LogConfig) {
    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_level))
    };

    let (writer, open_error) = match config.log_path.as_ref().map(CentralLogWriter::new) {
        Some(Ok(writer)) => (Some(writer), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    let json_layer = writer.map(|writer| {
        JsonLayer::new(config.service_name.clone(), WriterFactory::new(writer))
            .with_filter(env_filter())
    });

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(io::stderr)
            .with_filter(env_filter())
    });

    let installed = tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if !installed {
        return;
    }

    match (&config.log_path, open_error) {
        (Some(path), Some(e)) => tracing::warn!(
            log_path = %path.display(),
            error = %e,
            "failed to open log file, logging to stderr only"
        ),
        (Some(path), None) => tracing::debug!(
            log_path = %path.display(),
            "observability initialized"
        ),
        _ => {}
    }
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Re-export Level for advanced filtering.
pub use tracing::Level;
