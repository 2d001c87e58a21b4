//! File system paths for the identity session.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Name of the base directory under the user's home.
const BASE_DIR_NAME: &str = ".peach-identity";

/// Manages file system paths.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory (~/.peach-identity)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.peach-identity`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(BASE_DIR_NAME),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory.
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.peach-identity/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Directory used by the file-backed credential store.
    pub fn credentials_dir(&self) -> PathBuf {
        self.base_dir.join("credentials")
    }

    /// Get the logs directory (~/.peach-identity/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Structured log file (~/.peach-identity/logs/identity.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("identity.jsonl")
    }

    /// Ensure all required directories exist.
    ///
    /// The credentials directory is created by the store itself with private
    /// permissions.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
