//! File system paths for the sync services.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Directory name created under the home directory.
const BASE_DIR_NAME: &str = ".frontdesk";
/// Persisted transport failure flags, cleared by a nuclear reconnect.
const FLAGS_FILE_NAME: &str = "flags.json";

/// Manages file system paths for the sync services.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for runtime files (~/.frontdesk)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.frontdesk`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or(CoreError::HomeDirUnavailable)?;

        Ok(Self {
            base_dir: home.join(BASE_DIR_NAME),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.frontdesk).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.frontdesk/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the persisted failure-flag file (~/.frontdesk/flags.json).
    pub fn flags_file(&self) -> PathBuf {
        self.base_dir.join(FLAGS_FILE_NAME)
    }

    /// Get the logs directory (~/.frontdesk/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Get the sync log file path (~/.frontdesk/logs/sync.jsonl).
    pub fn sync_log_file(&self) -> PathBuf {
        self.logs_dir().join("sync.jsonl")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
