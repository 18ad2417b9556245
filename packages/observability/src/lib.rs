//! # Observability
//!
//! Structured JSONL logging for the Frontdesk sync services.
//!
//! Every `tracing` event becomes one JSON object per line, by default in
//! `~/.frontdesk/logs/sync.jsonl`. Several device processes can append to
//! the same file while exercising one session; the `service` and span
//! `context` fields tell them apart:
//!
//! ```text
//! tail -f ~/.frontdesk/logs/sync.jsonl | jq 'select(.context.session_id == "2024-06-01")'
//! ```
//!
//! Fields whose name looks like a credential are redacted.
//!
//! ```rust,ignore
//! observability::LogConfig::new("frontdesk-syncd")
//!     .level("debug")
//!     .stderr(true)
//!     .install();
//! ```

mod dev;
mod json_layer;

use std::path::PathBuf;

pub use dev::{default_log_path, CentralLogWriter};
pub use json_layer::{JsonLayer, LogEntry};

/// How and where to log. Built with [`LogConfig::new`] and applied once
/// with [`LogConfig::install`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Written on every line as `service`.
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset.
    pub default_level: String,
    /// Overrides [`default_log_path`].
    pub log_path: Option<PathBuf>,
    /// Mirror events to stderr in compact form.
    pub also_stderr: bool,
}

impl LogConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.default_level = level.into();
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn stderr(mut self, enabled: bool) -> Self {
        self.also_stderr = enabled;
        self
    }

    /// Install the global subscriber. Later calls are ignored. If the log
    /// file cannot be opened, stderr output is used instead.
    pub fn install(&self) {
        dev::init_subscriber(self);
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "frontdesk".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

pub use tracing::{debug, error, info, instrument, trace, warn, Level};
