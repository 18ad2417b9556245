//! Configuration management for the sync services.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Base identity registered with the realtime backend.
pub const DEFAULT_APP_NAME: &str = "frontdesk";

const ENV_LOG_LEVEL: &str = "FRONTDESK_LOG_LEVEL";
const ENV_DATABASE_URL: &str = "FRONTDESK_DATABASE_URL";
const ENV_DATABASE_SECRET: &str = "FRONTDESK_DATABASE_SECRET";
const ENV_APP_NAME: &str = "FRONTDESK_APP_NAME";

/// Timing knobs for heartbeats, liveness windows and reconnect tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTimings {
    /// Presence `lastSeen` refresh interval.
    pub presence_heartbeat_secs: u64,
    /// Presence entries older than this are not counted as viewers.
    pub presence_ttl_secs: u64,
    /// Typing entries older than this are hidden.
    pub typing_ttl_secs: u64,
    /// Idle time after the last keystroke before the typing entry is cleared.
    pub typing_idle_clear_secs: u64,
    /// Offline/online gap for a soft reconnect.
    pub soft_reconnect_delay_ms: u64,
    /// Offline/online gap for a hard reconnect.
    pub hard_reconnect_delay_ms: u64,
    /// How long a recovery tier waits for the connected flag.
    pub connect_timeout_ms: u64,
    /// How long the connection must stay down before the watchdog acts.
    pub disconnect_grace_ms: u64,
    /// Base delay before an event stream is reopened.
    pub stream_retry_base_ms: u64,
    /// Cap on the event stream retry delay.
    pub stream_retry_max_ms: u64,
    /// Consecutive nuclear failures before the watchdog stops escalating.
    pub max_nuclear_failures: u32,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            presence_heartbeat_secs: 30,
            presence_ttl_secs: 120,
            typing_ttl_secs: 8,
            typing_idle_clear_secs: 3,
            soft_reconnect_delay_ms: 300,
            hard_reconnect_delay_ms: 2_500,
            connect_timeout_ms: 10_000,
            disconnect_grace_ms: 5_000,
            stream_retry_base_ms: 2_000,
            stream_retry_max_ms: 30_000,
            max_nuclear_failures: 3,
        }
    }
}

impl SyncTimings {
    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_secs(self.presence_heartbeat_secs)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_secs(self.typing_ttl_secs)
    }

    pub fn typing_idle_clear(&self) -> Duration {
        Duration::from_secs(self.typing_idle_clear_secs)
    }

    pub fn soft_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.soft_reconnect_delay_ms)
    }

    pub fn hard_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.hard_reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Realtime database URL. Absent means the client stays uninitialised.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Realtime database secret or ID token, sent as the `auth` parameter.
    #[serde(default)]
    pub database_secret: Option<String>,
    /// Base identity registered with the realtime backend.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Stable identifier of this device for presence and heartbeats.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub timings: SyncTimings,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_app_name() -> String {
    DEFAULT_APP_NAME.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database_url: None,
            database_secret: None,
            app_name: default_app_name(),
            device_id: None,
            timings: SyncTimings::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from `paths`, falling back to defaults, then
    /// apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            serde_json::from_str(&content).map_err(|source| CoreError::MalformedConfig {
                path: path.to_path_buf(),
                source,
            })?;
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

    /// Apply overrides from a variable lookup (the process environment in
    /// production). Blank values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| {
            lookup(name)
                .map(|raw| raw.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(level) = get(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        if let Some(url) = get(ENV_DATABASE_URL) {
            self.database_url = Some(url);
        }
        if let Some(secret) = get(ENV_DATABASE_SECRET) {
            self.database_secret = Some(secret);
        }
        if let Some(name) = get(ENV_APP_NAME) {
            self.app_name = name;
        }
    }

    /// Returns true if backing-store credentials are present.
    pub fn has_credentials(&self) -> bool {
        self.database_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }

    /// Get the database URL as a parsed URL, if configured.
    pub fn database_url(&self) -> CoreResult<Option<Url>> {
        match self.database_url.as_deref() {
            None => Ok(None),
            Some(raw) => {
                let url = Url::parse(raw)?;
                if url.scheme() != "https" && url.scheme() != "http" {
                    return Err(CoreError::UnsupportedScheme(url.scheme().to_string()));
                }
                Ok(Some(url))
            }
        }
    }

    /// Return the device id, generating one if none is configured yet.
    pub fn ensure_device_id(&mut self) -> String {
        self.device_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }
}
