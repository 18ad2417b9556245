//! Logging initialization for the sync services.
//!
//! Structured JSONL goes to the `logs/` directory under the runtime base
//! directory, so `--base-dir` moves logs along with config and flags.

use crate::Paths;
use observability::LogConfig;

/// Service name used by [`init_logging`].
const DEFAULT_SERVICE_NAME: &str = "frontdesk-syncd";

/// Initialize the logging system for the sync daemon.
///
/// ```ignore
/// init_logging(&paths, "info");
/// tracing::info!("sync daemon started");
/// ```
pub fn init_logging(paths: &Paths, level: &str) {
    init_logging_for_service(paths, DEFAULT_SERVICE_NAME, level);
}

/// Initialize logging with a custom service name, so several device
/// processes can share one log stream and still be told apart.
pub fn init_logging_for_service(paths: &Paths, service_name: &str, level: &str) {
    log_config(paths, service_name, level).install();
}

fn log_config(paths: &Paths, service_name: &str, level: &str) -> LogConfig {
    LogConfig::new(service_name)
        .level(parse_level(level).as_str().to_ascii_lowercase())
        .log_path(paths.sync_log_file())
        .stderr(true)
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parse_level_all_variants() {
        assert_eq!(parse_level("trace"), tracing::Level::TRACE);
        assert_eq!(parse_level("debug"), tracing::Level::DEBUG);
        assert_eq!(parse_level("info"), tracing::Level::INFO);
        assert_eq!(parse_level("warn"), tracing::Level::WARN);
        assert_eq!(parse_level("warning"), tracing::Level::WARN);
        assert_eq!(parse_level("error"), tracing::Level::ERROR);
    }

    #[test]
    fn parse_level_case_insensitive() {
        assert_eq!(parse_level("Debug"), tracing::Level::DEBUG);
        assert_eq!(parse_level("WARNING"), tracing::Level::WARN);
    }

    #[test]
    fn parse_level_unknown_defaults_to_info() {
        assert_eq!(parse_level(""), tracing::Level::INFO);
        assert_eq!(parse_level("verbose"), tracing::Level::INFO);
    }

    #[test]
    fn log_file_follows_base_dir() {
        let paths = Paths::with_base_dir(PathBuf::from("/srv/frontdesk"));
        let config = log_config(&paths, "frontdesk-tablet", "WARNING");
        assert_eq!(config.service_name, "frontdesk-tablet");
        assert_eq!(config.default_level, "warn");
        assert_eq!(config.log_path, Some(paths.sync_log_file()));
    }
}
