//! Logging setup using tracing.
//!
//! This module provides consistent logging configuration across conduit.
//! Library crates only emit events; the binary calls [`init`] once.

use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Whether to print logs to stderr.
    pub print: bool,
    /// Log level.
    pub level: LogLevel,
    /// Whether to include file/line info in logs.
    pub include_location: bool,
    /// Log file path (if any). Appended to, never truncated.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            print: false,
            level: LogLevel::Info,
            include_location: false,
            file: None,
        }
    }
}

impl LogConfig {
    /// Filter directive applied when `RUST_LOG` is unset.
    ///
    /// Only conduit crates are raised to the configured level; dependencies
    /// such as hyper and reqwest stay at `warn`.
    pub fn default_directive(&self) -> String {
        let level = self.level.as_str();
        format!("warn,conduit={level},conduit_mcp={level},conduit_auth={level},conduit_util={level}")
    }
}

/// Initialize logging with the given configuration.
///
/// This should be called once at application startup. Returns an error if the
/// log file cannot be opened or a global subscriber is already installed.
pub fn init(config: LogConfig) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    let stderr_layer = config.print.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
    });

    let file_layer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(std::io::Error::other)
}

/// Get the default log file path.
pub fn default_log_path() -> PathBuf {
    crate::paths::log_dir().join("conduit.log")
}

/// Create a tracing span for a server connection.
#[macro_export]
macro_rules! server_span {
    ($id:expr) => {
        tracing::info_span!("server", id = %$id)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("invalid"), None);
    }

    #[test]
    fn test_log_level_as_str() {
        assert_eq!(LogLevel::Debug.as_str(), "debug");
        assert_eq!(LogLevel::Error.as_str(), "error");
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(!config.print);
        assert_eq!(config.level, LogLevel::Info);
        assert!(config.file.is_none());
    }

    #[test]
    fn test_default_directive_scopes_crates() {
        let config = LogConfig {
            level: LogLevel::Debug,
            ..Default::default()
        };
        let directive = config.default_directive();
        assert!(directive.starts_with("warn,"));
        assert!(directive.contains("conduit_mcp=debug"));
        assert!(directive.contains("conduit_auth=debug"));
    }

    #[test]
    fn test_default_log_path_file_name() {
        assert!(default_log_path().ends_with("conduit.log"));
    }
}
