//! Logging initialization for the CLI.
//!
//! Logs go to a file in the platform log directory so they never mix with
//! command output. `--verbose` raises the level to debug and mirrors logs
//! to stderr.

use conduit_util::log::{self, default_log_path, LogConfig, LogLevel};
use std::path::PathBuf;

/// Initialize logging. Returns the log file path if logging to a file.
pub fn init_logging(verbose: bool) -> Option<PathBuf> {
    let file = default_log_path();
    let config = LogConfig {
        print: verbose,
        level: if verbose { LogLevel::Debug } else { LogLevel::Info },
        include_location: verbose,
        file: Some(file.clone()),
    };

    match log::init(config) {
        Ok(()) => Some(file),
        Err(e) => {
            eprintln!("Warning: Could not open log file: {e}");
            // Still honour --verbose without the file.
            let fallback = LogConfig {
                print: verbose,
                level: if verbose { LogLevel::Debug } else { LogLevel::Info },
                ..Default::default()
            };
            let _ = log::init(fallback);
            None
        }
    }
}
