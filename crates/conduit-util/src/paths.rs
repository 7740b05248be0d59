//! Platform-specific directories.
//!
//! - Config: `~/.config/conduit` (Linux), `~/Library/Application Support/conduit` (macOS),
//!   `%APPDATA%\conduit` (Windows)
//! - Data (credentials): platform data dir + `conduit`
//! - Logs: `~/.local/state/conduit/logs` (Linux), `~/Library/Logs/conduit` (macOS),
//!   `%LOCALAPPDATA%\conduit\logs` (Windows)

use std::path::PathBuf;

/// Application directory name.
pub const APP_DIR: &str = "conduit";

/// Directory holding `conduit.json`.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR))
}

/// Directory holding persisted credentials.
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join(APP_DIR))
}

/// Default path of the credential store file.
pub fn default_credentials_path() -> Option<PathBuf> {
    data_dir().map(|p| p.join("credentials.json"))
}

/// Get the log directory path.
pub fn log_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Some(home) = dirs::home_dir() {
            return home.join("Library/Logs").join(APP_DIR);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Some(state_dir) = dirs::state_dir() {
            return state_dir.join(APP_DIR).join("logs");
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(".local/state").join(APP_DIR).join("logs");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(local_app) = dirs::data_local_dir() {
            return local_app.join(APP_DIR).join("logs");
        }
    }

    PathBuf::from(".conduit/logs")
}
