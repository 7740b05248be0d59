//! Error types for authentication operations.

use thiserror::Error;

/// Errors that can occur during authentication operations.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Failed to read or write the credential file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize credential data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level HTTP failure talking to the authorization server.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The callback's state value matched no live flow record.
    #[error("invalid or expired state")]
    InvalidState,

    /// The authorization server redirected back with an error.
    #[error("Authorization denied: {0}")]
    Denied(String),

    /// The callback carried neither a code nor an error.
    #[error("No authorization code provided")]
    MissingCode,

    /// The callback URL could not be parsed.
    #[error("Invalid callback URL: {0}")]
    InvalidCallback(String),

    /// The token endpoint rejected the authorization code.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// The token endpoint rejected the refresh token.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Refresh was needed but no refresh token is stored.
    #[error("No refresh token stored for '{0}'")]
    NoRefreshToken(String),

    /// Authorization server metadata could not be discovered.
    #[error("Authorization server discovery failed: {0}")]
    Discovery(String),

    /// The auth configuration is incomplete.
    #[error("Invalid OAuth configuration: {0}")]
    Config(String),

    /// The system browser could not be launched.
    #[error("Failed to open browser: {0}")]
    Browser(String),

    /// Could not determine the data directory.
    #[error("Could not determine data directory")]
    NoDataDir,

    /// Failed to set file permissions.
    #[error("Failed to set file permissions: {0}")]
    Permissions(String),
}

impl AuthError {
    /// Whether recovering from this error needs a fresh browser authorization.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Self::InvalidState
                | Self::Denied(_)
                | Self::TokenExchange(_)
                | Self::RefreshFailed(_)
                | Self::NoRefreshToken(_)
        )
    }
}

/// Result type for auth operations.
pub type AuthResult<T> = Result<T, AuthError>;
