//! MCP error types.

use conduit_auth::AuthError;
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Server not found.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// The server could not be started. The message is the failure reason
    /// as reported by the process or transport.
    #[error("{0}")]
    StartFailed(String),

    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport closed while the request was pending, or before it was sent.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Server process failed.
    #[error("Server process error: {0}")]
    ProcessError(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The server answered with a JSON-RPC error object.
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// No response arrived in time.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Server initialization failed.
    #[error("Server initialization failed: {0}")]
    InitializationFailed(String),

    /// The server rejected our credentials.
    #[error("Authentication required")]
    AuthRequired,

    /// Token storage, exchange or refresh failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The server exists but is not in the connected state.
    #[error("Server '{0}' is not connected")]
    NotConnected(String),

    /// A state change that the connection lifecycle does not allow.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The event stream could not be re-established.
    #[error("Reconnect failed after {0} attempts")]
    ReconnectExhausted(u32),
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Whether the error means the user has to (re)authorize.
    pub fn is_auth_required(&self) -> bool {
        match self {
            Self::AuthRequired => true,
            Self::Auth(e) => e.requires_reauth(),
            _ => false,
        }
    }

    /// Whether the error is a JSON-RPC "method not found" response.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Rpc { code, .. } if *code == METHOD_NOT_FOUND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                McpError::ServerNotFound("test".to_string()),
                "Server not found: test",
            ),
            (
                McpError::StartFailed("missing dependency".to_string()),
                "missing dependency",
            ),
            (
                McpError::ConnectionFailed("refused".to_string()),
                "Connection failed: refused",
            ),
            (McpError::ConnectionClosed, "Connection closed"),
            (
                McpError::Rpc {
                    code: -32601,
                    message: "Method not found".to_string(),
                    data: None,
                },
                "JSON-RPC error -32601: Method not found",
            ),
            (
                McpError::Timeout("tools/list".to_string()),
                "Request timed out: tools/list",
            ),
            (McpError::AuthRequired, "Authentication required"),
            (
                McpError::InvalidTransition {
                    from: "idle",
                    to: "connected",
                },
                "Invalid state transition: idle -> connected",
            ),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_auth_classification() {
        assert!(McpError::AuthRequired.is_auth_required());
        assert!(McpError::Auth(AuthError::InvalidState).is_auth_required());
        assert!(!McpError::Auth(AuthError::NoDataDir).is_auth_required());
        assert!(!McpError::ConnectionClosed.is_auth_required());
    }

    #[test]
    fn test_method_not_found() {
        let err = McpError::Rpc {
            code: METHOD_NOT_FOUND,
            message: "nope".to_string(),
            data: None,
        };
        assert!(err.is_method_not_found());
        assert!(!McpError::ConnectionClosed.is_method_not_found());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let mcp_err: McpError = io_err.into();
        assert!(mcp_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let mcp_err: McpError = json_err.into();
        assert!(mcp_err.to_string().contains("JSON error"));
    }
}
