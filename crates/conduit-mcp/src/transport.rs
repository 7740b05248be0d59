//! MCP transport implementations.

use crate::error::McpResult;
use crate::logs::LogKind;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its result.
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()>;

    /// Close the transport, rejecting all pending requests.
    async fn close(&self) -> McpResult<()>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Replace the bearer token used for subsequent requests.
    async fn update_auth_token(&self, _token: String) {}
}

/// Something a transport observed that its owner should know about.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Diagnostic output worth recording.
    Log {
        kind: LogKind,
        message: String,
        payload: Option<Value>,
    },
    /// A server notification.
    Notification(JsonRpcMessage),
    /// The event stream dropped and a reconnect attempt is scheduled.
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    /// The event stream is back.
    Reconnected,
    /// The server answered 401.
    AuthRequired,
    /// The transport ended on its own after it had started.
    Closed { code: Option<i32>, reason: String },
}

impl TransportEvent {
    pub fn log(kind: LogKind, message: impl Into<String>) -> Self {
        Self::Log {
            kind,
            message: message.into(),
            payload: None,
        }
    }
}

/// Channel on which a transport reports [`TransportEvent`]s.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
