//! Connection lifecycle state machine.
//!
//! ```text
//!            ┌──────────────── stop (from any state) ───────────────┐
//!            ▼                                                      │
//!  idle ─▶ connecting ─▶ (authenticating) ─▶ connected ◀─▶ reconnecting
//!            │  ▲                               │              │
//!            ▼  │ retry                         ▼              ▼
//!          error / auth_required ◀──────────────┴──────────────┘
//! ```

use crate::error::{McpError, McpResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observable state of one server connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Authenticating,
    #[serde(rename_all = "camelCase")]
    Connected {
        /// Access token expiry, for servers using OAuth.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_expires_at: Option<DateTime<Utc>>,
    },
    #[serde(rename_all = "camelCase")]
    Reconnecting { attempt: u32, max_attempts: u32 },
    Error { message: String },
    #[serde(rename_all = "camelCase")]
    AuthRequired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ConnectionState {
    pub fn connected() -> Self {
        Self::Connected {
            token_expires_at: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn auth_required(message: Option<String>) -> Self {
        Self::AuthRequired {
            auth_url: None,
            message,
        }
    }

    /// Status name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected { .. } => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Error { .. } => "error",
            Self::AuthRequired { .. } => "auth_required",
        }
    }

    /// Only a connected server accepts calls.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Whether a transport may be alive in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::Authenticating
                | Self::Connected { .. }
                | Self::Reconnecting { .. }
        )
    }
}

/// Whether the lifecycle allows moving from `from` to `to`.
pub fn can_transition(from: &ConnectionState, to: &ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        // Explicit stop and auth failures apply everywhere.
        (_, Idle) | (_, AuthRequired { .. }) => true,

        (Idle, Connecting) => true,

        (Connecting, Authenticating | Connected { .. } | Reconnecting { .. } | Error { .. }) => {
            true
        }
        (Authenticating, Connected { .. } | Reconnecting { .. } | Error { .. }) => true,

        // Payload updates (token refreshed, next attempt, new message).
        (Connected { .. }, Connected { .. } | Reconnecting { .. } | Error { .. }) => true,
        (Reconnecting { .. }, Reconnecting { .. } | Connected { .. } | Error { .. }) => true,
        (Error { .. }, Error { .. }) => true,

        // Manual retry.
        (Error { .. } | AuthRequired { .. }, Connecting) => true,

        _ => false,
    }
}

/// The state of one server plus the rules for changing it.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ConnectionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Move to `next`, returning the previous state.
    ///
    /// Invalid transitions leave the state unchanged.
    pub fn transition(&mut self, next: ConnectionState) -> McpResult<ConnectionState> {
        if !can_transition(&self.state, &next) {
            return Err(McpError::InvalidTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }
        Ok(std::mem::replace(&mut self.state, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconnecting(attempt: u32) -> ConnectionState {
        ConnectionState::Reconnecting {
            attempt,
            max_attempts: 3,
        }
    }

    #[test]
    fn test_happy_path() {
        let mut machine = StateMachine::new();
        machine.transition(ConnectionState::Connecting).unwrap();
        machine.transition(ConnectionState::Authenticating).unwrap();
        machine.transition(ConnectionState::connected()).unwrap();
        assert!(machine.state().is_usable());
    }

    #[test]
    fn test_reconnect_cycle() {
        let mut machine = StateMachine::new();
        machine.transition(ConnectionState::Connecting).unwrap();
        machine.transition(ConnectionState::connected()).unwrap();
        machine.transition(reconnecting(1)).unwrap();
        machine.transition(reconnecting(2)).unwrap();
        machine.transition(ConnectionState::connected()).unwrap();
        machine.transition(reconnecting(1)).unwrap();
        machine.transition(ConnectionState::error("gave up")).unwrap();
        assert!(!machine.state().is_usable());
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut machine = StateMachine::new();
        let err = machine
            .transition(ConnectionState::connected())
            .unwrap_err();
        assert!(matches!(
            err,
            McpError::InvalidTransition {
                from: "idle",
                to: "connected"
            }
        ));
        assert_eq!(machine.state(), &ConnectionState::Idle);

        machine.transition(ConnectionState::Connecting).unwrap();
        machine.transition(ConnectionState::error("boom")).unwrap();
        assert!(machine.transition(ConnectionState::connected()).is_err());
        assert!(machine.transition(reconnecting(1)).is_err());
        assert_eq!(machine.state().name(), "error");
    }

    #[test]
    fn test_retry_from_error_and_auth_required() {
        let mut machine = StateMachine::new();
        machine.transition(ConnectionState::Connecting).unwrap();
        machine.transition(ConnectionState::error("x")).unwrap();
        machine.transition(ConnectionState::Connecting).unwrap();
        machine
            .transition(ConnectionState::auth_required(None))
            .unwrap();
        machine.transition(ConnectionState::Connecting).unwrap();
    }

    #[test]
    fn test_stop_and_auth_from_anywhere() {
        let states = [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::connected(),
            reconnecting(1),
            ConnectionState::error("e"),
            ConnectionState::auth_required(None),
        ];
        for state in &states {
            assert!(can_transition(state, &ConnectionState::Idle), "{state:?}");
            assert!(
                can_transition(state, &ConnectionState::auth_required(None)),
                "{state:?}"
            );
        }
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_value(ConnectionState::Idle).unwrap();
        assert_eq!(json, serde_json::json!({"status": "idle"}));

        let json = serde_json::to_value(reconnecting(2)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "reconnecting", "attempt": 2, "maxAttempts": 3})
        );

        let json = serde_json::to_value(ConnectionState::AuthRequired {
            auth_url: Some("https://auth".to_string()),
            message: None,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "auth_required", "authUrl": "https://auth"})
        );

        let parsed: ConnectionState =
            serde_json::from_value(serde_json::json!({"status": "error", "message": "m"})).unwrap();
        assert_eq!(parsed, ConnectionState::error("m"));
    }
}
