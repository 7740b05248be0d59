//! In-flight authorization flow records.

use crate::config::OAuthConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Flow records older than this are rejected on callback.
pub const FLOW_TTL_SECS: i64 = 10 * 60;

/// State persisted between opening the browser and receiving the callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthFlowState {
    pub server_id: String,
    pub state: String,
    pub code_verifier: String,
    pub created_at: DateTime<Utc>,
    /// Token endpoint resolved when the flow began.
    pub token_url: String,
    pub config: OAuthConfig,
}

impl OAuthFlowState {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::seconds(FLOW_TTL_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_window() {
        let now = Utc::now();
        let mut flow = OAuthFlowState {
            server_id: "remote".to_string(),
            state: "s".to_string(),
            code_verifier: "v".to_string(),
            created_at: now - Duration::minutes(9),
            token_url: "https://auth/token".to_string(),
            config: OAuthConfig::new("client"),
        };
        assert!(!flow.is_expired(now));

        flow.created_at = now - Duration::minutes(11);
        assert!(flow.is_expired(now));
    }
}
