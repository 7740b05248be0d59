//! Reconnect policy for the HTTP event stream.
//!
//! Delays grow exponentially from a base delay and are capped, with a bound
//! on the number of attempts before the connection is given up.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Initial reconnect delay in milliseconds.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1000;

/// Maximum reconnect delay in milliseconds.
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Maximum number of reconnect attempts.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Backoff factor for exponential delay.
const BACKOFF_FACTOR: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: RECONNECT_BASE_DELAY_MS,
            max_delay_ms: RECONNECT_MAX_DELAY_MS,
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = BACKOFF_FACTOR.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && attempt <= self.max_attempts
    }
}
