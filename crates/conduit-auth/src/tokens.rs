//! Token responses and persisted token sets.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Access tokens with less than this many seconds left are refreshed.
pub const REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Refresh tokens older than this produce a re-authorization warning.
pub const REFRESH_TOKEN_STALE_DAYS: i64 = 30;

/// Token endpoint response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Tokens stored for a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Absolute access token expiry. `None` means the provider gave no lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// When the current refresh token was issued.
    pub issued_at: DateTime<Utc>,
}

impl TokenSet {
    /// Build a token set from a fresh authorization code exchange.
    pub fn from_response(response: OAuthTokens, now: DateTime<Utc>) -> Self {
        Self {
            expires_at: expiry(now, response.expires_in),
            access_token: response.access_token,
            token_type: response.token_type,
            refresh_token: response.refresh_token,
            scope: response.scope,
            issued_at: now,
        }
    }

    /// Merge a refresh response into this set.
    ///
    /// The old refresh token is kept when the provider does not rotate it,
    /// and `issued_at` only moves when a new refresh token arrives.
    pub fn rotated(&self, response: OAuthTokens, now: DateTime<Utc>) -> Self {
        let rotated = response
            .refresh_token
            .as_ref()
            .is_some_and(|t| Some(t) != self.refresh_token.as_ref());
        Self {
            expires_at: expiry(now, response.expires_in),
            access_token: response.access_token,
            token_type: response.token_type,
            refresh_token: response.refresh_token.or_else(|| self.refresh_token.clone()),
            scope: response.scope.or_else(|| self.scope.clone()),
            issued_at: if rotated { now } else { self.issued_at },
        }
    }

    /// Whether the access token is within the refresh margin of expiring.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now < Duration::seconds(REFRESH_MARGIN_SECS),
            None => false,
        }
    }

    /// Whether the refresh token is old enough to warrant re-authorization.
    pub fn is_refresh_token_stale(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token.is_some()
            && now - self.issued_at > Duration::days(REFRESH_TOKEN_STALE_DAYS)
    }
}

fn expiry(now: DateTime<Utc>, expires_in: Option<u64>) -> Option<DateTime<Utc>> {
    expires_in
        .and_then(|secs| i64::try_from(secs).ok())
        .map(|secs| now + Duration::seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(refresh: Option<&str>, expires_in: Option<u64>) -> OAuthTokens {
        OAuthTokens {
            access_token: "access".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: refresh.map(String::from),
            expires_in,
            scope: None,
        }
    }

    #[test]
    fn test_token_type_defaults_to_bearer() {
        let tokens: OAuthTokens = serde_json::from_str(r#"{"access_token": "a"}"#).unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert!(tokens.expires_in.is_none());
    }

    #[test]
    fn test_needs_refresh_threshold() {
        let now = Utc::now();
        let mut set = TokenSet::from_response(response(None, Some(3600)), now);
        assert!(!set.needs_refresh(now));

        set.expires_at = Some(now + Duration::seconds(120));
        assert!(set.needs_refresh(now));

        set.expires_at = Some(now - Duration::seconds(1));
        assert!(set.needs_refresh(now));

        set.expires_at = None;
        assert!(!set.needs_refresh(now));
    }

    #[test]
    fn test_rotation_resets_issued_at() {
        let then = Utc::now() - Duration::days(10);
        let now = Utc::now();
        let set = TokenSet::from_response(response(Some("r1"), Some(60)), then);

        let kept = set.rotated(response(None, Some(3600)), now);
        assert_eq!(kept.refresh_token.as_deref(), Some("r1"));
        assert_eq!(kept.issued_at, then);

        let same = set.rotated(response(Some("r1"), Some(3600)), now);
        assert_eq!(same.issued_at, then);

        let rotated = set.rotated(response(Some("r2"), Some(3600)), now);
        assert_eq!(rotated.refresh_token.as_deref(), Some("r2"));
        assert_eq!(rotated.issued_at, now);
    }

    #[test]
    fn test_refresh_token_staleness() {
        let now = Utc::now();
        let set = TokenSet::from_response(response(Some("r"), None), now - Duration::days(31));
        assert!(set.is_refresh_token_stale(now));

        let fresh = TokenSet::from_response(response(Some("r"), None), now - Duration::days(29));
        assert!(!fresh.is_refresh_token_stale(now));

        let no_refresh = TokenSet::from_response(response(None, None), now - Duration::days(90));
        assert!(!no_refresh.is_refresh_token_stale(now));
    }
}
