//! Per-server OAuth configuration.

use serde::{Deserialize, Serialize};

/// Redirect URI registered with authorization servers by default.
///
/// The host application owns this custom scheme and forwards the full
/// callback URL to [`crate::OAuthManager::complete_flow`].
pub const DEFAULT_REDIRECT_URI: &str = "conduit://oauth/callback";

/// OAuth client configuration for one remote server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Pre-registered client ID.
    pub client_id: String,

    /// Client secret. Present only for confidential clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Authorization endpoint. Discovered from `issuer` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,

    /// Token endpoint. Discovered from `issuer` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,

    /// Base URL for RFC 8414 metadata discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    /// Requested scopes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,

    /// Redirect URI override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

impl OAuthConfig {
    /// Create a public-client configuration.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Set both endpoints explicitly.
    pub fn with_endpoints(
        mut self,
        authorization_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        self.authorization_url = Some(authorization_url.into());
        self.token_url = Some(token_url.into());
        self
    }

    /// Set the client secret, making this a confidential client.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Set the requested scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Use `url` as the discovery base unless an issuer is already set.
    pub fn or_issuer(mut self, url: &str) -> Self {
        if self.issuer.is_none() {
            self.issuer = Some(url.to_string());
        }
        self
    }

    /// The redirect URI sent in authorization and token requests.
    pub fn redirect_uri(&self) -> &str {
        self.redirect_uri.as_deref().unwrap_or(DEFAULT_REDIRECT_URI)
    }

    /// Space-separated scope string, if any scopes are configured.
    pub fn scope_param(&self) -> Option<String> {
        (!self.scopes.is_empty()).then(|| self.scopes.join(" "))
    }

    /// Whether the client authenticates with a secret.
    pub fn is_confidential(&self) -> bool {
        self.client_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}
