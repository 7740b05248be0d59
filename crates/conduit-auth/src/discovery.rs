//! Authorization server metadata discovery (RFC 8414).

use crate::config::OAuthConfig;
use crate::error::{AuthError, AuthResult};
use serde::Deserialize;
use tracing::debug;
use url::Url;

const WELL_KNOWN_PATH: &str = "/.well-known/oauth-authorization-server";

/// Resolved authorization and token endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEndpoints {
    pub authorization_url: String,
    pub token_url: String,
}

#[derive(Debug, Deserialize)]
struct ServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
}

impl AuthEndpoints {
    /// Endpoints taken straight from the config, if both are present.
    pub(crate) fn from_config(config: &OAuthConfig) -> Option<Self> {
        match (&config.authorization_url, &config.token_url) {
            (Some(authorization_url), Some(token_url)) => Some(Self {
                authorization_url: authorization_url.clone(),
                token_url: token_url.clone(),
            }),
            _ => None,
        }
    }
}

/// Metadata document location for a server or issuer URL.
///
/// Discovery is rooted at the origin; any path on `base` is dropped.
pub(crate) fn metadata_url(base: &str) -> AuthResult<Url> {
    let url = Url::parse(base).map_err(|e| AuthError::Discovery(format!("{base}: {e}")))?;
    url.join(WELL_KNOWN_PATH)
        .map_err(|e| AuthError::Discovery(format!("{base}: {e}")))
}

/// Fetch the metadata document and fill in whatever `config` leaves unset.
pub(crate) async fn discover(
    http: &reqwest::Client,
    config: &OAuthConfig,
) -> AuthResult<AuthEndpoints> {
    let base = config.issuer.as_deref().ok_or_else(|| {
        AuthError::Config("authorization_url and token_url, or an issuer, are required".to_string())
    })?;
    let url = metadata_url(base)?;
    debug!(url = %url, "Discovering authorization server metadata");

    let response = http.get(url.clone()).send().await?;
    if !response.status().is_success() {
        return Err(AuthError::Discovery(format!(
            "{url} returned {}",
            response.status()
        )));
    }
    let metadata: ServerMetadata = response
        .json()
        .await
        .map_err(|e| AuthError::Discovery(format!("invalid metadata from {url}: {e}")))?;

    Ok(AuthEndpoints {
        authorization_url: config
            .authorization_url
            .clone()
            .unwrap_or(metadata.authorization_endpoint),
        token_url: config.token_url.clone().unwrap_or(metadata.token_endpoint),
    })
}
