//! Authorization Code + PKCE flow and token lifecycle.

use crate::browser::BrowserOpener;
use crate::config::OAuthConfig;
use crate::discovery::{self, AuthEndpoints};
use crate::error::{AuthError, AuthResult};
use crate::flow::{OAuthFlowState, FLOW_TTL_SECS};
use crate::pkce;
use crate::storage::CredentialStore;
use crate::tokens::{OAuthTokens, TokenSet, REFRESH_TOKEN_STALE_DAYS};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// Result of a successful callback.
#[derive(Debug, Clone)]
pub struct CompletedFlow {
    pub server_id: String,
    pub tokens: TokenSet,
}

/// A usable access token returned by [`OAuthManager::ensure_valid`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether a refresh happened to produce this token.
    pub refreshed: bool,
    /// Set when the refresh token is old enough that re-authorization is advised.
    pub warning: Option<String>,
}

/// Runs authorization flows and keeps stored tokens fresh.
pub struct OAuthManager {
    http: reqwest::Client,
    store: Arc<dyn CredentialStore>,
    browser: Arc<dyn BrowserOpener>,
    /// Discovered endpoints keyed by issuer.
    discovered: RwLock<HashMap<String, AuthEndpoints>>,
    /// One lock per server so a rotated refresh token is only spent once.
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl OAuthManager {
    pub fn new(store: Arc<dyn CredentialStore>, browser: Arc<dyn BrowserOpener>) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
            browser,
            discovered: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Use a preconfigured HTTP client for token and discovery requests.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Start an authorization flow for `server_id`.
    ///
    /// Persists a flow record, opens the browser and returns the
    /// authorization URL. Failing to open the browser is logged, not fatal:
    /// the caller can still show the URL.
    pub async fn begin_flow(&self, server_id: &str, config: &OAuthConfig) -> AuthResult<String> {
        if config.client_id.is_empty() {
            return Err(AuthError::Config("client_id is required".to_string()));
        }
        let endpoints = self.endpoints(config).await?;

        let now = Utc::now();
        let pruned = self
            .store
            .prune_flows(now - Duration::seconds(FLOW_TTL_SECS))
            .await?;
        if pruned > 0 {
            debug!(pruned, "Dropped expired authorization flows");
        }

        let code_verifier = pkce::generate_code_verifier();
        let challenge = pkce::generate_code_challenge(&code_verifier);
        let state = pkce::generate_state();

        let url = build_auth_url(
            &endpoints.authorization_url,
            &config.client_id,
            config.redirect_uri(),
            config.scope_param().as_deref(),
            &state,
            &challenge,
        );

        self.store
            .save_flow(OAuthFlowState {
                server_id: server_id.to_string(),
                state,
                code_verifier,
                created_at: now,
                token_url: endpoints.token_url,
                config: config.clone(),
            })
            .await?;

        info!(server = %server_id, "Starting OAuth authorization");
        if let Err(e) = self.browser.open(&url) {
            warn!(server = %server_id, error = %e, "Could not open browser");
        }

        Ok(url)
    }

    /// Finish a flow from the redirect URL delivered to the host.
    ///
    /// The flow record is consumed whether or not the exchange succeeds.
    pub async fn complete_flow(&self, callback_url: &str) -> AuthResult<CompletedFlow> {
        let url = Url::parse(callback_url)
            .map_err(|e| AuthError::InvalidCallback(format!("{callback_url}: {e}")))?;
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

        let state = params.get("state").ok_or(AuthError::InvalidState)?;
        let flow = self
            .store
            .take_flow(state)
            .await?
            .ok_or(AuthError::InvalidState)?;
        if flow.is_expired(Utc::now()) {
            warn!(server = %flow.server_id, "Authorization callback arrived after flow expired");
            return Err(AuthError::InvalidState);
        }

        if let Some(error) = params.get("error") {
            let description = params
                .get("error_description")
                .map(|d| format!("{error}: {d}"))
                .unwrap_or_else(|| error.clone());
            return Err(AuthError::Denied(description));
        }
        let code = params.get("code").ok_or(AuthError::MissingCode)?;

        let response = self.exchange_code(&flow, code).await?;
        let tokens = TokenSet::from_response(response, Utc::now());
        self.store
            .save_tokens(&flow.server_id, tokens.clone())
            .await?;

        info!(server = %flow.server_id, "OAuth authorization complete");
        Ok(CompletedFlow {
            server_id: flow.server_id,
            tokens,
        })
    }

    fn refresh_lock(&self, server_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(server_id.to_string())
            .or_default()
            .clone()
    }

    /// Refresh the stored access token for `server_id` unconditionally.
    pub async fn refresh(&self, server_id: &str, config: &OAuthConfig) -> AuthResult<TokenSet> {
        let lock = self.refresh_lock(server_id);
        let _guard = lock.lock().await;
        self.refresh_locked(server_id, config).await
    }

    /// Caller holds the refresh lock for `server_id`.
    async fn refresh_locked(&self, server_id: &str, config: &OAuthConfig) -> AuthResult<TokenSet> {
        let current = self
            .store
            .load_tokens(server_id)
            .await?
            .ok_or_else(|| AuthError::NoRefreshToken(server_id.to_string()))?;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::NoRefreshToken(server_id.to_string()))?;

        let endpoints = self.endpoints(config).await?;
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        if !config.is_confidential() {
            params.push(("client_id", config.client_id.as_str()));
        }

        let response = self
            .token_request(&endpoints.token_url, config, &params)
            .await
            .map_err(|e| match e {
                AuthError::TokenExchange(msg) => AuthError::RefreshFailed(msg),
                other => other,
            })?;

        let refreshed = current.rotated(response, Utc::now());
        self.store.save_tokens(server_id, refreshed.clone()).await?;
        debug!(server = %server_id, expires_at = ?refreshed.expires_at, "Refreshed access token");
        Ok(refreshed)
    }

    /// Return a usable access token, refreshing first if it is about to expire.
    ///
    /// `Ok(None)` means no tokens are stored and the user has to authorize.
    pub async fn ensure_valid(
        &self,
        server_id: &str,
        config: &OAuthConfig,
    ) -> AuthResult<Option<ValidToken>> {
        let Some(mut tokens) = self.store.load_tokens(server_id).await? else {
            return Ok(None);
        };

        let mut refreshed = false;
        if tokens.needs_refresh(Utc::now()) {
            let lock = self.refresh_lock(server_id);
            let _guard = lock.lock().await;

            // Another caller may have refreshed while we waited.
            let Some(current) = self.store.load_tokens(server_id).await? else {
                return Ok(None);
            };
            if current.needs_refresh(Utc::now()) {
                tokens = self.refresh_locked(server_id, config).await?;
                refreshed = true;
            } else {
                refreshed = current.access_token != tokens.access_token;
                tokens = current;
            }
        }

        let warning = tokens.is_refresh_token_stale(Utc::now()).then(|| {
            let message = format!(
                "Refresh token for '{server_id}' is older than {REFRESH_TOKEN_STALE_DAYS} days; re-authorize soon"
            );
            warn!(server = %server_id, "{message}");
            message
        });

        Ok(Some(ValidToken {
            access_token: tokens.access_token,
            expires_at: tokens.expires_at,
            refreshed,
            warning,
        }))
    }

    /// Stored tokens for a server, without refreshing.
    pub async fn tokens(&self, server_id: &str) -> AuthResult<Option<TokenSet>> {
        self.store.load_tokens(server_id).await
    }

    /// Forget the tokens stored for a server.
    pub async fn logout(&self, server_id: &str) -> AuthResult<bool> {
        info!(server = %server_id, "Removing stored OAuth tokens");
        self.store.remove_tokens(server_id).await
    }

    async fn exchange_code(&self, flow: &OAuthFlowState, code: &str) -> AuthResult<OAuthTokens> {
        let config = &flow.config;
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", config.redirect_uri()),
            ("code_verifier", flow.code_verifier.as_str()),
        ];
        if !config.is_confidential() {
            params.push(("client_id", config.client_id.as_str()));
        }
        self.token_request(&flow.token_url, config, &params).await
    }

    async fn token_request(
        &self,
        token_url: &str,
        config: &OAuthConfig,
        params: &[(&str, &str)],
    ) -> AuthResult<OAuthTokens> {
        let mut request = self
            .http
            .post(token_url)
            .header("Accept", "application/json")
            .form(params);
        if let Some(secret) = config.client_secret.as_deref().filter(|s| !s.is_empty()) {
            request = request.basic_auth(&config.client_id, Some(secret));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchange(format!("{status}: {text}")));
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::TokenExchange(format!("Invalid token response: {e}")))
    }

    async fn endpoints(&self, config: &OAuthConfig) -> AuthResult<AuthEndpoints> {
        if let Some(endpoints) = AuthEndpoints::from_config(config) {
            return Ok(endpoints);
        }
        let issuer = config.issuer.clone().unwrap_or_default();
        if let Some(cached) = self.discovered.read().await.get(&issuer) {
            return Ok(cached.clone());
        }
        let endpoints = discovery::discover(&self.http, config).await?;
        self.discovered
            .write()
            .await
            .insert(issuer, endpoints.clone());
        Ok(endpoints)
    }
}

impl std::fmt::Debug for OAuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthManager").finish_non_exhaustive()
    }
}

/// Build authorization URL.
pub fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
) -> String {
    let separator = if auth_endpoint.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method={}",
        auth_endpoint,
        separator,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
        pkce::CHALLENGE_METHOD,
    );

    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }

    url
}
