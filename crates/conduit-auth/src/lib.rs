//! OAuth 2.1 authentication for remote capability servers.
//!
//! This crate implements the Authorization Code flow with PKCE for servers
//! that require a bearer token, plus persistence of issued tokens.
//!
//! The flow is split into two independent calls linked by a persisted,
//! expiring flow record:
//!
//! 1. [`OAuthManager::begin_flow`] generates the PKCE pair and a CSRF state
//!    value, stores the flow record and opens the system browser.
//! 2. [`OAuthManager::complete_flow`] is invoked later with the redirect URL
//!    (delivered by the host's custom URI scheme handler), consumes the flow
//!    record and exchanges the authorization code for tokens.
//!
//! Tokens are refreshed on demand by [`OAuthManager::ensure_valid`] once their
//! remaining lifetime drops below five minutes.
//!
//! # Storage Location
//!
//! [`FileCredentialStore`] keeps tokens and in-flight flow records in a
//! platform-specific data directory:
//! - Linux: `~/.local/share/conduit/credentials.json`
//! - macOS: `~/Library/Application Support/conduit/credentials.json`
//! - Windows: `%APPDATA%/conduit/credentials.json`
//!
//! The file is created with restrictive permissions (0600 on Unix).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use conduit_auth::{FileCredentialStore, OAuthConfig, OAuthManager, SystemBrowser};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(FileCredentialStore::new()?);
//! let oauth = OAuthManager::new(store, Arc::new(SystemBrowser));
//!
//! let config = OAuthConfig::new("my-client")
//!     .with_endpoints("https://auth.example.com/authorize", "https://auth.example.com/token");
//! let url = oauth.begin_flow("remote", &config).await?;
//! println!("Continue in the browser: {url}");
//!
//! // Later, from the protocol handler:
//! let completed = oauth
//!     .complete_flow("conduit://oauth/callback?code=abc&state=xyz")
//!     .await?;
//! println!("Authorized {}", completed.server_id);
//! # Ok(())
//! # }
//! ```

mod browser;
mod config;
mod discovery;
mod error;
mod flow;
mod oauth;
pub mod pkce;
mod storage;
mod tokens;

pub use browser::{BrowserOpener, SystemBrowser};
pub use config::{OAuthConfig, DEFAULT_REDIRECT_URI};
pub use discovery::AuthEndpoints;
pub use error::{AuthError, AuthResult};
pub use flow::{OAuthFlowState, FLOW_TTL_SECS};
pub use oauth::{build_auth_url, CompletedFlow, OAuthManager, ValidToken};
pub use storage::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use tokens::{OAuthTokens, TokenSet, REFRESH_MARGIN_SECS, REFRESH_TOKEN_STALE_DAYS};
