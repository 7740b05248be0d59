//! MCP server configuration.

use conduit_auth::OAuthConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Configuration for an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Server id (unique). Filled from the map key when loaded from a file.
    #[serde(default)]
    pub id: String,

    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// How to reach the server.
    #[serde(flatten)]
    pub transport: TransportConfig,

    /// OAuth settings, for remote servers that need them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<OAuthConfig>,

    /// Whether the server is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Transport-specific settings, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Local server spoken to over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Remote server over streamable HTTP / SSE.
    #[serde(alias = "sse")]
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl ServerConfig {
    /// Create a stdio server configuration.
    pub fn stdio<I, S>(id: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            name: None,
            transport: TransportConfig::Stdio {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
                cwd: None,
            },
            auth: None,
            enabled: true,
        }
    }

    /// Create an HTTP server configuration.
    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            transport: TransportConfig::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
            auth: None,
            enabled: true,
        }
    }

    /// Add a header (HTTP servers only).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Http { headers, .. } = &mut self.transport {
            headers.insert(key.into(), value.into());
        }
        self
    }

    /// Add an environment override (stdio servers only).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_auth(mut self, auth: OAuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Disable the server.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn url(&self) -> Option<&str> {
        match &self.transport {
            TransportConfig::Http { url, .. } => Some(url),
            TransportConfig::Stdio { .. } => None,
        }
    }

    /// OAuth settings with the server URL as discovery fallback.
    pub fn oauth(&self) -> Option<OAuthConfig> {
        let auth = self.auth.clone()?;
        Some(match self.url() {
            Some(url) => auth.or_issuer(url),
            None => auth,
        })
    }
}
