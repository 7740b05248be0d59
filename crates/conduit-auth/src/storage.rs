//! Credential storage implementation.

use crate::error::{AuthError, AuthResult};
use crate::flow::OAuthFlowState;
use crate::tokens::TokenSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Persistence for issued tokens and in-flight flow records.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_tokens(&self, server_id: &str) -> AuthResult<Option<TokenSet>>;

    async fn save_tokens(&self, server_id: &str, tokens: TokenSet) -> AuthResult<()>;

    /// Returns `true` if tokens were removed.
    async fn remove_tokens(&self, server_id: &str) -> AuthResult<bool>;

    async fn save_flow(&self, flow: OAuthFlowState) -> AuthResult<()>;

    /// Remove and return the flow record for `state`. Records are single-use.
    async fn take_flow(&self, state: &str) -> AuthResult<Option<OAuthFlowState>>;

    /// Drop flow records created before `cutoff`. Returns how many were removed.
    async fn prune_flows(&self, cutoff: DateTime<Utc>) -> AuthResult<usize>;
}

/// On-disk layout of the credential file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    tokens: HashMap<String, TokenSet>,
    #[serde(default)]
    flows: HashMap<String, OAuthFlowState>,
}

impl CredentialFile {
    fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, flow| flow.created_at >= cutoff);
        before - self.flows.len()
    }
}

/// Modification time and size of the credential file when it was cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

struct Cached {
    data: CredentialFile,
    stamp: Option<FileStamp>,
}

/// Credential store backed by a JSON file.
///
/// The file is rewritten on every change with owner-only permissions on
/// Unix. A process-local cache avoids re-reading it for lookups; it is
/// dropped whenever another process has rewritten the file.
pub struct FileCredentialStore {
    /// Path to the credential file.
    path: PathBuf,
    /// In-memory copy of the file, loaded lazily.
    cache: Mutex<Option<Cached>>,
}

impl FileCredentialStore {
    /// Create a store at the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined.
    pub fn new() -> AuthResult<Self> {
        let path = conduit_util::paths::default_credentials_path().ok_or(AuthError::NoDataDir)?;
        Ok(Self::with_path(path))
    }

    /// Create a store with a custom path.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            cache: Mutex::new(None),
        }
    }

    /// Get the path to the credential file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// List servers with stored tokens.
    pub async fn list_servers(&self) -> AuthResult<Vec<String>> {
        let mut cache = self.cache.lock().await;
        let cached = self.loaded(&mut cache).await?;
        Ok(cached.data.tokens.keys().cloned().collect())
    }

    async fn stamp(&self) -> Option<FileStamp> {
        let metadata = tokio::fs::metadata(&self.path).await.ok()?;
        Some(FileStamp {
            modified: metadata.modified().ok()?,
            len: metadata.len(),
        })
    }

    /// The cached file contents, re-read if the file changed on disk.
    async fn loaded<'a>(&self, cache: &'a mut Option<Cached>) -> AuthResult<&'a mut Cached> {
        let stamp = self.stamp().await;
        let fresh = cache.as_ref().is_some_and(|cached| cached.stamp == stamp);
        if !fresh {
            if cache.is_some() {
                debug!(path = ?self.path, "Credential file changed on disk, reloading");
            }
            *cache = Some(Cached {
                data: self.read_all().await?,
                stamp,
            });
        }
        Ok(cache.get_or_insert_with(|| Cached {
            data: CredentialFile::default(),
            stamp: None,
        }))
    }

    /// Read all credential data from file.
    async fn read_all(&self) -> AuthResult<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;

        if content.trim().is_empty() {
            return Ok(CredentialFile::default());
        }

        // Parse as raw JSON first, then validate each entry
        let raw: HashMap<String, HashMap<String, serde_json::Value>> =
            serde_json::from_str(&content)?;
        let mut result = CredentialFile::default();

        for (key, value) in raw.get("tokens").cloned().unwrap_or_default() {
            match serde_json::from_value::<TokenSet>(value) {
                Ok(tokens) => {
                    result.tokens.insert(key, tokens);
                }
                Err(e) => {
                    warn!(server = %key, error = %e, "Skipping invalid token entry");
                }
            }
        }
        for (key, value) in raw.get("flows").cloned().unwrap_or_default() {
            match serde_json::from_value::<OAuthFlowState>(value) {
                Ok(flow) => {
                    result.flows.insert(key, flow);
                }
                Err(e) => {
                    warn!(error = %e, "Skipping invalid flow record");
                }
            }
        }

        Ok(result)
    }

    /// Write all credential data to file.
    async fn write_all(&self, cached: &mut Cached) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(&cached.data)?;
        tokio::fs::write(&self.path, &content).await?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms)
                .await
                .map_err(|e| {
                    AuthError::Permissions(format!(
                        "Failed to set permissions on {:?}: {}",
                        self.path, e
                    ))
                })?;
        }

        cached.stamp = self.stamp().await;
        debug!(path = ?self.path, "Wrote credential file");
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load_tokens(&self, server_id: &str) -> AuthResult<Option<TokenSet>> {
        let mut cache = self.cache.lock().await;
        let cached = self.loaded(&mut cache).await?;
        Ok(cached.data.tokens.get(server_id).cloned())
    }

    async fn save_tokens(&self, server_id: &str, tokens: TokenSet) -> AuthResult<()> {
        debug!(server = %server_id, "Saving tokens");
        let mut cache = self.cache.lock().await;
        let cached = self.loaded(&mut cache).await?;
        cached.data.tokens.insert(server_id.to_string(), tokens);
        self.write_all(cached).await
    }

    async fn remove_tokens(&self, server_id: &str) -> AuthResult<bool> {
        debug!(server = %server_id, "Removing tokens");
        let mut cache = self.cache.lock().await;
        let cached = self.loaded(&mut cache).await?;
        let existed = cached.data.tokens.remove(server_id).is_some();
        if existed {
            self.write_all(cached).await?;
        }
        Ok(existed)
    }

    async fn save_flow(&self, flow: OAuthFlowState) -> AuthResult<()> {
        let mut cache = self.cache.lock().await;
        let cached = self.loaded(&mut cache).await?;
        cached.data.flows.insert(flow.state.clone(), flow);
        self.write_all(cached).await
    }

    async fn take_flow(&self, state: &str) -> AuthResult<Option<OAuthFlowState>> {
        let mut cache = self.cache.lock().await;
        let cached = self.loaded(&mut cache).await?;
        let flow = cached.data.flows.remove(state);
        if flow.is_some() {
            self.write_all(cached).await?;
        }
        Ok(flow)
    }

    async fn prune_flows(&self, cutoff: DateTime<Utc>) -> AuthResult<usize> {
        let mut cache = self.cache.lock().await;
        let cached = self.loaded(&mut cache).await?;
        let removed = cached.data.prune(cutoff);
        if removed > 0 {
            self.write_all(cached).await?;
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for FileCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCredentialStore")
            .field("path", &self.path)
            .finish()
    }
}

/// Credential store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    data: Mutex<CredentialFile>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load_tokens(&self, server_id: &str) -> AuthResult<Option<TokenSet>> {
        Ok(self.data.lock().await.tokens.get(server_id).cloned())
    }

    async fn save_tokens(&self, server_id: &str, tokens: TokenSet) -> AuthResult<()> {
        self.data
            .lock()
            .await
            .tokens
            .insert(server_id.to_string(), tokens);
        Ok(())
    }

    async fn remove_tokens(&self, server_id: &str) -> AuthResult<bool> {
        Ok(self.data.lock().await.tokens.remove(server_id).is_some())
    }

    async fn save_flow(&self, flow: OAuthFlowState) -> AuthResult<()> {
        self.data
            .lock()
            .await
            .flows
            .insert(flow.state.clone(), flow);
        Ok(())
    }

    async fn take_flow(&self, state: &str) -> AuthResult<Option<OAuthFlowState>> {
        Ok(self.data.lock().await.flows.remove(state))
    }

    async fn prune_flows(&self, cutoff: DateTime<Utc>) -> AuthResult<usize> {
        Ok(self.data.lock().await.prune(cutoff))
    }
}
