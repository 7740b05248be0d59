//! Connection manager: one owned registry of server connections.
//!
//! The manager owns, per server id, the config, the lifecycle state machine,
//! the initialized client and a generation number. Every started transport
//! gets a fresh generation and an event pump task; events carrying a
//! generation that is no longer current are dropped, so a torn-down
//! transport can never change the state of its successor.

use crate::backoff::ReconnectPolicy;
use crate::client::McpClient;
use crate::error::{McpError, McpResult};
use crate::events::{ConnectionEvent, EventHub};
use crate::logs::{LogEntry, LogKind, LogRecorder, DEFAULT_LOG_CAPACITY};
use crate::protocol::{
    GetPromptResult, McpPrompt, McpResource, McpTool, ReadResourceResult, ToolCallResult,
};
use crate::server::{ServerConfig, TransportConfig};
use crate::sse::{HttpConfig, SseTransport, DEFAULT_HTTP_TIMEOUT};
use crate::state::{ConnectionState, StateMachine};
use crate::stdio::{ProcessTransport, StdioConfig, DEFAULT_SPAWN_GRACE, DEFAULT_STDIO_TIMEOUT};
use crate::transport::{Transport, TransportEvent};
use chrono::{DateTime, Utc};
use conduit_auth::{AuthError, OAuthManager};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a failed start waits for its event pump to drain.
const PUMP_DRAIN: Duration = Duration::from_secs(2);

/// Tunables shared by every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerSettings {
    pub stdio_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub spawn_grace_ms: u64,
    pub reconnect: ReconnectPolicy,
    pub log_capacity: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            stdio_timeout_secs: DEFAULT_STDIO_TIMEOUT.as_secs(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT.as_secs(),
            spawn_grace_ms: DEFAULT_SPAWN_GRACE.as_millis() as u64,
            reconnect: ReconnectPolicy::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl ManagerSettings {
    pub fn stdio_timeout(&self) -> Duration {
        Duration::from_secs(self.stdio_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }
}

/// Result of starting or stopping a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StartOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

impl<T> From<McpResult<T>> for StartOutcome {
    fn from(result: McpResult<T>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

struct ServerSlot {
    config: ServerConfig,
    machine: StateMachine,
    generation: u64,
    client: Option<McpClient>,
    pump: Option<JoinHandle<()>>,
    token_expires_at: Option<DateTime<Utc>>,
    /// Cancels a start that is still connecting. Reachable without the
    /// lifecycle lock so a stop can interrupt reconnect backoff.
    connecting: Option<CancellationToken>,
}

impl ServerSlot {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            machine: StateMachine::new(),
            generation: 0,
            client: None,
            pump: None,
            token_expires_at: None,
            connecting: None,
        }
    }
}

/// State shared with event pump tasks.
struct Shared {
    slots: Mutex<HashMap<String, ServerSlot>>,
    hub: EventHub,
    logs: LogRecorder,
    next_generation: AtomicU64,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, ServerSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    fn is_current(&self, server_id: &str, generation: u64) -> bool {
        self.slots()
            .get(server_id)
            .is_some_and(|slot| slot.generation == generation)
    }

    /// Apply a transition and publish it.
    ///
    /// With `generation` set, the change only applies while that generation
    /// is current. Returns whether the state changed.
    fn transition(
        &self,
        server_id: &str,
        generation: Option<u64>,
        next: ConnectionState,
    ) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(server_id) else {
            return false;
        };
        if generation.is_some_and(|g| g != slot.generation) {
            return false;
        }
        match slot.machine.transition(next.clone()) {
            Ok(previous) => {
                debug!(
                    server = %server_id,
                    from = previous.name(),
                    to = next.name(),
                    "State changed"
                );
                // Published under the lock so observers see changes in order.
                self.hub.publish(ConnectionEvent::StateChanged {
                    server_id: server_id.to_string(),
                    previous,
                    state: next,
                });
                true
            }
            Err(e) => {
                debug!(server = %server_id, error = %e, "Ignoring state change");
                false
            }
        }
    }

    fn log(
        &self,
        server_id: &str,
        kind: LogKind,
        message: impl Into<String>,
        payload: Option<Value>,
    ) {
        let entry = self.logs.record(server_id, kind, message, payload);
        self.hub.publish(ConnectionEvent::Log { entry });
    }

    fn state(&self, server_id: &str) -> Option<ConnectionState> {
        self.slots()
            .get(server_id)
            .map(|slot| slot.machine.state().clone())
    }

    fn connected_state(&self, server_id: &str) -> ConnectionState {
        let token_expires_at = self
            .slots()
            .get(server_id)
            .and_then(|slot| slot.token_expires_at);
        ConnectionState::Connected { token_expires_at }
    }

    fn auth_required(&self, server_id: &str, generation: Option<u64>, message: impl Into<String>) {
        let message = message.into();
        self.log(server_id, LogKind::Error, message.clone(), None);
        self.transition(
            server_id,
            generation,
            ConnectionState::auth_required(Some(message)),
        );
    }
}

/// Forward one transport's events into state, logs and observers.
async fn pump_events(
    shared: Arc<Shared>,
    server_id: String,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        if !shared.is_current(&server_id, generation) {
            debug!(server = %server_id, generation, "Dropping events from stale transport");
            return;
        }
        let gen = Some(generation);
        match event {
            TransportEvent::Log {
                kind,
                message,
                payload,
            } => shared.log(&server_id, kind, message, payload),
            TransportEvent::Notification(message) => {
                let method = message.method().unwrap_or_default().to_string();
                shared.log(&server_id, LogKind::Protocol, method.clone(), message.params.clone());
                shared.hub.publish(ConnectionEvent::Notification {
                    server_id: server_id.clone(),
                    method,
                    params: message.params,
                });
            }
            TransportEvent::Reconnecting {
                attempt,
                max_attempts,
                delay,
            } => {
                shared.log(
                    &server_id,
                    LogKind::System,
                    format!("Reconnecting (attempt {attempt}/{max_attempts}) in {delay:?}"),
                    None,
                );
                shared.transition(
                    &server_id,
                    gen,
                    ConnectionState::Reconnecting {
                        attempt,
                        max_attempts,
                    },
                );
            }
            TransportEvent::Reconnected => {
                shared.log(&server_id, LogKind::System, "Reconnected", None);
                // A reconnect during the initial connect is finished by start_server.
                if matches!(
                    shared.state(&server_id),
                    Some(ConnectionState::Reconnecting { .. })
                ) && shared.slots().get(&server_id).is_some_and(|s| s.client.is_some())
                {
                    let state = shared.connected_state(&server_id);
                    shared.transition(&server_id, gen, state);
                }
            }
            TransportEvent::AuthRequired => {
                shared.auth_required(&server_id, gen, "Server rejected the access token");
            }
            TransportEvent::Closed { code, reason } => {
                warn!(
                    server = %server_id,
                    code = ?code,
                    reason = %reason,
                    "Server connection ended"
                );
                shared.log(&server_id, LogKind::Error, reason.clone(), None);
                if let Some(slot) = shared.slots().get_mut(&server_id) {
                    slot.client = None;
                }
                shared.transition(&server_id, gen, ConnectionState::error(reason.clone()));
                shared.hub.publish(ConnectionEvent::ServerExited {
                    server_id: server_id.clone(),
                    code,
                    reason,
                });
            }
        }
    }
}

/// Registry and lifecycle of all server connections.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    settings: ManagerSettings,
    oauth: Arc<OAuthManager>,
    /// Per-server locks serializing start and stop.
    lifecycle: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionManager {
    pub fn new(settings: ManagerSettings, oauth: Arc<OAuthManager>) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(HashMap::new()),
                hub: EventHub::default(),
                logs: LogRecorder::new(settings.log_capacity),
                next_generation: AtomicU64::new(1),
            }),
            settings,
            oauth,
            lifecycle: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn oauth(&self) -> &Arc<OAuthManager> {
        &self.oauth
    }

    fn lifecycle_lock(&self, server_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(server_id.to_string())
            .or_default()
            .clone()
    }

    /// Make a server known without starting it.
    pub fn register_server(&self, config: ServerConfig) {
        let mut slots = self.shared.slots();
        match slots.get_mut(&config.id) {
            Some(slot) => slot.config = config,
            None => {
                slots.insert(config.id.clone(), ServerSlot::new(config));
            }
        }
    }

    /// Configs of all known servers, sorted by id.
    pub fn servers(&self) -> Vec<ServerConfig> {
        let mut configs: Vec<_> = self
            .shared
            .slots()
            .values()
            .map(|slot| slot.config.clone())
            .collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    /// Start (or restart) a server.
    ///
    /// Starting a connected server with an unchanged config does nothing.
    pub async fn start_server(&self, config: ServerConfig) -> StartOutcome {
        let id = config.id.clone();
        let outcome = StartOutcome::from(self.start_inner(config).await);
        if let Some(error) = &outcome.error {
            warn!(server = %id, error = %error, "Failed to start MCP server");
        }
        outcome
    }

    async fn start_inner(&self, config: ServerConfig) -> McpResult<()> {
        let id = config.id.clone();
        if id.is_empty() {
            return Err(McpError::StartFailed("Server id is empty".to_string()));
        }
        if !config.enabled {
            self.register_server(config);
            return Err(McpError::StartFailed(format!("Server '{id}' is disabled")));
        }

        let lock = self.lifecycle_lock(&id);
        let _guard = lock.lock().await;

        let unchanged = self.shared.slots().get(&id).is_some_and(|slot| {
            slot.config == config && slot.client.is_some() && slot.machine.state().is_usable()
        });
        if unchanged {
            debug!(server = %id, "Server already connected");
            return Ok(());
        }

        self.teardown(&id).await;

        let generation = self.shared.next_generation();
        let cancel = CancellationToken::new();
        {
            let mut slots = self.shared.slots();
            let slot = slots
                .entry(id.clone())
                .or_insert_with(|| ServerSlot::new(config.clone()));
            slot.config = config.clone();
            slot.generation = generation;
            slot.client = None;
            slot.token_expires_at = None;
            slot.connecting = Some(cancel.clone());
        }

        info!(server = %id, "Starting MCP server");
        self.shared
            .transition(&id, Some(generation), ConnectionState::Connecting);
        self.shared
            .log(&id, LogKind::System, format!("Starting {}", config.display_name()), None);

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_events(self.shared.clone(), id.clone(), generation, rx));

        let connected = self.connect(&config, generation, tx, &cancel).await;
        if let Some(slot) = self.shared.slots().get_mut(&id) {
            if slot.generation == generation {
                slot.connecting = None;
            }
        }

        match connected {
            Ok((client, token_expires_at)) => {
                let installed = {
                    let mut slots = self.shared.slots();
                    match slots.get_mut(&id) {
                        Some(slot) if slot.generation == generation => {
                            slot.client = Some(client.clone());
                            slot.pump = Some(pump);
                            slot.token_expires_at = token_expires_at;
                            true
                        }
                        _ => false,
                    }
                };
                if !installed {
                    let _ = client.close().await;
                    return Err(McpError::ConnectionClosed);
                }

                let server_name = client.info().server_info.name.clone();
                self.shared.transition(
                    &id,
                    Some(generation),
                    ConnectionState::Connected { token_expires_at },
                );
                self.shared.log(
                    &id,
                    LogKind::System,
                    format!("Connected to {server_name}"),
                    None,
                );
                info!(server = %id, server_name = %server_name, "MCP server connected");
                Ok(())
            }
            Err(_) if cancel.is_cancelled() => {
                // The stop waiting on the lifecycle lock owns the state from here.
                pump.abort();
                info!(server = %id, "Start cancelled by stop");
                Err(McpError::StartFailed(format!(
                    "Server '{id}' was stopped while connecting"
                )))
            }
            Err(e) => {
                // Let the pump apply what the transport reported before failing.
                let _ = tokio::time::timeout(PUMP_DRAIN, pump).await;

                if e.is_auth_required() {
                    self.shared.auth_required(&id, Some(generation), e.to_string());
                } else {
                    self.shared.log(&id, LogKind::Error, e.to_string(), None);
                    if !matches!(self.shared.state(&id), Some(ConnectionState::Error { .. })) {
                        self.shared.transition(
                            &id,
                            Some(generation),
                            ConnectionState::error(e.to_string()),
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Create the transport and complete the handshake.
    async fn connect(
        &self,
        config: &ServerConfig,
        generation: u64,
        events: mpsc::UnboundedSender<TransportEvent>,
        cancel: &CancellationToken,
    ) -> McpResult<(McpClient, Option<DateTime<Utc>>)> {
        let id = &config.id;
        match &config.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let stdio = StdioConfig {
                    command: command.clone(),
                    args: args.clone(),
                    env: env.clone(),
                    cwd: cwd.clone(),
                    request_timeout: self.settings.stdio_timeout(),
                    grace: self.settings.spawn_grace(),
                };
                let transport = Arc::new(ProcessTransport::start(stdio, events).await?);
                let handshake = tokio::select! {
                    _ = cancel.cancelled() => Err(McpError::ConnectionClosed),
                    result = McpClient::connect(transport.clone()) => result,
                };
                match handshake {
                    Ok(client) => Ok((client, None)),
                    Err(e) => {
                        let _ = transport.stop().await;
                        Err(e)
                    }
                }
            }
            TransportConfig::Http { url, headers } => {
                let mut http = HttpConfig::new(url.clone());
                http.headers = headers.clone();
                http.request_timeout = self.settings.http_timeout();
                http.reconnect = self.settings.reconnect.clone();

                let mut token_expires_at = None;
                if let Some(auth) = config.oauth() {
                    self.shared
                        .transition(id, Some(generation), ConnectionState::Authenticating);
                    let Some(token) = self.oauth.ensure_valid(id, &auth).await? else {
                        return Err(McpError::AuthRequired);
                    };
                    if let Some(warning) = token.warning {
                        self.shared.log(id, LogKind::System, warning, None);
                    }
                    http.auth_token = Some(token.access_token);
                    token_expires_at = token.expires_at;
                }

                let transport = Arc::new(SseTransport::new(http, events)?);
                let handshake = tokio::select! {
                    _ = cancel.cancelled() => Err(McpError::ConnectionClosed),
                    result = transport.connect() => result,
                };
                match handshake {
                    Ok(info) => Ok((McpClient::new(transport, info), token_expires_at)),
                    Err(e) => {
                        let _ = transport.close().await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Close the current transport, if any, and return to idle.
    async fn teardown(&self, server_id: &str) -> Option<McpResult<()>> {
        let (client, pump, was_active) = {
            let mut slots = self.shared.slots();
            let slot = slots.get_mut(server_id)?;
            // Invalidate the old generation first so its events are dropped.
            slot.generation = self.shared.next_generation();
            (
                slot.client.take(),
                slot.pump.take(),
                slot.machine.state().is_active(),
            )
        };

        let result = match &client {
            Some(client) => Some(client.close().await),
            None => None,
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if client.is_some() || was_active {
            self.shared.transition(server_id, None, ConnectionState::Idle);
        }
        result
    }

    /// Stop a server and return it to idle.
    pub async fn stop_server(&self, server_id: &str) -> StartOutcome {
        // A start in progress holds the lifecycle lock until it gives up.
        let connecting = self
            .shared
            .slots()
            .get(server_id)
            .and_then(|slot| slot.connecting.clone());
        if let Some(cancel) = connecting {
            debug!(server = %server_id, "Cancelling start in progress");
            cancel.cancel();
        }

        let lock = self.lifecycle_lock(server_id);
        let _guard = lock.lock().await;

        if self.shared.state(server_id).is_none() {
            return StartOutcome::failed(
                McpError::ServerNotFound(server_id.to_string()).to_string(),
            );
        }

        let result = self.teardown(server_id).await.unwrap_or(Ok(()));
        // Stopping from error or auth_required also ends up idle.
        if self.shared.state(server_id) != Some(ConnectionState::Idle) {
            self.shared.transition(server_id, None, ConnectionState::Idle);
        }
        self.shared.log(server_id, LogKind::System, "Stopped", None);
        info!(server = %server_id, "MCP server stopped");
        StartOutcome::from(result)
    }

    /// Start a known server again with its last config.
    pub async fn retry_server(&self, server_id: &str) -> StartOutcome {
        let config = self
            .shared
            .slots()
            .get(server_id)
            .map(|slot| slot.config.clone());
        match config {
            Some(config) => self.start_server(config).await,
            None => {
                StartOutcome::failed(McpError::ServerNotFound(server_id.to_string()).to_string())
            }
        }
    }

    /// The client for a connected server, with a fresh access token.
    async fn client_for(&self, server_id: &str) -> McpResult<(McpClient, u64)> {
        let (client, config, generation) = {
            let slots = self.shared.slots();
            let slot = slots
                .get(server_id)
                .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
            let client = match (&slot.client, slot.machine.state().is_usable()) {
                (Some(client), true) => client.clone(),
                _ => return Err(McpError::NotConnected(server_id.to_string())),
            };
            (client, slot.config.clone(), slot.generation)
        };

        let Some(auth) = config.oauth() else {
            return Ok((client, generation));
        };

        match self.oauth.ensure_valid(server_id, &auth).await {
            Ok(Some(token)) => {
                if let Some(warning) = token.warning {
                    self.shared.log(server_id, LogKind::System, warning, None);
                }
                client
                    .transport()
                    .update_auth_token(token.access_token)
                    .await;
                if token.refreshed {
                    self.shared
                        .log(server_id, LogKind::System, "Access token refreshed", None);
                    if let Some(slot) = self.shared.slots().get_mut(server_id) {
                        slot.token_expires_at = token.expires_at;
                    }
                    self.shared.transition(
                        server_id,
                        Some(generation),
                        ConnectionState::Connected {
                            token_expires_at: token.expires_at,
                        },
                    );
                }
                Ok((client, generation))
            }
            Ok(None) => {
                self.shared
                    .auth_required(server_id, Some(generation), "No stored credentials");
                Err(McpError::AuthRequired)
            }
            Err(e) => {
                let e = McpError::from(e);
                if e.is_auth_required() {
                    self.shared
                        .auth_required(server_id, Some(generation), e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn with_client<T, F, Fut>(&self, server_id: &str, op: F) -> McpResult<T>
    where
        F: FnOnce(McpClient) -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        let (client, generation) = self.client_for(server_id).await?;
        let result = op(client).await;
        if let Err(e) = &result {
            if e.is_auth_required() {
                self.shared
                    .auth_required(server_id, Some(generation), e.to_string());
            } else {
                self.shared
                    .log(server_id, LogKind::Error, e.to_string(), None);
            }
        }
        result
    }

    pub async fn list_tools(&self, server_id: &str) -> McpResult<Vec<McpTool>> {
        self.with_client(server_id, |client| async move { client.list_tools().await })
            .await
    }

    pub async fn list_resources(&self, server_id: &str) -> McpResult<Vec<McpResource>> {
        self.with_client(server_id, |client| async move { client.list_resources().await })
            .await
    }

    pub async fn list_prompts(&self, server_id: &str) -> McpResult<Vec<McpPrompt>> {
        self.with_client(server_id, |client| async move { client.list_prompts().await })
            .await
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> McpResult<ToolCallResult> {
        self.with_client(server_id, |client| async move {
            client.call_tool(name, arguments).await
        })
        .await
    }

    pub async fn get_prompt(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> McpResult<GetPromptResult> {
        self.with_client(server_id, |client| async move {
            client.get_prompt(name, arguments).await
        })
        .await
    }

    pub async fn read_resource(&self, server_id: &str, uri: &str) -> McpResult<ReadResourceResult> {
        self.with_client(server_id, |client| async move { client.read_resource(uri).await })
            .await
    }

    /// Begin the OAuth flow for a server. Returns the authorization URL.
    pub async fn authenticate(&self, server_id: &str) -> McpResult<String> {
        let config = self
            .shared
            .slots()
            .get(server_id)
            .map(|slot| slot.config.clone())
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
        let auth = config.oauth().ok_or_else(|| {
            AuthError::Config(format!("Server '{server_id}' has no auth configuration"))
        })?;

        let url = self.oauth.begin_flow(server_id, &auth).await?;
        self.shared
            .log(server_id, LogKind::System, "Waiting for authorization", None);
        self.shared.transition(
            server_id,
            None,
            ConnectionState::AuthRequired {
                auth_url: Some(url.clone()),
                message: Some("Waiting for authorization".to_string()),
            },
        );
        Ok(url)
    }

    /// Finish an OAuth flow from its redirect URL and start the server.
    pub async fn complete_auth(&self, callback_url: &str) -> StartOutcome {
        let completed = match self.oauth.complete_flow(callback_url).await {
            Ok(completed) => completed,
            Err(e) => return StartOutcome::failed(e.to_string()),
        };
        let server_id = completed.server_id;
        info!(server = %server_id, "Authorization completed");
        self.shared
            .log(&server_id, LogKind::System, "Authorization completed", None);

        let config = self
            .shared
            .slots()
            .get(&server_id)
            .map(|slot| slot.config.clone());
        match config {
            Some(config) => self.start_server(config).await,
            None => StartOutcome::failed(McpError::ServerNotFound(server_id).to_string()),
        }
    }

    pub fn state(&self, server_id: &str) -> Option<ConnectionState> {
        self.shared.state(server_id)
    }

    /// Current state of every known server.
    pub fn states(&self) -> HashMap<String, ConnectionState> {
        self.shared
            .slots()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.machine.state().clone()))
            .collect()
    }

    /// Receive connection events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.hub.subscribe()
    }

    /// Receive only state changes and exits, unaffected by log volume.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.hub.subscribe_lifecycle()
    }

    pub fn get_logs(&self, server_id: &str) -> Vec<LogEntry> {
        self.shared.logs.entries(server_id)
    }

    pub fn clear_logs(&self, server_id: &str) -> usize {
        self.shared.logs.clear(server_id)
    }

    /// Stop every server.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.shared.slots().keys().cloned().collect();
        let stops = ids.iter().map(|id| async move {
            let lock = self.lifecycle_lock(id);
            let _guard = lock.lock().await;
            if let Some(Err(e)) = self.teardown(id).await {
                warn!(server = %id, error = %e, "Error closing server during shutdown");
            }
        });
        futures::future::join_all(stops).await;
        info!(count = ids.len(), "Connection manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_auth::{BrowserOpener, MemoryCredentialStore};

    struct NoBrowser;

    impl BrowserOpener for NoBrowser {
        fn open(&self, _url: &str) -> conduit_auth::AuthResult<()> {
            Ok(())
        }
    }

    fn manager() -> ConnectionManager {
        let oauth = OAuthManager::new(Arc::new(MemoryCredentialStore::new()), Arc::new(NoBrowser));
        ConnectionManager::new(ManagerSettings::default(), Arc::new(oauth))
    }

    #[test]
    fn test_settings_defaults() {
        let settings: ManagerSettings = serde_json::from_str(r#"{"spawnGraceMs": 250}"#).unwrap();
        assert_eq!(settings.spawn_grace(), Duration::from_millis(250));
        assert_eq!(settings.stdio_timeout(), Duration::from_secs(30));
        assert_eq!(settings.http_timeout(), Duration::from_secs(60));
        assert_eq!(settings.log_capacity, 1000);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(StartOutcome::failed("missing dependency")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"success": false, "error": "missing dependency"})
        );
        let json = serde_json::to_value(StartOutcome::ok()).unwrap();
        assert_eq!(json, serde_json::json!({"success": true}));
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let manager = manager();
        assert!(matches!(
            manager.list_tools("nope").await,
            Err(McpError::ServerNotFound(_))
        ));
        assert!(!manager.stop_server("nope").await.success);
        assert!(!manager.retry_server("nope").await.success);
        assert!(manager.state("nope").is_none());
        assert!(matches!(
            manager.authenticate("nope").await,
            Err(McpError::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_server_is_registered_not_started() {
        let manager = manager();
        let outcome = manager
            .start_server(ServerConfig::stdio("fs", "true", Vec::<String>::new()).disabled())
            .await;
        assert!(!outcome.success);
        assert_eq!(manager.state("fs"), Some(ConnectionState::Idle));
        assert!(matches!(
            manager.call_tool("fs", "x", None).await,
            Err(McpError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_requires_auth_config() {
        let manager = manager();
        manager.register_server(ServerConfig::http("remote", "https://example.com/mcp"));
        let err = manager.authenticate("remote").await.unwrap_err();
        assert!(matches!(err, McpError::Auth(AuthError::Config(_))));
    }

    #[tokio::test]
    async fn test_http_without_tokens_requires_auth() {
        let manager = manager();
        let mut events = manager.subscribe();
        let config = ServerConfig::http("remote", "http://127.0.0.1:1/mcp")
            .with_auth(conduit_auth::OAuthConfig::new("client"));

        let outcome = manager.start_server(config).await;
        assert!(!outcome.success);
        assert!(matches!(
            manager.state("remote"),
            Some(ConnectionState::AuthRequired { .. })
        ));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::StateChanged { state, .. } = event {
                seen.push(state.name());
            }
        }
        assert_eq!(seen, vec!["connecting", "authenticating", "auth_required"]);
    }

    #[tokio::test]
    async fn test_authenticate_publishes_auth_url() {
        let manager = manager();
        let auth = conduit_auth::OAuthConfig::new("client")
            .with_endpoints(
                "https://auth.example.com/authorize",
                "https://auth.example.com/token",
            );
        manager.register_server(
            ServerConfig::http("remote", "https://example.com/mcp").with_auth(auth),
        );

        let url = manager.authenticate("remote").await.unwrap();
        assert!(url.starts_with("https://auth.example.com/authorize?"));
        match manager.state("remote") {
            Some(ConnectionState::AuthRequired { auth_url, .. }) => {
                assert_eq!(auth_url.as_deref(), Some(url.as_str()))
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_auth_with_unknown_state() {
        let manager = manager();
        let outcome = manager
            .complete_auth("conduit://oauth/callback?code=abc&state=unknown")
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("invalid or expired state"));
    }

    #[tokio::test]
    async fn test_logs_are_recorded_and_cleared() {
        let manager = manager();
        manager
            .start_server(ServerConfig::stdio("fs", "true", Vec::<String>::new()).disabled())
            .await;
        manager.shared.log("fs", LogKind::System, "hello", None);
        assert_eq!(manager.get_logs("fs").len(), 1);
        assert_eq!(manager.clear_logs("fs"), 1);
        assert!(manager.get_logs("fs").is_empty());
    }
}
