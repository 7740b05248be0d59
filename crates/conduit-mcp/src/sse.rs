//! HTTP/SSE transport for remote MCP servers.
//!
//! This implements the streamable HTTP transport for MCP, which uses:
//! - HTTP POST for sending requests (answered inline as JSON or SSE)
//! - a long-lived GET event stream for server-initiated messages
//!
//! Both paths resolve the same pending-request table. When the event stream
//! drops it is re-opened with exponential backoff.

use crate::backoff::ReconnectPolicy;
use crate::client;
use crate::correlator::{Inbound, RequestCorrelator};
use crate::error::{McpError, McpResult};
use crate::logs::LogKind;
use crate::protocol::{InitializeResult, JsonRpcMessage};
use crate::transport::{EventSender, Transport, TransportEvent};
use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Default per-request timeout for HTTP servers.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Session header defined by the streamable HTTP transport.
const SESSION_HEADER: &str = "mcp-session-id";

/// Session header used by older servers.
const LEGACY_SESSION_HEADER: &str = "x-session-id";

/// Time allowed for the session DELETE on close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// The server URL (e.g., `https://mcp.example.com/mcp`)
    pub url: String,
    /// Extra headers sent with every request.
    pub headers: HashMap<String, String>,
    /// Optional bearer token
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl HttpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            auth_token: None,
            request_timeout: DEFAULT_HTTP_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// State of the link to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Error = 4,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::Error,
            _ => Self::Disconnected,
        }
    }
}

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk and return every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event,
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.last_id.clone(),
        })
    }
}

/// Decode a response body into events.
fn sse_events<S>(bytes: S) -> impl Stream<Item = McpResult<SseEvent>>
where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    try_stream! {
        let mut decoder = SseDecoder::new();
        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for event in decoder.feed(&chunk) {
                yield event;
            }
        }
    }
}

struct Inner {
    config: HttpConfig,
    client: Client,
    base_url: Url,
    /// POST target; legacy servers move it with an `endpoint` event.
    endpoint: RwLock<Url>,
    session_id: RwLock<Option<String>>,
    auth_token: RwLock<Option<String>>,
    last_event_id: RwLock<Option<String>>,
    link: AtomicU8,
    correlator: RequestCorrelator,
    cancel: CancellationToken,
    events: EventSender,
}

/// SSE transport for remote MCP servers.
pub struct SseTransport {
    inner: Arc<Inner>,
}

impl SseTransport {
    /// Create a new transport. Nothing is sent until [`SseTransport::connect`].
    pub fn new(config: HttpConfig, events: EventSender) -> McpResult<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| McpError::connection_failed(format!("Invalid server URL: {e}")))?;

        // No client-wide timeout: the event stream is long-lived.
        let client = Client::builder().build().map_err(|e| {
            McpError::connection_failed(format!("Failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            inner: Arc::new(Inner {
                auth_token: RwLock::new(config.auth_token.clone()),
                correlator: RequestCorrelator::new(config.request_timeout),
                endpoint: RwLock::new(base_url.clone()),
                base_url,
                config,
                client,
                session_id: RwLock::new(None),
                last_event_id: RwLock::new(None),
                link: AtomicU8::new(LinkState::Disconnected as u8),
                cancel: CancellationToken::new(),
                events,
            }),
        })
    }

    /// Perform the handshake and open the event stream.
    ///
    /// If the stream cannot be opened, the reconnect loop runs inline and
    /// its outcome is returned.
    pub async fn connect(&self) -> McpResult<InitializeResult> {
        let inner = &self.inner;
        inner.set_link(LinkState::Connecting);

        let init = match client::initialize(self).await {
            Ok(init) => init,
            Err(e) => {
                inner.set_link(LinkState::Error);
                return Err(e);
            }
        };

        let stream = match inner.open_stream().await {
            Ok(stream) => stream,
            Err(e) if e.is_auth_required() => {
                inner.set_link(LinkState::Error);
                return Err(e);
            }
            Err(e) => {
                warn!(url = %inner.base_url, error = %e, "Failed to open event stream");
                inner.emit(TransportEvent::log(
                    LogKind::Error,
                    format!("Failed to open event stream: {e}"),
                ));
                inner.reconnect().await?
            }
        };

        inner.set_link(LinkState::Connected);
        match stream {
            Some(response) => {
                tokio::spawn(inner.clone().run_stream(response));
            }
            None => {
                info!(
                    url = %inner.base_url,
                    "Server offers no event stream, using inline responses"
                );
            }
        }
        Ok(init)
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.link()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().await.clone()
    }

    /// Where requests are currently POSTed.
    pub async fn endpoint(&self) -> Url {
        self.inner.endpoint.read().await.clone()
    }
}

impl Inner {
    fn link(&self) -> LinkState {
        LinkState::from_u8(self.link.load(Ordering::SeqCst))
    }

    fn set_link(&self, state: LinkState) {
        self.link.store(state as u8, Ordering::SeqCst);
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Attach configured headers, the session id and the bearer token.
    async fn decorate(&self, mut req: RequestBuilder) -> RequestBuilder {
        for (name, value) in &self.config.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(session) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, session);
        }
        if let Some(token) = self.auth_token.read().await.as_deref() {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn capture_session(&self, headers: &HeaderMap) {
        let session = headers
            .get(SESSION_HEADER)
            .or_else(|| headers.get(LEGACY_SESSION_HEADER))
            .and_then(|v| v.to_str().ok());
        if let Some(session) = session {
            let mut current = self.session_id.write().await;
            if current.as_deref() != Some(session) {
                debug!(session = %session, "Server assigned session");
                *current = Some(session.to_string());
            }
        }
    }

    /// POST a message and check the status.
    async fn post(&self, message: &JsonRpcMessage) -> McpResult<Response> {
        let endpoint = self.endpoint.read().await.clone();
        let req = self
            .client
            .post(endpoint)
            .timeout(self.config.request_timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        let response = self.decorate(req).await.send().await.map_err(|e| {
            if e.is_connect() {
                McpError::connection_failed(format!("Connection failed: {e}"))
            } else {
                McpError::Http(e)
            }
        })?;

        self.capture_session(response.headers()).await;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::connection_failed(format!(
                "Server returned {status}: {text}"
            )));
        }
        Ok(response)
    }

    /// Send a request or notification and route whatever comes back inline.
    async fn send(self: &Arc<Self>, message: JsonRpcMessage) -> McpResult<()> {
        trace!(method = ?message.method(), "Sending HTTP message");
        let response = self.post(&message).await?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(());
        }

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));
        if is_sse {
            // The response arrives on this body; the caller waits on the correlator.
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.consume(response).await {
                    debug!(error = %e, "Inline event stream failed");
                }
            });
            return Ok(());
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(());
        }
        self.handle_payload(&body).await
    }

    /// Open the GET event stream. `None` means the server has none (405).
    async fn open_stream(&self) -> McpResult<Option<Response>> {
        let mut req = self
            .client
            .get(self.base_url.clone())
            .header(ACCEPT, "text/event-stream");
        req = self.decorate(req).await;
        if let Some(id) = self.last_event_id.read().await.as_deref() {
            req = req.header("Last-Event-ID", id);
        }

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(McpError::ConnectionClosed),
            sent = tokio::time::timeout(self.config.request_timeout, req.send()) => match sent {
                Ok(response) => response?,
                Err(_) => return Err(McpError::Timeout("event stream".to_string())),
            },
        };

        self.capture_session(response.headers()).await;
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(McpError::AuthRequired),
            StatusCode::METHOD_NOT_ALLOWED => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(McpError::connection_failed(format!(
                "Event stream returned {status}"
            ))),
        }
    }

    /// Retry opening the stream with backoff until it works or attempts run out.
    async fn reconnect(&self) -> McpResult<Option<Response>> {
        let policy = &self.config.reconnect;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if !policy.allows(attempt) {
                return Err(self.give_up(attempt - 1));
            }

            let delay = policy.delay_for(attempt);
            self.set_link(LinkState::Reconnecting);
            info!(url = %self.base_url, attempt, delay = ?delay, "Reconnecting event stream");
            self.emit(TransportEvent::Reconnecting {
                attempt,
                max_attempts: policy.max_attempts,
                delay,
            });

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(McpError::ConnectionClosed),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.open_stream().await {
                Ok(stream) => {
                    self.set_link(LinkState::Connected);
                    self.emit(TransportEvent::Reconnected);
                    return Ok(stream);
                }
                Err(McpError::ConnectionClosed) => return Err(McpError::ConnectionClosed),
                Err(e) if e.is_auth_required() => {
                    self.set_link(LinkState::Error);
                    self.correlator.close();
                    self.emit(TransportEvent::AuthRequired);
                    return Err(e);
                }
                Err(e) => {
                    warn!(url = %self.base_url, attempt, error = %e, "Reconnect attempt failed");
                    self.emit(TransportEvent::log(
                        LogKind::Error,
                        format!("Reconnect attempt {attempt} failed: {e}"),
                    ));
                }
            }
        }
    }

    fn give_up(&self, attempts: u32) -> McpError {
        self.set_link(LinkState::Error);
        self.correlator.close();
        let reason = format!("Event stream lost after {attempts} reconnect attempts");
        warn!(url = %self.base_url, attempts, "Giving up on event stream");
        self.emit(TransportEvent::Closed {
            code: Some(1),
            reason,
        });
        McpError::ReconnectExhausted(attempts)
    }

    /// Pump the event stream, reconnecting whenever it ends.
    async fn run_stream(self: Arc<Self>, response: Response) {
        let mut response = response;
        loop {
            let outcome = self.consume(response).await;
            if self.cancel.is_cancelled() {
                return;
            }
            let message = match outcome {
                Ok(()) => "Event stream ended".to_string(),
                Err(e) => format!("Event stream failed: {e}"),
            };
            debug!(url = %self.base_url, "{message}");
            self.emit(TransportEvent::log(LogKind::System, message));

            match self.reconnect().await {
                Ok(Some(next)) => response = next,
                Ok(None) | Err(_) => return,
            }
        }
    }

    /// Read events from one response body until it ends or we are cancelled.
    async fn consume(&self, response: Response) -> McpResult<()> {
        let events = sse_events(response.bytes_stream());
        futures::pin_mut!(events);
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => self.handle_event(event).await,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }

    async fn handle_event(&self, event: SseEvent) {
        if let Some(id) = &event.id {
            *self.last_event_id.write().await = Some(id.clone());
        }

        match event.event.as_deref() {
            Some("session") => {
                let session = serde_json::from_str::<Value>(&event.data)
                    .ok()
                    .and_then(|v| {
                        v.get("sessionId")
                            .or_else(|| v.get("session_id"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| event.data.trim().to_string());
                if !session.is_empty() {
                    debug!(session = %session, "Session updated by event");
                    *self.session_id.write().await = Some(session);
                }
            }
            Some("endpoint") => match self.base_url.join(event.data.trim()) {
                Ok(endpoint) => {
                    debug!(endpoint = %endpoint, "Server moved message endpoint");
                    *self.endpoint.write().await = endpoint;
                }
                Err(e) => warn!(data = %event.data, error = %e, "Invalid endpoint event"),
            },
            _ => {
                if let Err(e) = self.handle_payload(&event.data).await {
                    self.emit(TransportEvent::log(LogKind::Error, e.to_string()));
                }
            }
        }
    }

    /// Route a JSON body holding one message or a batch.
    async fn handle_payload(&self, data: &str) -> McpResult<()> {
        let value: Value = serde_json::from_str(data)
            .map_err(|e| McpError::protocol_error(format!("Invalid message payload: {e}")))?;
        let messages = match value {
            Value::Array(items) => items,
            single => vec![single],
        };
        for message in messages {
            match serde_json::from_value::<JsonRpcMessage>(message) {
                Ok(message) => self.handle_inbound(message).await,
                Err(e) => {
                    return Err(McpError::protocol_error(format!(
                        "Invalid JSON-RPC message: {e}"
                    )))
                }
            }
        }
        Ok(())
    }

    async fn handle_inbound(&self, message: JsonRpcMessage) {
        match self.correlator.dispatch(message) {
            Inbound::Resolved(id) => trace!(id, "Resolved request"),
            Inbound::Notification(message) => self.emit(TransportEvent::Notification(message)),
            Inbound::Request(message) => {
                let method = message.method().unwrap_or_default().to_string();
                self.emit(TransportEvent::Log {
                    kind: LogKind::Protocol,
                    message: format!("server request: {method}"),
                    payload: message.params.clone(),
                });
                if let Some(reply) = message.reply_to_server_request() {
                    if let Err(e) = self.post(&reply).await {
                        warn!(method = %method, error = %e, "Failed to answer server request");
                    }
                }
            }
            Inbound::Orphan(message) => {
                debug!(id = ?message.id, "Dropping response with no pending request");
            }
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let inner = &self.inner;
        inner
            .correlator
            .send_request(method, params, |message| inner.send(message))
            .await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if self.inner.correlator.is_closed() {
            return Err(McpError::ConnectionClosed);
        }
        self.inner
            .send(JsonRpcMessage::notification(method, params))
            .await
    }

    async fn close(&self) -> McpResult<()> {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.correlator.close();
        inner.set_link(LinkState::Disconnected);

        let session = inner.session_id.write().await.take();
        if let Some(session) = session {
            // Best effort: tell the server the session is over.
            let req = inner
                .client
                .delete(inner.base_url.clone())
                .timeout(CLOSE_TIMEOUT)
                .header(SESSION_HEADER, session.as_str());
            let req = inner.decorate(req).await;
            if let Err(e) = req.send().await {
                debug!(error = %e, "Session delete failed");
            }
        }

        debug!(url = %inner.base_url, "Closed SSE transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.link() == LinkState::Connected
    }

    async fn update_auth_token(&self, token: String) {
        *self.inner.auth_token.write().await = Some(token);
    }
}
