//! Connection layer for Model Context Protocol (MCP) servers.
//!
//! Keeps a set of MCP servers reachable for a host application: local
//! servers launched as child processes and spoken to over stdio, and remote
//! servers reached over streamable HTTP with a server-sent event stream.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌───────────────────┐     ┌──────────────────┐
//! │   host   │────▶│ ConnectionManager │────▶│ ProcessTransport │──▶ child process
//! │          │◀────│  state + logs     │     ├──────────────────┤
//! └──────────┘     │  + events         │────▶│   SseTransport   │──▶ HTTP server
//!                  └───────────────────┘     └──────────────────┘
//! ```
//!
//! Both transports share the same [`RequestCorrelator`], which pairs
//! responses with pending requests and enforces per-request timeouts.
//! Observers follow lifecycle changes through [`ConnectionManager::subscribe`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use conduit_auth::{FileCredentialStore, OAuthManager, SystemBrowser};
//! use conduit_mcp::{ConnectionManager, ManagerSettings, ServerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let oauth = OAuthManager::new(Arc::new(FileCredentialStore::new()?), Arc::new(SystemBrowser));
//! let manager = ConnectionManager::new(ManagerSettings::default(), Arc::new(oauth));
//!
//! let config = ServerConfig::stdio(
//!     "filesystem",
//!     "npx",
//!     ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
//! );
//! let outcome = manager.start_server(config).await;
//! if !outcome.success {
//!     eprintln!("failed: {}", outcome.error.unwrap_or_default());
//! }
//!
//! for tool in manager.list_tools("filesystem").await? {
//!     println!("{}", tool.name);
//! }
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
mod client;
mod correlator;
mod error;
mod events;
pub mod framer;
pub mod launcher;
mod logs;
mod manager;
pub mod protocol;
mod server;
pub mod sse;
mod state;
pub mod stdio;
mod transport;

pub use backoff::ReconnectPolicy;
pub use client::{initialize, McpClient};
pub use correlator::{Inbound, RequestCorrelator};
pub use error::{McpError, McpResult, METHOD_NOT_FOUND};
pub use events::{ConnectionEvent, EventHub};
pub use framer::{Frame, MessageFramer};
pub use logs::{LogEntry, LogKind, LogRecorder, DEFAULT_LOG_CAPACITY};
pub use manager::{ConnectionManager, ManagerSettings, StartOutcome};
pub use protocol::{
    GetPromptResult, JsonRpcMessage, McpPrompt, McpResource, McpTool, ReadResourceResult,
    ToolCallResult, ToolContent,
};
pub use server::{ServerConfig, TransportConfig};
pub use sse::{HttpConfig, SseTransport};
pub use state::{can_transition, ConnectionState, StateMachine};
pub use stdio::{ProcessExit, ProcessTransport, StdioConfig};
pub use transport::{EventSender, Transport, TransportEvent};
