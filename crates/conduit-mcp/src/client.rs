//! MCP client implementation.
//!
//! Typed operations on top of a connected [`Transport`].

use crate::error::{McpError, McpResult};
use crate::protocol::{
    CallToolParams, GetPromptParams, GetPromptResult, InitializeParams, InitializeResult,
    ListPromptsResult, ListResourcesResult, ListToolsResult, McpPrompt, McpResource, McpTool,
    PaginatedParams, ReadResourceParams, ReadResourceResult, ServerCapabilities, ToolCallResult,
};
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Upper bound on pages fetched for one `*/list` call.
const MAX_PAGES: usize = 100;

/// Perform the initialize handshake.
///
/// Sends `initialize`, then the `notifications/initialized` notification.
pub async fn initialize(transport: &dyn Transport) -> McpResult<InitializeResult> {
    let params = serde_json::to_value(InitializeParams::default())?;
    let result = transport
        .request("initialize", Some(params))
        .await
        .map_err(|e| match e {
            McpError::Rpc { message, .. } => McpError::InitializationFailed(message),
            other => other,
        })?;

    let init: InitializeResult = serde_json::from_value(result)
        .map_err(|e| McpError::InitializationFailed(format!("Invalid initialize result: {e}")))?;

    debug!(
        protocol_version = %init.protocol_version,
        server_name = %init.server_info.name,
        "MCP server initialized"
    );

    transport.notify("notifications/initialized", None).await?;
    Ok(init)
}

/// A `*/list` result page.
trait Page: DeserializeOwned {
    type Item;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl Page for ListToolsResult {
    type Item = McpTool;
    fn into_parts(self) -> (Vec<McpTool>, Option<String>) {
        (self.tools, self.next_cursor)
    }
}

impl Page for ListResourcesResult {
    type Item = McpResource;
    fn into_parts(self) -> (Vec<McpResource>, Option<String>) {
        (self.resources, self.next_cursor)
    }
}

impl Page for ListPromptsResult {
    type Item = McpPrompt;
    fn into_parts(self) -> (Vec<McpPrompt>, Option<String>) {
        (self.prompts, self.next_cursor)
    }
}

/// An initialized connection to one server.
#[derive(Clone)]
pub struct McpClient {
    transport: Arc<dyn Transport>,
    info: InitializeResult,
}

impl McpClient {
    /// Wrap a transport that has already completed the handshake.
    pub fn new(transport: Arc<dyn Transport>, info: InitializeResult) -> Self {
        Self { transport, info }
    }

    /// Run the handshake on `transport` and wrap it.
    pub async fn connect(transport: Arc<dyn Transport>) -> McpResult<Self> {
        let info = initialize(transport.as_ref()).await?;
        Ok(Self::new(transport, info))
    }

    pub fn info(&self) -> &InitializeResult {
        &self.info
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.info.capabilities
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> McpResult<T> {
        let result = self.transport.request(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::protocol_error(format!("Invalid {method} result: {e}")))
    }

    /// Fetch every page of a `*/list` method, following `nextCursor`.
    async fn list_all<P: Page>(&self, method: &str) -> McpResult<Vec<P::Item>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        for _ in 0..MAX_PAGES {
            let params = serde_json::to_value(PaginatedParams {
                cursor: cursor.clone(),
            })?;
            let page: P = match self.call(method, Some(params)).await {
                Ok(page) => page,
                Err(e) if e.is_method_not_found() => {
                    debug!(method, "Server does not implement list method");
                    return Ok(items);
                }
                Err(e) => return Err(e),
            };
            let (mut batch, next) = page.into_parts();
            items.append(&mut batch);

            match next {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!(method, cursor = %next, "Server repeated a pagination cursor");
                    return Ok(items);
                }
                None => return Ok(items),
            }
        }

        warn!(method, pages = MAX_PAGES, "Stopped following pagination cursors");
        Ok(items)
    }

    /// List tools. Empty if the server does not advertise tools.
    pub async fn list_tools(&self) -> McpResult<Vec<McpTool>> {
        if self.capabilities().tools.is_none() {
            return Ok(Vec::new());
        }
        self.list_all::<ListToolsResult>("tools/list").await
    }

    pub async fn list_resources(&self) -> McpResult<Vec<McpResource>> {
        if self.capabilities().resources.is_none() {
            return Ok(Vec::new());
        }
        self.list_all::<ListResourcesResult>("resources/list").await
    }

    pub async fn list_prompts(&self) -> McpResult<Vec<McpPrompt>> {
        if self.capabilities().prompts.is_none() {
            return Ok(Vec::new());
        }
        self.list_all::<ListPromptsResult>("prompts/list").await
    }

    /// Call a tool.
    ///
    /// A result with `isError` set is still `Ok`; only protocol and
    /// transport failures are errors.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> McpResult<ToolCallResult> {
        debug!(tool = name, "Calling MCP tool");
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        self.call("tools/call", Some(params)).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> McpResult<GetPromptResult> {
        let params = serde_json::to_value(GetPromptParams {
            name: name.to_string(),
            arguments,
        })?;
        self.call("prompts/get", Some(params)).await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        let params = serde_json::to_value(ReadResourceParams {
            uri: uri.to_string(),
        })?;
        self.call("resources/read", Some(params)).await
    }

    pub async fn close(&self) -> McpResult<()> {
        self.transport.close().await
    }
}
