//! MCP Client: the seven protocol operations over any transport.
//!
//! [`McpClient`] is a closed set of transport variants. Each variant only
//! knows how to send a request (in a given [`CallMode`]) and a notification;
//! the MCP operations are written once on top of that.

use std::time::Duration;

use serde_json::Value;

use super::errors::McpError;
use super::sse::SseClient;
use super::streamable::StreamableHttpClient;
use super::transport::StdioConnection;
use super::types::{self, methods, CallMode};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// A connected MCP server, whatever the transport.
pub enum McpClient {
    Stdio(StdioConnection),
    Sse(SseClient),
    Streamable(StreamableHttpClient),
}

impl McpClient {
    pub fn transport_name(&self) -> &'static str {
        match self {
            McpClient::Stdio(_) => "stdio",
            McpClient::Sse(_) => "sse",
            McpClient::Streamable(_) => "streamable",
        }
    }

    // ─── Operations ──────────────────────────────────────────────────────

    /// Run the handshake: `initialize`, then the `initialized` notification
    /// once the response has arrived. Returns the initialize result.
    pub async fn initialize(&self, configuration: Option<&Value>) -> Result<Value, McpError> {
        let result = self
            .call(
                methods::INITIALIZE,
                Some(types::initialize_params(configuration)),
                CallMode::Unwrapped,
            )
            .await?;
        self.notify(methods::INITIALIZED, None).await?;
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Value, McpError> {
        self.call(methods::TOOLS_LIST, None, CallMode::Unwrapped).await
    }

    pub async fn list_resources(&self) -> Result<Value, McpError> {
        self.call(methods::RESOURCES_LIST, None, CallMode::Unwrapped).await
    }

    pub async fn list_prompts(&self) -> Result<Value, McpError> {
        self.call(methods::PROMPTS_LIST, None, CallMode::Unwrapped).await
    }

    /// Invoke a tool. Returns the full response envelope, errors included,
    /// so the caller can show exactly what the server said.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        meta: Option<Value>,
    ) -> Result<Value, McpError> {
        let params = types::call_tool_params(name, arguments, meta);
        self.call(methods::TOOLS_CALL, Some(params), CallMode::Raw).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        let params = types::read_resource_params(uri);
        self.call(methods::RESOURCES_READ, Some(params), CallMode::Unwrapped)
            .await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value, McpError> {
        let params = types::get_prompt_params(name, arguments);
        self.call(methods::PROMPTS_GET, Some(params), CallMode::Unwrapped)
            .await
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Tear down the connection. Pending calls fail; nothing else is sent.
    pub async fn shutdown(&self, grace: Duration) {
        match self {
            McpClient::Stdio(conn) => conn.shutdown(grace).await,
            McpClient::Sse(client) => client.shutdown().await,
            McpClient::Streamable(_) => {}
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        mode: CallMode,
    ) -> Result<Value, McpError> {
        match self {
            McpClient::Stdio(conn) => conn.request(method, params, mode).await,
            McpClient::Sse(client) => client.request(method, params, mode).await,
            McpClient::Streamable(client) => client.request(method, params, mode).await,
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        match self {
            McpClient::Stdio(conn) => conn.notify(method, params).await,
            McpClient::Sse(client) => client.notify(method, params).await,
            McpClient::Streamable(client) => client.notify(method, params).await,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
