//! MCP Client error types.
//!
//! Errors fall into four classes: transport-fatal (the connection is gone and
//! every pending call fails), call-level (one call fails, the session stays
//! usable), configuration (raised by `start`, no session is created), and
//! non-JSON noise, which is never an error and only shows up in the log tail.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// I/O failure while writing to or reading from a transport.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The connection's read loop has terminated; every pending call is swept
    /// with this error and new calls are refused.
    #[error("connection to '{server}' closed: {reason}")]
    ConnectionClosed {
        server: String,
        reason: String,
    },

    /// The byte stream violated its framing discipline.
    #[error("framing error: {reason}")]
    Framing {
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Non-2xx HTTP response.
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },

    /// The caller gave up waiting for a call.
    #[error("'{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// A streamed HTTP response finished without the expected message.
    #[error("stream ended without response for '{method}'")]
    StreamEnded {
        method: String,
    },

    /// A response body could not be decoded.
    #[error("invalid response: {reason}")]
    InvalidResponse {
        reason: String,
    },

    /// The session is not started or no longer alive.
    #[error("server '{name}' is not running")]
    NotRunning {
        name: String,
    },

    /// Configuration error (unknown server, bad transport, bad command line).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// Caller-supplied arguments could not be parsed.
    #[error("invalid input: {reason}")]
    InvalidInput {
        reason: String,
    },
}

impl McpError {
    /// Whether this error means the whole connection is unusable.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            McpError::ConnectionClosed { .. } | McpError::Framing { .. }
        )
    }

    /// Whether this error only affects the call that produced it.
    pub fn is_call_level(&self) -> bool {
        matches!(
            self,
            McpError::ServerError { .. }
                | McpError::HttpStatus { .. }
                | McpError::Timeout { .. }
                | McpError::StreamEnded { .. }
                | McpError::InvalidResponse { .. }
        )
    }

    /// Build a `ServerError` from a JSON-RPC `error` object.
    ///
    /// Tolerates servers that send a bare string or omit `code`.
    pub fn from_rpc_error(error: &serde_json::Value) -> Self {
        let code = error
            .get("code")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(super::types::error_codes::INTERNAL_ERROR);
        let message = match error.get("message").and_then(serde_json::Value::as_str) {
            Some(m) => m.to_string(),
            None => error.to_string(),
        };
        McpError::ServerError {
            code,
            message,
            data: error.get("data").cloned(),
        }
    }
}
