//! JSON-RPC 2.0 envelope codec for the MCP client.
//!
//! Envelopes are built as plain `serde_json::Value` objects so every transport
//! serializes them identically. Incoming messages are classified by shape
//! (`id` + `result`, `id` + `error`, `method` without `id`).

use serde_json::{json, Map, Value};

use super::errors::McpError;

// ─── Protocol Constants ──────────────────────────────────────────────────────

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent in every `initialize` call.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// `clientInfo.name` announced to servers.
pub const CLIENT_NAME: &str = "mcp-tester";

/// `clientInfo.version` announced to servers.
pub const CLIENT_VERSION: &str = "0.1.0";

/// Method names used by the client.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Completion Mode ─────────────────────────────────────────────────────────

/// How a completed call is handed back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Resolve to the `result` field; an `error` field becomes `McpError::ServerError`.
    Unwrapped,
    /// Resolve to the whole envelope. Used by `tools/call` so structured tool
    /// errors reach the caller intact.
    Raw,
}

impl CallMode {
    /// Turn a response envelope into the value this mode hands back.
    pub fn complete(self, envelope: Value) -> Result<Value, McpError> {
        match self {
            CallMode::Raw => Ok(envelope),
            CallMode::Unwrapped => unwrap_response(envelope),
        }
    }
}

/// Extract `result` from a response envelope.
///
/// An envelope with neither `result` nor `error` is returned unchanged; some
/// HTTP servers answer with a bare document.
pub fn unwrap_response(mut envelope: Value) -> Result<Value, McpError> {
    let Some(obj) = envelope.as_object_mut() else {
        return Ok(envelope);
    };
    if let Some(result) = obj.remove("result") {
        return Ok(result);
    }
    if let Some(error) = obj.get("error") {
        return Err(McpError::from_rpc_error(error));
    }
    Ok(envelope)
}

// ─── Builders ────────────────────────────────────────────────────────────────

/// Build a request envelope.
pub fn request(id: u64, method: &str, params: Option<Value>) -> Value {
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
    obj.insert("id".into(), Value::from(id));
    obj.insert("method".into(), Value::from(method));
    if let Some(params) = params {
        obj.insert("params".into(), params);
    }
    Value::Object(obj)
}

/// Build a notification envelope (no `id`, no response expected).
pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
    obj.insert("method".into(), Value::from(method));
    if let Some(params) = params {
        obj.insert("params".into(), params);
    }
    Value::Object(obj)
}

/// Params for `initialize`.
///
/// Dynamic server configuration, when present, rides along under
/// `capabilities.experimental.configuration`.
pub fn initialize_params(configuration: Option<&Value>) -> Value {
    let mut capabilities = Map::new();
    if let Some(configuration) = configuration.filter(|c| !c.is_null()) {
        capabilities.insert(
            "experimental".into(),
            json!({ "configuration": configuration }),
        );
    }
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": capabilities,
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": CLIENT_VERSION,
        },
    })
}

/// Params for `tools/call`. `_meta` is only sent when it carries something.
pub fn call_tool_params(name: &str, arguments: Option<Value>, meta: Option<Value>) -> Value {
    let mut obj = Map::new();
    obj.insert("name".into(), Value::from(name));
    if let Some(arguments) = arguments {
        obj.insert("arguments".into(), arguments);
    }
    if let Some(meta) = meta.filter(|m| !is_empty_value(m)) {
        obj.insert("_meta".into(), meta);
    }
    Value::Object(obj)
}

/// Params for `resources/read`.
pub fn read_resource_params(uri: &str) -> Value {
    json!({ "uri": uri })
}

/// Params for `prompts/get`.
pub fn get_prompt_params(name: &str, arguments: Option<Value>) -> Value {
    let mut obj = Map::new();
    obj.insert("name".into(), Value::from(name));
    if let Some(arguments) = arguments {
        obj.insert("arguments".into(), arguments);
    }
    Value::Object(obj)
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

/// Shape of a message received from a server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// `id` + `result`.
    Response { id: u64 },
    /// `id` + `error`.
    ErrorResponse { id: u64 },
    /// `method` without `id`. Ignored by correlation.
    Notification { method: String },
    /// `id` + `method`: a server-initiated request. Ignored by correlation.
    ServerRequest { id: u64, method: String },
    /// Anything else (batches, malformed objects).
    Unknown,
}

impl Incoming {
    /// Classify a parsed JSON message.
    pub fn classify(message: &Value) -> Self {
        let Some(obj) = message.as_object() else {
            return Incoming::Unknown;
        };
        let id = obj.get("id").and_then(parse_id);
        let method = obj.get("method").and_then(Value::as_str);

        match (id, method) {
            (Some(id), _) if obj.contains_key("result") => Incoming::Response { id },
            (Some(id), _) if obj.contains_key("error") => Incoming::ErrorResponse { id },
            (Some(id), Some(method)) => Incoming::ServerRequest {
                id,
                method: method.to_string(),
            },
            (None, Some(method)) if !obj.contains_key("id") => Incoming::Notification {
                method: method.to_string(),
            },
            _ => Incoming::Unknown,
        }
    }

    /// The correlation id, for responses and error responses.
    pub fn response_id(&self) -> Option<u64> {
        match self {
            Incoming::Response { id } | Incoming::ErrorResponse { id } => Some(*id),
            _ => None,
        }
    }
}

/// Read a JSON-RPC id. Numbers and numeric strings are accepted.
pub fn parse_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Whether trimmed text has the shape of a JSON object or array.
pub fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

// ─── Tests ───────────────────────────────────────────────────────────────────
