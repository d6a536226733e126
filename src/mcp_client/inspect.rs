//! Inspection workflow: connect to a server, probe what it offers, and
//! drive individual operations with a bounded wait.
//!
//! This is the policy layer above [`SessionManager`]: every protocol call is
//! capped at [`REQUEST_TIMEOUT`], a failed connect tears the session down
//! again, and listing probes never fail the whole refresh.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::errors::McpError;
use super::sessions::{ServerSession, SessionManager, SessionState};
use super::types::methods;

/// Upper bound on any single protocol call made from here.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// ─── Reports ─────────────────────────────────────────────────────────────────

/// Snapshot of a server's session.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub running: bool,
    pub command: Option<String>,
    pub capabilities: Option<Value>,
    pub initialize: Option<Value>,
}

/// An HTML resource the server marks as an embeddable application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Application {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub uri: String,
}

/// Result of probing the three listings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Facets {
    pub tools: Option<Value>,
    pub resources: Option<Value>,
    pub prompts: Option<Value>,
    pub applications: Vec<Application>,
}

// ─── Workflow ────────────────────────────────────────────────────────────────

/// Await `call`, failing with [`McpError::Timeout`] after [`REQUEST_TIMEOUT`].
pub async fn with_timeout<T>(
    method: &str,
    call: impl Future<Output = Result<T, McpError>>,
) -> Result<T, McpError> {
    match tokio::time::timeout(REQUEST_TIMEOUT, call).await {
        Ok(result) => result,
        Err(_) => Err(McpError::Timeout {
            method: method.to_string(),
            timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
        }),
    }
}

/// Start the server, run the handshake, and probe its listings.
///
/// Any failure stops the session again before the error is returned.
pub async fn connect(manager: &SessionManager, server_id: &str) -> Result<ServerStatus, McpError> {
    let session = manager.start(server_id)?;
    match handshake(&session).await {
        Ok(()) => {
            refresh_facets(&session).await;
            tracing::info!(server = %server_id, "server connected");
            Ok(status_for(&session))
        }
        Err(e) => {
            tracing::warn!(server = %server_id, error = %e, "connect failed, stopping server");
            manager.stop(server_id).await;
            Err(e)
        }
    }
}

async fn handshake(session: &ServerSession) -> Result<(), McpError> {
    let configuration = session.config.configuration.as_ref();
    let result = with_timeout(methods::INITIALIZE, session.client.initialize(configuration)).await?;

    let keep_schema = session.config.supports_dynamic_config;
    session.update_state(|state| {
        if keep_schema {
            if let Some(schema) = result.get("configSchema").filter(|s| !s.is_null()) {
                state.config_schema = Some(schema.clone());
            }
        }
        state.capabilities = Some(result.clone());
        state.initialize = Some(result);
    });
    session.set_connected(true);
    Ok(())
}

/// Probe tools, resources and prompts independently. A failing listing
/// marks that facet unsupported and clears its cache.
pub async fn refresh_facets(session: &ServerSession) -> Facets {
    let client = &session.client;
    let tools = with_timeout(methods::TOOLS_LIST, client.list_tools()).await.ok();
    let resources = with_timeout(methods::RESOURCES_LIST, client.list_resources()).await.ok();
    let prompts = with_timeout(methods::PROMPTS_LIST, client.list_prompts()).await.ok();

    let facets = Facets {
        applications: resources.as_ref().map(extract_applications).unwrap_or_default(),
        tools,
        resources,
        prompts,
    };

    session.update_state(|state| {
        state.supports_tools = Some(facets.tools.is_some());
        state.supports_resources = Some(facets.resources.is_some());
        state.supports_prompts = Some(facets.prompts.is_some());
        state.tools = facets.tools.clone();
        state.resources = facets.resources.clone();
        state.prompts = facets.prompts.clone();
    });
    tracing::debug!(
        server = %session.server_id,
        tools = facets.tools.is_some(),
        resources = facets.resources.is_some(),
        prompts = facets.prompts.is_some(),
        "facets refreshed"
    );
    facets
}

/// Facets as last probed, without talking to the server.
pub fn cached_facets(session: &ServerSession) -> Facets {
    let state = session.state();
    Facets {
        applications: state.resources.as_ref().map(extract_applications).unwrap_or_default(),
        tools: state.tools,
        resources: state.resources,
        prompts: state.prompts,
    }
}

/// Status of `server_id`; not-running when there is no live session.
pub fn status(manager: &SessionManager, server_id: &str) -> ServerStatus {
    match manager.get(server_id) {
        Some(session) if session.is_running() => status_for(&session),
        _ => ServerStatus::default(),
    }
}

fn status_for(session: &ServerSession) -> ServerStatus {
    let SessionState {
        capabilities,
        initialize,
        ..
    } = session.state();
    ServerStatus {
        running: true,
        command: session.config.command.clone(),
        capabilities,
        initialize,
    }
}

/// The running session for `server_id`, or [`McpError::NotRunning`].
pub fn require_session(
    manager: &SessionManager,
    server_id: &str,
) -> Result<std::sync::Arc<ServerSession>, McpError> {
    manager
        .get(server_id)
        .filter(|s| s.is_running())
        .ok_or_else(|| McpError::NotRunning {
            name: server_id.to_string(),
        })
}

/// Parse user-supplied JSON arguments. Blank input means `{}`.
pub fn parse_json_input(text: Option<&str>) -> Result<Value, McpError> {
    match text.map(str::trim).filter(|t| !t.is_empty()) {
        None => Ok(Value::Object(Default::default())),
        Some(text) => serde_json::from_str(text).map_err(|e| McpError::InvalidInput {
            reason: format!("arguments are not valid JSON: {e}"),
        }),
    }
}

/// Call a tool and return the raw response envelope.
pub async fn invoke_tool(
    manager: &SessionManager,
    server_id: &str,
    tool: &str,
    arguments: Option<&str>,
    meta: Option<Value>,
) -> Result<Value, McpError> {
    let session = require_session(manager, server_id)?;
    let arguments = parse_json_input(arguments)?;
    with_timeout(
        methods::TOOLS_CALL,
        session.client.call_tool(tool, Some(arguments), meta),
    )
    .await
}

pub async fn read_resource(
    manager: &SessionManager,
    server_id: &str,
    uri: &str,
) -> Result<Value, McpError> {
    let session = require_session(manager, server_id)?;
    with_timeout(methods::RESOURCES_READ, session.client.read_resource(uri)).await
}

pub async fn get_prompt(
    manager: &SessionManager,
    server_id: &str,
    name: &str,
    arguments: Option<&str>,
) -> Result<Value, McpError> {
    let session = require_session(manager, server_id)?;
    let arguments = parse_json_input(arguments)?;
    with_timeout(
        methods::PROMPTS_GET,
        session.client.get_prompt(name, Some(arguments)),
    )
    .await
}

// ─── Applications ────────────────────────────────────────────────────────────

/// Pick out `text/html` resources annotated `type: application`.
///
/// Accepts either a `resources/list` result or a bare array.
pub fn extract_applications(resources: &Value) -> Vec<Application> {
    let list = resources.get("resources").unwrap_or(resources);
    let Some(entries) = list.as_array() else {
        return Vec::new();
    };

    entries
        .iter()
        .filter(|entry| is_application(entry))
        .filter_map(|entry| {
            let uri = entry.get("uri")?.as_str()?.trim();
            if uri.is_empty() {
                return None;
            }
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.trim().is_empty())
                .map(str::to_string);
            Some(Application {
                name,
                uri: uri.to_string(),
            })
        })
        .collect()
}

fn is_application(entry: &Value) -> bool {
    let html = entry
        .get("mimeType")
        .and_then(Value::as_str)
        .is_some_and(|m| m.to_ascii_lowercase().starts_with("text/html"));
    let kind = entry
        .get("annotations")
        .and_then(|a| a.get("type"))
        .and_then(Value::as_str)
        .is_some_and(|t| t.eq_ignore_ascii_case("application"));
    html && kind
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::ServerConfig;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn test_extract_applications() {
        let resources = json!({
            "resources": [
                {"uri": "ui://dashboard", "name": "Dashboard", "mimeType": "text/html;profile=mcp",
                 "annotations": {"type": "Application"}},
                {"uri": "ui://plain", "mimeType": "text/html"},
                {"uri": "file:///a.txt", "mimeType": "text/plain", "annotations": {"type": "application"}},
                {"uri": "  ", "mimeType": "text/html", "annotations": {"type": "application"}},
                {"uri": "ui://nameless", "name": " ", "mimeType": "TEXT/HTML", "annotations": {"type": "application"}}
            ]
        });
        let apps = extract_applications(&resources);
        assert_eq!(
            apps,
            vec![
                Application { name: Some("Dashboard".into()), uri: "ui://dashboard".into() },
                Application { name: None, uri: "ui://nameless".into() },
            ]
        );
        assert!(extract_applications(&json!({"resources": "nope"})).is_empty());
        assert!(extract_applications(&Value::Null).is_empty());
    }

    #[test]
    fn test_parse_json_input() {
        assert_eq!(parse_json_input(None).unwrap(), json!({}));
        assert_eq!(parse_json_input(Some("   ")).unwrap(), json!({}));
        assert_eq!(parse_json_input(Some(r#"{"a": 1}"#)).unwrap(), json!({"a": 1}));
        assert!(matches!(
            parse_json_input(Some("{broken")),
            Err(McpError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_operations_require_running_session() {
        let mut servers = HashMap::new();
        servers.insert(
            "remote".to_string(),
            ServerConfig {
                id: "remote".into(),
                transport: Some("streamable".into()),
                http_url: Some("http://localhost:9/mcp".into()),
                ..Default::default()
            },
        );
        let manager = SessionManager::new(Arc::new(servers));

        let err = invoke_tool(&manager, "remote", "echo", None, None).await.unwrap_err();
        assert!(matches!(err, McpError::NotRunning { .. }));

        // Started but never initialized: still not running.
        manager.start("remote").unwrap();
        assert!(!status(&manager, "remote").running);
        assert!(read_resource(&manager, "remote", "ui://x").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_reports_method() {
        let err = with_timeout("tools/list", std::future::pending::<Result<(), McpError>>())
            .await
            .unwrap_err();
        match err {
            McpError::Timeout { method, timeout_ms } => {
                assert_eq!(method, "tools/list");
                assert_eq!(timeout_ms, 15_000);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }
}
