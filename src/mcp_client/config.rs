//! Server configuration: loading the catalogue of servers the tester knows.
//!
//! A catalogue is either one YAML/JSON file with a `servers` list, or a
//! directory holding one `*.json` file per server. Missing ids are derived
//! from the server name (`"My Server"` → `my-server`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::McpError;

// ─── ServerConfig ────────────────────────────────────────────────────────────

/// Configuration for a single server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Full command line for stdio servers.
    pub command: Option<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    /// `"ndjson"` (default) or `"content-length"`.
    pub framing: Option<String>,
    /// `"stdio"` (default), `"sse"`, or `"streamable"`.
    pub transport: Option<String>,
    pub http_url: Option<String>,
    pub http_message_url: Option<String>,
    pub http_headers: HashMap<String, String>,
    /// Whether the server's `configSchema` is kept from `initialize`.
    pub supports_dynamic_config: bool,
    /// Sent as `configuration` with `initialize` when present.
    pub configuration: Option<Value>,
    pub config_schema: Option<Value>,
}

/// The three ways of reaching a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
    Streamable,
}

impl TransportKind {
    /// Parse the configured transport name. Absent or blank means stdio.
    pub fn from_config(value: Option<&str>) -> Result<Self, McpError> {
        let value = value.map(str::trim).unwrap_or_default();
        if value.is_empty() || value.eq_ignore_ascii_case("stdio") {
            Ok(TransportKind::Stdio)
        } else if value.eq_ignore_ascii_case("sse") {
            Ok(TransportKind::Sse)
        } else if value.eq_ignore_ascii_case("streamable") {
            Ok(TransportKind::Streamable)
        } else {
            Err(McpError::ConfigError {
                reason: format!("unsupported transport '{value}'"),
            })
        }
    }
}

impl ServerConfig {
    pub fn transport_kind(&self) -> Result<TransportKind, McpError> {
        TransportKind::from_config(self.transport.as_deref())
    }

    /// The configured HTTP URL, rejecting a missing or blank one.
    pub fn require_http_url(&self) -> Result<&str, McpError> {
        self.http_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| McpError::ConfigError {
                reason: format!("server '{}' has no httpUrl", self.id),
            })
    }
}

// ─── Catalogue ───────────────────────────────────────────────────────────────

/// Where the session manager looks up server configurations.
pub trait ServerCatalog: Send + Sync {
    fn server(&self, id: &str) -> Option<ServerConfig>;
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServersConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl ServersConfig {
    pub fn get(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Fill in derived ids and names; reject unnamed or duplicate entries.
    fn normalize(mut self) -> Result<Self, McpError> {
        let mut seen = HashMap::new();
        for (index, server) in self.servers.iter_mut().enumerate() {
            if server.id.trim().is_empty() {
                server.id = server_id(&server.name);
            } else {
                server.id = server.id.trim().to_string();
            }
            if server.id.is_empty() {
                return Err(McpError::ConfigError {
                    reason: format!("server #{} has neither id nor name", index + 1),
                });
            }
            if server.name.trim().is_empty() {
                server.name = server.id.clone();
            }
            if seen.insert(server.id.clone(), index).is_some() {
                return Err(McpError::ConfigError {
                    reason: format!("duplicate server id '{}'", server.id),
                });
            }
        }
        Ok(self)
    }
}

impl ServerCatalog for ServersConfig {
    fn server(&self, id: &str) -> Option<ServerConfig> {
        self.get(id).cloned()
    }
}

impl ServerCatalog for HashMap<String, ServerConfig> {
    fn server(&self, id: &str) -> Option<ServerConfig> {
        self.get(id).cloned()
    }
}

// ─── Ids ─────────────────────────────────────────────────────────────────────

/// Derive a server id from its display name: lowercase, runs of anything
/// other than `[a-z0-9]` become `-`, no leading or trailing dashes.
pub fn server_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    for c in name.trim().to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            id.push(c);
        } else if !id.ends_with('-') {
            id.push('-');
        }
    }
    id.trim_matches('-').to_string()
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Default catalogue location inside the app data directory.
pub fn default_config_path() -> PathBuf {
    crate::data_dir().join("servers.yaml")
}

/// Load a catalogue from a file or a directory of `*.json` server files.
pub fn load_servers(path: &Path) -> Result<ServersConfig, McpError> {
    let config = if path.is_dir() {
        load_dir(path)?
    } else {
        load_file(path)?
    };
    let config = config.normalize()?;
    tracing::info!(path = %path.display(), servers = config.servers.len(), "loaded server catalogue");
    Ok(config)
}

fn load_file(path: &Path) -> Result<ServersConfig, McpError> {
    let content = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(&content).map_err(|e| McpError::ConfigError {
            reason: format!("invalid YAML in {}: {e}", path.display()),
        })
    } else {
        serde_json::from_str(&content).map_err(|e| McpError::ConfigError {
            reason: format!("invalid JSON in {}: {e}", path.display()),
        })
    }
}

fn load_dir(dir: &Path) -> Result<ServersConfig, McpError> {
    let entries = std::fs::read_dir(dir).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", dir.display()),
    })?;

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();

    let mut servers = Vec::with_capacity(files.len());
    for file in files {
        let content = std::fs::read_to_string(&file).map_err(|e| McpError::ConfigError {
            reason: format!("failed to read {}: {e}", file.display()),
        })?;
        match serde_json::from_str::<ServerConfig>(&content) {
            Ok(server) => servers.push(server),
            Err(e) => {
                tracing::warn!(path = %file.display(), error = %e, "skipping unreadable server file");
            }
        }
    }
    Ok(ServersConfig { servers })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_server_id_slug() {
        assert_eq!(server_id("My Server"), "my-server");
        assert_eq!(server_id("  --Everything__Server v2!! "), "everything-server-v2");
        assert_eq!(server_id("fs"), "fs");
        assert_eq!(server_id("!!!"), "");
    }

    #[test]
    fn test_transport_kind() {
        assert_eq!(TransportKind::from_config(None).unwrap(), TransportKind::Stdio);
        assert_eq!(TransportKind::from_config(Some(" ")).unwrap(), TransportKind::Stdio);
        assert_eq!(TransportKind::from_config(Some("SSE")).unwrap(), TransportKind::Sse);
        assert_eq!(
            TransportKind::from_config(Some("Streamable")).unwrap(),
            TransportKind::Streamable
        );
        assert!(matches!(
            TransportKind::from_config(Some("websocket")),
            Err(McpError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.yaml");
        std::fs::write(
            &path,
            r#"
servers:
  - name: Everything Server
    command: npx -y @modelcontextprotocol/server-everything
    framing: content-length
  - id: remote
    transport: sse
    httpUrl: http://localhost:3001/sse
    httpHeaders:
      Authorization: Bearer x
    supportsDynamicConfig: true
    configuration:
      region: eu
"#,
        )
        .unwrap();

        let config = load_servers(&path).unwrap();
        assert_eq!(config.servers.len(), 2);

        let everything = config.get("everything-server").unwrap();
        assert_eq!(everything.framing.as_deref(), Some("content-length"));
        assert_eq!(everything.transport_kind().unwrap(), TransportKind::Stdio);

        let remote = config.server("remote").unwrap();
        assert_eq!(remote.name, "remote");
        assert_eq!(remote.require_http_url().unwrap(), "http://localhost:3001/sse");
        assert_eq!(remote.http_headers["Authorization"], "Bearer x");
        assert!(remote.supports_dynamic_config);
        assert_eq!(remote.configuration.as_ref().unwrap()["region"], "eu");
    }

    #[test]
    fn test_load_json_dir_skips_bad_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"id": "a", "name": "A", "command": "node a.js", "unknownField": 1}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("b.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let config = load_servers(dir.path()).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].command.as_deref(), Some("node a.js"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            r#"{"servers": [{"name": "Echo"}, {"id": "echo", "command": "x"}]}"#,
        )
        .unwrap();
        let err = load_servers(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate server id 'echo'"));
    }

    #[test]
    fn test_missing_http_url() {
        let config = ServerConfig {
            id: "remote".into(),
            transport: Some("streamable".into()),
            http_url: Some("   ".into()),
            ..Default::default()
        };
        assert!(config.require_http_url().is_err());
    }
}
