//! Process session manager: the runtime context owning every live session.
//!
//! At most one session exists per server id. `start` is create-if-absent
//! under the session-table lock, so concurrent starts for the same id spawn
//! exactly one process. A stdio session's exit watcher evicts that session
//! (and only that instance) when the process dies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::client::McpClient;
use super::config::{ServerCatalog, ServerConfig, TransportKind};
use super::errors::McpError;
use super::framing::Framing;
use super::lifecycle::{self, ProcessHandle, SHUTDOWN_TIMEOUT};
use super::log_stream::LogBroadcaster;
use super::sse::SseClient;
use super::streamable::StreamableHttpClient;
use super::transport::StdioConnection;

// ─── ServerSession ───────────────────────────────────────────────────────────

/// What has been learned from the server since it was started.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub capabilities: Option<Value>,
    pub initialize: Option<Value>,
    pub config_schema: Option<Value>,
    pub tools: Option<Value>,
    pub resources: Option<Value>,
    pub prompts: Option<Value>,
    pub supports_tools: Option<bool>,
    pub supports_resources: Option<bool>,
    pub supports_prompts: Option<bool>,
}

/// One live connection to a server, plus its process when it has one.
pub struct ServerSession {
    pub server_id: String,
    pub config: ServerConfig,
    pub client: McpClient,
    pub log_stream: Arc<LogBroadcaster>,
    instance: Uuid,
    process: Option<ProcessHandle>,
    connected: AtomicBool,
    state: Mutex<SessionState>,
}

impl ServerSession {
    /// Connected, and (for stdio) the process is still alive.
    pub fn is_running(&self) -> bool {
        let alive = self.process.as_ref().map_or(true, ProcessHandle::is_alive);
        alive && self.is_connected()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    pub fn state(&self) -> SessionState {
        self.lock_state().clone()
    }

    pub fn update_state(&self, update: impl FnOnce(&mut SessionState)) {
        update(&mut self.lock_state());
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

type SessionTable = Arc<Mutex<HashMap<String, Arc<ServerSession>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── SessionManager ──────────────────────────────────────────────────────────

/// Owns all sessions and the per-server log tails.
pub struct SessionManager {
    catalog: Arc<dyn ServerCatalog>,
    sessions: SessionTable,
    log_streams: Mutex<HashMap<String, Arc<LogBroadcaster>>>,
}

impl SessionManager {
    pub fn new(catalog: Arc<dyn ServerCatalog>) -> Self {
        Self {
            catalog,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            log_streams: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live session for `server_id`, creating it if absent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, server_id: &str) -> Result<Arc<ServerSession>, McpError> {
        let mut sessions = lock(&self.sessions);
        if let Some(existing) = sessions.get(server_id) {
            return Ok(Arc::clone(existing));
        }

        let config = self.catalog.server(server_id).ok_or_else(|| McpError::ConfigError {
            reason: format!("unknown server '{server_id}'"),
        })?;
        let session = Arc::new(self.create_session(server_id, config)?);
        sessions.insert(server_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, server_id: &str) -> Option<Arc<ServerSession>> {
        lock(&self.sessions).get(server_id).cloned()
    }

    pub fn is_running(&self, server_id: &str) -> bool {
        self.get(server_id).is_some_and(|s| s.is_running())
    }

    /// Ids of every live session, sorted.
    pub fn running_servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove and tear down a session. No-op if there is none.
    ///
    /// Returns once the process has exited (or the shutdown timeout passed)
    /// and every pending call on the connection has failed.
    pub async fn stop(&self, server_id: &str) {
        let removed = lock(&self.sessions).remove(server_id);
        let Some(session) = removed else {
            return;
        };

        session.log_stream.publish("stopping server");
        session.set_connected(false);
        tracing::info!(server = %server_id, pid = ?session.pid(), "stopping server");

        if let Some(process) = &session.process {
            process.terminate(SHUTDOWN_TIMEOUT).await;
        }
        session.client.shutdown(SHUTDOWN_TIMEOUT).await;
    }

    /// The log tail for `server_id`. Outlives sessions, so a restarted server
    /// keeps its history.
    pub fn log_stream_for(&self, server_id: &str) -> Arc<LogBroadcaster> {
        let mut streams = lock(&self.log_streams);
        Arc::clone(
            streams
                .entry(server_id.to_string())
                .or_insert_with(|| LogBroadcaster::new(server_id)),
        )
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        for id in self.running_servers() {
            self.stop(&id).await;
        }
    }

    fn create_session(&self, server_id: &str, config: ServerConfig) -> Result<ServerSession, McpError> {
        let transport = config.transport_kind()?;
        let logs = self.log_stream_for(server_id);
        let instance = Uuid::new_v4();

        let (client, process) = match transport {
            TransportKind::Stdio => {
                let (client, process) = self.spawn_stdio(server_id, &config, &logs, instance)?;
                (client, Some(process))
            }
            TransportKind::Sse => {
                let url = config.require_http_url()?;
                let client = SseClient::new(
                    server_id,
                    url,
                    config.http_message_url.as_deref(),
                    &config.http_headers,
                    logs.sink(),
                )?;
                logs.publish(format!("created http session {url}"));
                tracing::info!(server = %server_id, url = %url, "created SSE session");
                (McpClient::Sse(client), None)
            }
            TransportKind::Streamable => {
                let url = config.require_http_url()?;
                let client =
                    StreamableHttpClient::new(server_id, url, &config.http_headers, logs.sink())?;
                logs.publish(format!("created http session {url}"));
                tracing::info!(server = %server_id, url = %url, "created streamable HTTP session");
                (McpClient::Streamable(client), None)
            }
        };

        Ok(ServerSession {
            server_id: server_id.to_string(),
            config,
            client,
            log_stream: logs,
            instance,
            process,
            connected: AtomicBool::new(false),
            state: Mutex::new(SessionState::default()),
        })
    }

    fn spawn_stdio(
        &self,
        server_id: &str,
        config: &ServerConfig,
        logs: &Arc<LogBroadcaster>,
        instance: Uuid,
    ) -> Result<(McpClient, ProcessHandle), McpError> {
        let command = config.command.as_deref().unwrap_or_default();
        let (program, args) = lifecycle::split_command_line(command)?;
        let mut child =
            lifecycle::spawn_process(server_id, &program, &args, config.cwd.as_deref(), &config.env)?;

        let missing = |pipe: &str| McpError::SpawnFailed {
            name: server_id.to_string(),
            reason: format!("failed to capture {pipe}"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let framing = Framing::from_config(config.framing.as_deref());
        let connection = StdioConnection::start(server_id, stdout, stdin, framing, logs.sink());
        let stderr_task = lifecycle::drain_stderr(stderr, Arc::clone(logs));

        let sessions = Arc::clone(&self.sessions);
        let id = server_id.to_string();
        let process = lifecycle::watch_exit(
            server_id,
            child,
            Arc::clone(logs),
            Some(stderr_task),
            move || {
                let evicted = {
                    let mut table = lock(&sessions);
                    match table.get(&id) {
                        Some(current) if current.instance == instance => table.remove(&id),
                        _ => None,
                    }
                };
                if evicted.is_some() {
                    tracing::info!(server = %id, "session evicted after process exit");
                }
            },
        );

        logs.publish(format!("started server {command}"));
        tracing::info!(
            server = %server_id,
            pid = ?process.pid(),
            framing = ?framing,
            "started server process"
        );
        Ok((McpClient::Stdio(connection), process))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
