//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with an MCP server child process:
//! - Writing framed JSON-RPC messages to stdin (one writer at a time)
//! - A background read loop that owns stdout and delivers responses by id
//! - Sweeping every pending call when stdout closes or the stream breaks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::framing::{Frame, FrameReader, Framing};
use super::log_stream::LogSink;
use super::pending::{Delivery, PendingTable};
use super::types::{self, CallMode};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Connection ──────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC connection over a child process's stdio.
pub struct StdioConnection {
    server_name: String,
    framing: Framing,
    writer: Mutex<BoxedWriter>,
    next_id: AtomicU64,
    pending: Arc<PendingTable>,
    log: LogSink,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StdioConnection {
    /// Wrap a process's stdout/stdin and start the read loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<R, W>(server_name: &str, stdout: R, stdin: W, framing: Framing, log: LogSink) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(PendingTable::new(server_name));
        let reader = FrameReader::new(BufReader::new(stdout), framing);
        let handle = tokio::spawn(read_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&pending),
            log.clone(),
        ));

        Self {
            server_name: server_name.to_string(),
            framing,
            writer: Mutex::new(Box::new(stdin)),
            next_id: AtomicU64::new(1),
            pending,
            log,
            reader: std::sync::Mutex::new(Some(handle)),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Send a request and wait for the response with the same id.
    ///
    /// The call is registered before its frame is written, so a fast server
    /// cannot answer before anyone is listening.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        mode: CallMode,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = types::request(id, method, params);
        let completion = self.pending.register(id, mode)?;

        if let Err(e) = self.send(&envelope).await {
            self.pending.forget(id);
            return Err(e);
        }

        completion.await.map_err(|_| McpError::ConnectionClosed {
            server: self.server_name.clone(),
            reason: "completion dropped".into(),
        })?
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.send(&types::notification(method, params)).await
    }

    async fn send(&self, envelope: &Value) -> Result<(), McpError> {
        let json = serde_json::to_string(envelope).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        let frame = self.framing.encode(&json);
        self.log.emit(format!(">> {json}"));

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        result.map_err(|e| {
            self.log.emit(format!("!! failed to send request: {e}"));
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            }
        })
    }

    /// Number of calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the read loop has terminated and swept the table.
    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Join the read loop.
    ///
    /// Normally the loop ends on its own once the process is gone. If it has
    /// not finished within `grace` it is aborted; either way every pending
    /// call has been failed when this returns.
    pub async fn shutdown(&self, grace: Duration) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(server = %self.server_name, "read loop did not finish, aborting");
                handle.abort();
            }
        }
        self.pending.close("connection shut down");
    }
}

impl Drop for StdioConnection {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

// ─── Read Loop ───────────────────────────────────────────────────────────────

/// Sole deliverer of completions for one connection.
async fn read_loop<R>(
    server: String,
    mut reader: FrameReader<R>,
    pending: Arc<PendingTable>,
    log: LogSink,
) where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let reason = loop {
        match reader.next_frame().await {
            Ok(Some(Frame::Message { text, value })) => {
                log.emit(format!("<< {text}"));
                if let Delivery::Unmatched(id) = pending.deliver(value) {
                    tracing::debug!(server = %server, id, "response for unknown request id");
                }
            }
            Ok(Some(Frame::Noise(text))) => log.emit(format!(".. {text}")),
            Ok(Some(Frame::Malformed { reason, .. })) => {
                log.emit(format!("!! failed to parse json: {reason}"));
            }
            Ok(None) => break "server stdout closed (process may have exited)".to_string(),
            Err(e) => {
                log.emit(format!("!! reader error: {e}"));
                break e.to_string();
            }
        }
    };

    let swept = pending.close(&reason);
    tracing::info!(server = %server, swept, reason = %reason, "stdio read loop finished");
}

// ─── Tests ───────────────────────────────────────────────────────────────────
