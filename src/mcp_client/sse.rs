//! Legacy HTTP+SSE transport.
//!
//! Requests are POSTed to a message endpoint; responses arrive as events on a
//! long-lived `GET` stream. The server announces the message endpoint as an
//! event on that stream. Until it does, a caller waits up to
//! [`ENDPOINT_WAIT`] and then falls back to a URL derived from the stream URL
//! (`…/sse` becomes `…/message`). The first announced endpoint wins and is
//! never replaced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client as HttpClient;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::http::{self, ByteLines, REQUEST_TIMEOUT};
use super::log_stream::LogSink;
use super::pending::{Delivery, PendingTable};
use super::types::{self, CallMode};

/// How long a call waits for the endpoint event before using the fallback.
pub const ENDPOINT_WAIT: Duration = Duration::from_secs(1);

// ─── Event Parsing ───────────────────────────────────────────────────────────

/// Accumulates `data:` lines into event payloads.
///
/// Only `data` fields matter here; `event:`, `id:`, `retry:` and comment lines
/// are ignored. A blank line ends the event.
#[derive(Debug, Default)]
pub struct SseEventParser {
    data: Vec<String>,
}

impl SseEventParser {
    /// Feed one line (without its terminator). Returns a payload when the
    /// line completes a non-empty event.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        if line.trim().is_empty() {
            return self.flush();
        }
        if let Some(rest) = line.strip_prefix("data:") {
            self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        None
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        self.flush()
    }

    fn flush(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        let payload = payload.trim();
        (!payload.is_empty()).then(|| payload.to_string())
    }
}

/// Derive the fallback message endpoint from a stream URL ending in `/sse`
/// or `/sse/`. The query string is preserved. Other URLs have no fallback.
pub fn derive_message_endpoint(sse_url: &str) -> Option<String> {
    let mut url = reqwest::Url::parse(sse_url.trim()).ok()?;
    let path = url.path().to_string();
    let trimmed = path.strip_suffix('/').unwrap_or(&path);
    let base = trimmed.strip_suffix("/sse")?;
    url.set_path(&format!("{base}/message"));
    Some(url.to_string())
}

// ─── Client ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum EndpointState {
    Waiting,
    Ready(String),
    Failed(String),
}

struct Shared {
    server_name: String,
    http: HttpClient,
    sse_url: String,
    headers: HeaderMap,
    fallback: Option<String>,
    /// Set once a call has waited out the announcement and used the fallback.
    fallback_in_use: AtomicBool,
    endpoint: watch::Sender<EndpointState>,
    pending: PendingTable,
    log: LogSink,
}

/// One SSE session: a lazily opened event stream plus message POSTs.
pub struct SseClient {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    stream_started: AtomicBool,
    stream_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SseClient {
    /// Create a client. No network traffic happens until the first call.
    ///
    /// A non-blank `message_url` is used as the endpoint from the start.
    pub fn new(
        server_name: &str,
        sse_url: &str,
        message_url: Option<&str>,
        headers: &HashMap<String, String>,
        log: LogSink,
    ) -> Result<Self, McpError> {
        http::parse_url(sse_url, "SSE URL")?;
        let headers = http::header_map(headers)?;
        let http = http::build_client(server_name)?;

        let configured = message_url.map(str::trim).filter(|u| !u.is_empty());
        let initial = match configured {
            Some(url) => {
                http::parse_url(url, "message URL")?;
                log.emit(format!("configured message endpoint {url}"));
                EndpointState::Ready(url.to_string())
            }
            None => EndpointState::Waiting,
        };
        let fallback = derive_message_endpoint(sse_url);
        if configured.is_none() {
            if let Some(fallback) = &fallback {
                log.emit(format!("fallback message endpoint {fallback}"));
            }
        }

        let (endpoint, _) = watch::channel(initial);
        Ok(Self {
            shared: Arc::new(Shared {
                server_name: server_name.to_string(),
                http,
                sse_url: sse_url.trim().to_string(),
                headers,
                fallback,
                fallback_in_use: AtomicBool::new(false),
                endpoint,
                pending: PendingTable::new(server_name),
                log,
            }),
            next_id: AtomicU64::new(1),
            stream_started: AtomicBool::new(false),
            stream_task: std::sync::Mutex::new(None),
        })
    }

    /// The endpoint currently in use, if one has been announced or configured.
    pub fn message_endpoint(&self) -> Option<String> {
        match &*self.shared.endpoint.borrow() {
            EndpointState::Ready(url) => Some(url.clone()),
            _ => None,
        }
    }

    /// Send a request and wait for its response on the event stream.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        mode: CallMode,
    ) -> Result<Value, McpError> {
        self.ensure_stream();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = types::request(id, method, params);
        let completion = self.shared.pending.register(id, mode)?;

        let sent = match self.resolve_endpoint().await {
            Ok(endpoint) => self.shared.post(&endpoint, &envelope).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            // Call-level failure: only this entry goes, the stream stays up.
            self.shared.pending.fail(id, e);
        }

        completion.await.map_err(|_| McpError::ConnectionClosed {
            server: self.shared.server_name.clone(),
            reason: "completion dropped".into(),
        })?
    }

    /// POST a notification. The server's reply (if any) is discarded.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.ensure_stream();
        let endpoint = self.resolve_endpoint().await?;
        self.shared.post(&endpoint, &types::notification(method, params)).await
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Stop the event stream and fail whatever is still pending.
    pub async fn shutdown(&self) {
        let handle = self
            .stream_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.terminate("client shut down".into());
    }

    fn ensure_stream(&self) {
        if self
            .stream_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let handle = tokio::spawn(run_stream(Arc::clone(&self.shared)));
        *self
            .stream_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    async fn resolve_endpoint(&self) -> Result<String, McpError> {
        let mut rx = self.shared.endpoint.subscribe();
        let current = rx.borrow_and_update().clone();
        match current {
            EndpointState::Ready(url) => return Ok(url),
            EndpointState::Failed(reason) => return Err(self.shared.closed(reason)),
            EndpointState::Waiting => {}
        }

        let server = self.shared.server_name.clone();
        let announced = async move {
            loop {
                if rx.changed().await.is_err() {
                    return Err(McpError::ConnectionClosed {
                        server,
                        reason: "SSE client dropped".into(),
                    });
                }
                let state = rx.borrow_and_update().clone();
                match state {
                    EndpointState::Ready(url) => return Ok(url),
                    EndpointState::Failed(reason) => {
                        return Err(McpError::ConnectionClosed { server, reason })
                    }
                    EndpointState::Waiting => continue,
                }
            }
        };

        match &self.shared.fallback {
            // A live announcement still takes over: Ready is checked above.
            Some(fallback) if self.shared.fallback_in_use.load(Ordering::Acquire) => {
                Ok(fallback.clone())
            }
            Some(fallback) => match tokio::time::timeout(ENDPOINT_WAIT, announced).await {
                Ok(result) => result,
                Err(_) => {
                    if !self.shared.fallback_in_use.swap(true, Ordering::AcqRel) {
                        self.shared
                            .log
                            .emit(format!("endpoint not announced, using fallback {fallback}"));
                    }
                    Ok(fallback.clone())
                }
            },
            None => announced.await,
        }
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        if let Ok(mut task) = self.stream_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

impl Shared {
    async fn post(&self, endpoint: &str, envelope: &Value) -> Result<(), McpError> {
        let json = serde_json::to_string(envelope).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        self.log.emit(format!(">> {json}"));

        let response = self
            .http
            .post(endpoint)
            .timeout(REQUEST_TIMEOUT)
            .headers(self.headers_with(CONTENT_TYPE, "application/json"))
            .body(json)
            .send()
            .await
            .map_err(|e| {
                self.log.emit(format!("!! POST {endpoint} failed: {e}"));
                McpError::TransportError {
                    server: self.server_name.clone(),
                    reason: format!("POST {endpoint} failed: {e}"),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            self.log
                .emit(format!("!! HTTP {} from {endpoint}", status.as_u16()));
            return Err(McpError::HttpStatus {
                status: status.as_u16(),
                url: endpoint.to_string(),
                body: String::new(),
            });
        }
        Ok(())
    }

    /// Configured headers plus one protocol header that overrides them.
    fn headers_with(&self, name: HeaderName, value: &'static str) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    fn handle_event(&self, payload: &str) {
        self.log.emit(format!("<< {payload}"));

        if payload.starts_with("http://") || payload.starts_with("https://") {
            self.set_endpoint(payload.to_string());
            return;
        }
        if payload.starts_with('/') {
            match self.resolve_relative(payload) {
                Some(url) => self.set_endpoint(url),
                None => self.log.emit(format!("!! cannot resolve endpoint {payload}")),
            }
            return;
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(_) => {
                self.log.emit(format!(".. {payload}"));
                return;
            }
        };

        if !self.has_endpoint() {
            if let Some(raw) = value.get("endpoint").and_then(Value::as_str) {
                let url = if raw.starts_with('/') {
                    self.resolve_relative(raw)
                } else {
                    Some(raw.to_string())
                };
                if let Some(url) = url {
                    self.set_endpoint(url);
                }
                return;
            }
        }

        if let Delivery::Unmatched(id) = self.pending.deliver(value) {
            tracing::debug!(server = %self.server_name, id, "SSE response for unknown request id");
        }
    }

    fn resolve_relative(&self, path: &str) -> Option<String> {
        let base = reqwest::Url::parse(&self.sse_url).ok()?;
        base.join(path).ok().map(String::from)
    }

    fn has_endpoint(&self) -> bool {
        matches!(&*self.endpoint.borrow(), EndpointState::Ready(_))
    }

    /// First endpoint wins; later announcements are ignored.
    fn set_endpoint(&self, url: String) {
        let mut accepted = false;
        self.endpoint.send_if_modified(|state| {
            if matches!(state, EndpointState::Ready(_)) {
                return false;
            }
            *state = EndpointState::Ready(url.clone());
            accepted = true;
            true
        });
        if accepted {
            self.log.emit(format!("message endpoint {url}"));
            tracing::info!(server = %self.server_name, endpoint = %url, "SSE endpoint announced");
        }
    }

    fn terminate(&self, reason: String) {
        let swept = self.pending.close(&reason);
        self.endpoint.send_if_modified(|state| {
            if matches!(state, EndpointState::Waiting) {
                *state = EndpointState::Failed(reason.clone());
                true
            } else {
                false
            }
        });
        tracing::info!(server = %self.server_name, swept, reason = %reason, "SSE stream finished");
    }

    fn closed(&self, reason: String) -> McpError {
        McpError::ConnectionClosed {
            server: self.server_name.clone(),
            reason,
        }
    }
}

// ─── Stream Task ─────────────────────────────────────────────────────────────

async fn run_stream(shared: Arc<Shared>) {
    shared.log.emit(format!("connecting to {}", shared.sse_url));

    let response = shared
        .http
        .get(&shared.sse_url)
        .headers(shared.headers_with(ACCEPT, "text/event-stream"))
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            shared.log.emit(format!("!! SSE connect failed: {e}"));
            shared.terminate(format!("SSE connect failed: {e}"));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        shared
            .log
            .emit(format!("!! HTTP {} from {}: {body}", status.as_u16(), shared.sse_url));
        shared.terminate(format!("HTTP {} from SSE stream", status.as_u16()));
        return;
    }
    shared.log.emit(format!("SSE connected ({})", status.as_u16()));

    let mut lines = ByteLines::new(response);
    let mut parser = SseEventParser::default();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(payload) = parser.push_line(&line) {
                    shared.handle_event(&payload);
                }
            }
            Ok(None) => {
                if let Some(payload) = parser.finish() {
                    shared.handle_event(&payload);
                }
                break "SSE stream ended".to_string();
            }
            Err(e) => {
                shared.log.emit(format!("!! SSE read failed: {e}"));
                break format!("SSE read failed: {e}");
            }
        }
    };

    shared.log.emit(format!("!! {reason}"));
    shared.terminate(reason);
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::log_stream::LogBroadcaster;

    #[test]
    fn test_derive_message_endpoint() {
        assert_eq!(
            derive_message_endpoint("http://localhost:3001/sse").as_deref(),
            Some("http://localhost:3001/message")
        );
        assert_eq!(
            derive_message_endpoint("http://localhost:3001/api/sse/").as_deref(),
            Some("http://localhost:3001/api/message")
        );
        assert_eq!(
            derive_message_endpoint("https://host/sse?token=abc").as_deref(),
            Some("https://host/message?token=abc")
        );
        assert_eq!(derive_message_endpoint("http://localhost:3001/events"), None);
        assert_eq!(derive_message_endpoint("http://localhost:3001/"), None);
        assert_eq!(derive_message_endpoint("not a url"), None);
    }

    #[test]
    fn test_parser_joins_multiline_data() {
        let mut parser = SseEventParser::default();
        assert_eq!(parser.push_line("event: message"), None);
        assert_eq!(parser.push_line("data: {\"id\":1,"), None);
        assert_eq!(parser.push_line("data:\"result\":{}}"), None);
        assert_eq!(
            parser.push_line("").as_deref(),
            Some("{\"id\":1,\n\"result\":{}}")
        );
        // nothing buffered
        assert_eq!(parser.push_line(""), None);
    }

    #[test]
    fn test_parser_ignores_comments_and_flushes_trailing_event() {
        let mut parser = SseEventParser::default();
        assert_eq!(parser.push_line(": keep-alive"), None);
        assert_eq!(parser.push_line("id: 7"), None);
        assert_eq!(parser.push_line("data: /message?sessionId=1"), None);
        assert_eq!(parser.finish().as_deref(), Some("/message?sessionId=1"));
        assert_eq!(parser.finish(), None);
    }

    fn client(sse_url: &str, message_url: Option<&str>) -> (SseClient, Arc<LogBroadcaster>) {
        let logs = LogBroadcaster::new("sse");
        let client = SseClient::new("sse", sse_url, message_url, &HashMap::new(), logs.sink()).unwrap();
        (client, logs)
    }

    #[test]
    fn test_configured_message_url_is_ready_immediately() {
        let (client, _) = client("http://localhost:1/sse", Some("http://localhost:1/rpc"));
        assert_eq!(client.message_endpoint().as_deref(), Some("http://localhost:1/rpc"));
    }

    #[test]
    fn test_endpoint_events_first_wins() {
        let (client, logs) = client("http://localhost:1/base/sse", None);
        assert_eq!(client.message_endpoint(), None);

        client.shared.handle_event("/messages?sessionId=abc");
        assert_eq!(
            client.message_endpoint().as_deref(),
            Some("http://localhost:1/messages?sessionId=abc")
        );

        client.shared.handle_event("http://elsewhere/messages");
        client.shared.handle_event(r#"{"endpoint":"http://other/messages"}"#);
        assert_eq!(
            client.message_endpoint().as_deref(),
            Some("http://localhost:1/messages?sessionId=abc")
        );

        let lines: Vec<String> = logs.snapshot().into_iter().map(|e| e.line).collect();
        assert!(lines.iter().any(|l| l == "fallback message endpoint http://localhost:1/base/message"));
    }

    #[test]
    fn test_json_endpoint_event() {
        let (client, _) = client("http://localhost:1/sse", None);
        client.shared.handle_event(r#"{"endpoint":"/rpc"}"#);
        assert_eq!(client.message_endpoint().as_deref(), Some("http://localhost:1/rpc"));
    }

    #[tokio::test]
    async fn test_response_event_completes_pending_call() {
        let (client, logs) = client("http://localhost:1/sse", None);
        let rx = client.shared.pending.register(4, CallMode::Unwrapped).unwrap();

        client.shared.handle_event("not json at all");
        client
            .shared
            .handle_event(r#"{"jsonrpc":"2.0","id":4,"result":{"tools":[]}}"#);

        assert_eq!(rx.await.unwrap().unwrap(), serde_json::json!({"tools": []}));
        let lines: Vec<String> = logs.snapshot().into_iter().map(|e| e.line).collect();
        assert!(lines.contains(&".. not json at all".to_string()));
    }

    #[tokio::test]
    async fn test_terminate_fails_waiters() {
        let (client, _) = client("http://localhost:1/events", None);
        let rx = client.shared.pending.register(1, CallMode::Unwrapped).unwrap();
        client.shared.terminate("SSE stream ended".into());

        assert!(rx.await.unwrap().unwrap_err().is_transport_fatal());
        let err = client.resolve_endpoint().await.unwrap_err();
        assert!(err.to_string().contains("SSE stream ended"));
    }
}
