//! Streamable-HTTP transport.
//!
//! Every message is a POST to a single endpoint and its response carries the
//! reply. Three response shapes are accepted:
//!
//! - `application/x-ndjson` / `jsonlines`: scanned line by line for the
//!   message whose id matches the request; other lines are skipped
//! - `text/event-stream`: scanned event by event the same way
//! - anything else: the whole body is one JSON document (empty means `{}`)
//!
//! If the server assigns an `Mcp-Session-Id`, it is echoed on later requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client as HttpClient;
use serde_json::Value;

use super::errors::McpError;
use super::http::{self, ByteLines, REQUEST_TIMEOUT};
use super::log_stream::LogSink;
use super::sse::SseEventParser;
use super::types::{self, CallMode};

/// Session header assigned by streamable-HTTP servers.
pub const SESSION_HEADER: &str = "mcp-session-id";

const ACCEPT_VALUE: &str = "application/x-ndjson, application/json";

/// Client for one streamable-HTTP server.
pub struct StreamableHttpClient {
    server_name: String,
    http: HttpClient,
    endpoint: String,
    headers: HeaderMap,
    next_id: AtomicU64,
    session_id: Mutex<Option<HeaderValue>>,
    log: LogSink,
}

impl StreamableHttpClient {
    pub fn new(
        server_name: &str,
        url: &str,
        headers: &HashMap<String, String>,
        log: LogSink,
    ) -> Result<Self, McpError> {
        http::parse_url(url, "streamable HTTP URL")?;
        Ok(Self {
            server_name: server_name.to_string(),
            http: http::build_client(server_name)?,
            endpoint: url.trim().to_string(),
            headers: http::header_map(headers)?,
            next_id: AtomicU64::new(1),
            session_id: Mutex::new(None),
            log,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.lock_session()
            .as_ref()
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// POST a request and extract the response with the same id.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        mode: CallMode,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = types::request(id, method, params);
        let message = self.exchange(&envelope, Some(id), method).await?;
        mode.complete(message)
    }

    /// POST a notification. Whatever comes back is logged and dropped.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let envelope = types::notification(method, params);
        match self.exchange(&envelope, None, method).await {
            Ok(_) | Err(McpError::InvalidResponse { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exchange(
        &self,
        envelope: &Value,
        id: Option<u64>,
        method: &str,
    ) -> Result<Value, McpError> {
        let json = serde_json::to_string(envelope).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        self.log.emit(format!(">> {json}"));

        // Configured headers go first; the protocol ones always win.
        let mut headers = self.headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
        let mut request = self
            .http
            .post(&self.endpoint)
            .timeout(REQUEST_TIMEOUT)
            .headers(headers);
        if let Some(session) = self.lock_session().clone() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.body(json).send().await.map_err(|e| {
            self.log.emit(format!("!! POST {} failed: {e}", self.endpoint));
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("POST {} failed: {e}", self.endpoint),
            }
        })?;

        if let Some(session) = response.headers().get(SESSION_HEADER) {
            *self.lock_session() = Some(session.clone());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.log.emit(format!("<< HTTP {} {body}", status.as_u16()));
            return Err(McpError::HttpStatus {
                status: status.as_u16(),
                url: self.endpoint.clone(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.contains("ndjson") || content_type.contains("jsonlines") {
            self.scan_lines(ByteLines::new(response), id, method, false).await
        } else if content_type.contains("text/event-stream") {
            self.scan_lines(ByteLines::new(response), id, method, true).await
        } else {
            self.read_document(response).await
        }
    }

    async fn read_document(&self, response: reqwest::Response) -> Result<Value, McpError> {
        let body = response.text().await.map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;
        let body = body.trim();
        if body.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        self.log.emit(format!("<< {body}"));
        serde_json::from_str(body).map_err(|e| McpError::InvalidResponse {
            reason: format!("response is not JSON: {e}"),
        })
    }

    /// Scan a streamed body for the message answering `id`. With no id
    /// (notifications) the first JSON message is taken.
    async fn scan_lines(
        &self,
        mut lines: ByteLines,
        id: Option<u64>,
        method: &str,
        event_stream: bool,
    ) -> Result<Value, McpError> {
        let mut parser = SseEventParser::default();
        loop {
            let line = lines.next_line().await.map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to read response stream: {e}"),
            })?;
            let text = match line {
                Some(line) if event_stream => match parser.push_line(&line) {
                    Some(payload) => payload,
                    None => continue,
                },
                Some(line) => line,
                None => match parser.finish() {
                    Some(payload) => payload,
                    None => break,
                },
            };
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            self.log.emit(format!("<< {text}"));

            let value: Value = match serde_json::from_str(text) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(server = %self.server_name, error = %e, "skipping unparseable line");
                    continue;
                }
            };
            match id {
                None => return Ok(value),
                Some(id) if value.get("id").and_then(types::parse_id) == Some(id) => {
                    return Ok(value)
                }
                Some(_) => continue,
            }
        }

        match id {
            None => Ok(Value::Object(Default::default())),
            Some(_) => Err(McpError::StreamEnded {
                method: method.to_string(),
            }),
        }
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<HeaderValue>> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
