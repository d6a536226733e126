//! Shared plumbing for the HTTP-based transports.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client as HttpClient;

use super::errors::McpError;

/// TCP connection timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Total timeout for a single POST.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Build the HTTP client used by one transport instance.
///
/// No total timeout is set on the client itself: the SSE GET stays open for
/// the life of the session. POSTs set [`REQUEST_TIMEOUT`] per request.
pub fn build_client(server: &str) -> Result<HttpClient, McpError> {
    HttpClient::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| McpError::ConfigError {
            reason: format!("failed to build HTTP client for '{server}': {e}"),
        })
}

/// Convert configured headers into a `HeaderMap`, rejecting invalid names/values.
pub fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| McpError::ConfigError {
            reason: format!("invalid header name '{name}': {e}"),
        })?;
        let value = HeaderValue::from_str(value.trim()).map_err(|e| McpError::ConfigError {
            reason: format!("invalid value for header '{name}': {e}"),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Validate a configured URL.
pub fn parse_url(url: &str, what: &str) -> Result<reqwest::Url, McpError> {
    reqwest::Url::parse(url.trim()).map_err(|e| McpError::ConfigError {
        reason: format!("invalid {what} '{url}': {e}"),
    })
}

// ─── Line reader ─────────────────────────────────────────────────────────────

/// Yields `\n`-delimited lines (without `\r\n`) of a streamed response body as
/// chunks arrive. A final unterminated line is returned at end of body.
pub struct ByteLines {
    stream: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    finished: bool,
}

impl ByteLines {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            stream: response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed(),
            buffer: Vec::new(),
            finished: false,
        }
    }

    pub async fn next_line(&mut self) -> reqwest::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.buffer);
                return Ok(Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string()));
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => self.finished = true,
            }
        }
    }
}
