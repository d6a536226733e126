//! Stdio framing disciplines.
//!
//! Two ways of delimiting JSON messages on a process's stdout:
//! - NDJSON: one message per `\n`-terminated line (trailing `\r` tolerated)
//! - Content-Length: LSP-style `Content-Length: <n>\r\n\r\n<n bytes>`
//!
//! Servers routinely print banners, progress bars, and colored log output on
//! stdout. ANSI escape sequences are stripped and anything that does not look
//! like JSON is surfaced as [`Frame::Noise`] instead of failing the stream.

use std::borrow::Cow;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::errors::McpError;
use super::types::looks_like_json;

/// Upper bound for a single Content-Length body.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Wire discipline used on a stdio connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Ndjson,
    ContentLength,
}

impl Framing {
    /// Parse the configured framing name. Anything unrecognized is NDJSON.
    pub fn from_config(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("content-length") => Framing::ContentLength,
            _ => Framing::Ndjson,
        }
    }

    /// Encode one serialized message for the wire.
    pub fn encode(self, body: &str) -> Vec<u8> {
        match self {
            Framing::Ndjson => {
                let mut out = Vec::with_capacity(body.len() + 1);
                out.extend_from_slice(body.as_bytes());
                out.push(b'\n');
                out
            }
            Framing::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                let mut out = Vec::with_capacity(header.len() + body.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(body.as_bytes());
                out
            }
        }
    }
}

// ─── Frames ──────────────────────────────────────────────────────────────────

/// One unit read off the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A parsed JSON message plus its cleaned text (for the traffic log).
    Message { text: String, value: Value },
    /// Text that does not look like JSON (process chatter).
    Noise(String),
    /// JSON-looking text that failed to parse. Skipped, not fatal.
    Malformed { text: String, reason: String },
}

fn classify_text(cleaned: &str) -> Frame {
    if !looks_like_json(cleaned) {
        return Frame::Noise(cleaned.to_string());
    }
    match serde_json::from_str::<Value>(cleaned) {
        Ok(value) => Frame::Message {
            text: cleaned.to_string(),
            value,
        },
        Err(e) => Frame::Malformed {
            text: cleaned.to_string(),
            reason: e.to_string(),
        },
    }
}

/// Remove ANSI CSI sequences (`ESC [ params letter`).
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    if !text.contains('\x1b') {
        return Cow::Borrowed(text);
    }

    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    let mut copied_up_to = 0;

    while i < bytes.len() {
        if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'[') {
            let mut j = i + 2;
            while j < bytes.len() && (bytes[j].is_ascii_digit() || bytes[j] == b';' || bytes[j] == b'?') {
                j += 1;
            }
            if j < bytes.len() && bytes[j].is_ascii_alphabetic() {
                out.push_str(&text[copied_up_to..i]);
                i = j + 1;
                copied_up_to = i;
                continue;
            }
        }
        i += 1;
    }

    out.push_str(&text[copied_up_to..]);
    Cow::Owned(out)
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Pulls frames off a buffered byte stream using one framing discipline.
pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing) -> Self {
        Self {
            inner,
            framing,
            line: Vec::new(),
        }
    }

    /// Read the next frame. `Ok(None)` means clean end-of-stream.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, McpError> {
        match self.framing {
            Framing::Ndjson => self.next_ndjson().await,
            Framing::ContentLength => self.next_content_length().await,
        }
    }

    async fn next_ndjson(&mut self) -> Result<Option<Frame>, McpError> {
        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(None);
            };
            let cleaned = strip_ansi(&line);
            let trimmed = cleaned.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(classify_text(trimmed)));
        }
    }

    async fn next_content_length(&mut self) -> Result<Option<Frame>, McpError> {
        loop {
            // Skip blank lines between frames.
            let first = loop {
                match self.read_line().await? {
                    None => return Ok(None),
                    Some(l) if l.trim().is_empty() => continue,
                    Some(l) => break l,
                }
            };

            let mut content_length: Option<usize> = None;
            let mut header = Some(first);
            while let Some(line) = header {
                if line.trim().is_empty() {
                    break;
                }
                if let Some(value) = header_value(&line, "content-length") {
                    let parsed = value.parse::<usize>().map_err(|_| McpError::Framing {
                        reason: format!("invalid Content-Length header: '{value}'"),
                    })?;
                    content_length = Some(parsed);
                }
                header = self.read_line().await?;
                if header.is_none() && content_length.is_some() {
                    return Err(McpError::Framing {
                        reason: "stream ended inside a header block".into(),
                    });
                }
            }

            let length = content_length.unwrap_or(0);
            if length == 0 {
                continue;
            }
            if length > MAX_FRAME_BYTES {
                return Err(McpError::Framing {
                    reason: format!("Content-Length {length} exceeds {MAX_FRAME_BYTES} bytes"),
                });
            }

            let mut body = vec![0u8; length];
            self.inner
                .read_exact(&mut body)
                .await
                .map_err(|e| McpError::Framing {
                    reason: format!("stream ended before {length} body bytes were read: {e}"),
                })?;

            let text = String::from_utf8_lossy(&body);
            let cleaned = strip_ansi(&text);
            let trimmed = cleaned.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(classify_text(trimmed)));
        }
    }

    /// Read one `\n`-terminated line without its terminator (and trailing `\r`).
    /// `None` on EOF with nothing buffered.
    async fn read_line(&mut self) -> Result<Option<String>, McpError> {
        self.line.clear();
        let n = self
            .inner
            .read_until(b'\n', &mut self.line)
            .await
            .map_err(|e| McpError::Framing {
                reason: format!("read failed: {e}"),
            })?;
        if n == 0 {
            return Ok(None);
        }
        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.line).into_owned()))
    }
}

/// Case-insensitive header lookup on a single `Name: value` line.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    key.trim()
        .eq_ignore_ascii_case(name)
        .then(|| value.trim())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
