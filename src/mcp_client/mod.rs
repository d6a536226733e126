//! MCP Client: launch, connect to, and drive MCP servers.
//!
//! This module handles:
//! - JSON-RPC 2.0 envelopes and stdio framing (NDJSON and Content-Length)
//! - Stdio, SSE, and streamable-HTTP transports behind one [`McpClient`]
//! - Correlating concurrent calls with their responses
//! - Server process lifecycle (spawn, stderr capture, exit eviction, stop)
//! - Per-server log tails with bounded replay
//! - The inspection workflow (connect, probe facets, invoke)

pub mod client;
pub mod config;
pub mod errors;
pub mod framing;
pub mod http;
pub mod inspect;
pub mod lifecycle;
pub mod log_stream;
pub mod pending;
pub mod sessions;
pub mod sse;
pub mod streamable;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::McpClient;
pub use config::{ServerCatalog, ServerConfig, ServersConfig, TransportKind};
pub use errors::McpError;
pub use framing::Framing;
pub use log_stream::{LogBroadcaster, LogEntry, LogSubscription};
pub use sessions::{ServerSession, SessionManager, SessionState};
pub use types::CallMode;
