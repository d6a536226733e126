//! Pending request table: correlates outgoing call ids to completion handles.
//!
//! One map from id to a tagged completion ([`CallMode`]). Every entry is
//! consumed exactly once: by a delivered response, by a call-level failure,
//! or by the connection-wide sweep when the read side terminates. After a
//! sweep the table is closed and refuses new registrations, so a call issued
//! on a dead connection fails immediately instead of waiting forever.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use super::errors::McpError;
use super::types::{CallMode, Incoming};

/// Receiving half of a pending call.
pub type Completion = oneshot::Receiver<Result<Value, McpError>>;

struct PendingCall {
    mode: CallMode,
    tx: oneshot::Sender<Result<Value, McpError>>,
}

#[derive(Default)]
struct TableState {
    calls: HashMap<u64, PendingCall>,
    /// Set once by [`PendingTable::close`]; the reason new calls are refused.
    closed: Option<String>,
}

/// Outcome of offering a message to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A pending call was found and completed.
    Completed(u64),
    /// The message is a response, but no call is waiting for its id.
    Unmatched(u64),
    /// The message is not a response (notification, server request, ...).
    NotAResponse,
}

/// Thread-safe pending call table shared by a writer and a read loop.
pub struct PendingTable {
    server: String,
    state: Mutex<TableState>,
}

impl PendingTable {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            state: Mutex::new(TableState::default()),
        }
    }

    /// Register a call. Fails if the table has been closed.
    pub fn register(&self, id: u64, mode: CallMode) -> Result<Completion, McpError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(McpError::ConnectionClosed {
                server: self.server.clone(),
                reason: reason.clone(),
            });
        }
        debug_assert!(!state.calls.contains_key(&id), "call id {id} registered twice");
        state.calls.insert(id, PendingCall { mode, tx });
        Ok(rx)
    }

    /// Route a response envelope to the call waiting for its id.
    ///
    /// A receiver that was dropped (caller timed out) simply discards the value.
    pub fn deliver(&self, message: Value) -> Delivery {
        let Some(id) = Incoming::classify(&message).response_id() else {
            return Delivery::NotAResponse;
        };
        let call = self.lock().calls.remove(&id);
        match call {
            Some(call) => {
                let _ = call.tx.send(call.mode.complete(message));
                Delivery::Completed(id)
            }
            None => Delivery::Unmatched(id),
        }
    }

    /// Fail a single call (call-level error). No-op if already consumed.
    pub fn fail(&self, id: u64, error: McpError) {
        let call = self.lock().calls.remove(&id);
        if let Some(call) = call {
            let _ = call.tx.send(Err(error));
        }
    }

    /// Drop a call without completing it (its caller already gave up).
    pub fn forget(&self, id: u64) {
        self.lock().calls.remove(&id);
    }

    /// Fail every pending call, clear the table, and refuse new calls.
    ///
    /// Returns how many calls were swept. Only the first close reason sticks.
    pub fn close(&self, reason: &str) -> usize {
        let drained: Vec<PendingCall> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.calls.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.tx.send(Err(McpError::ConnectionClosed {
                server: self.server.clone(),
                reason: reason.to_string(),
            }));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        // A panic while holding this lock cannot leave the map half-updated,
        // so recover the guard instead of propagating the poison.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
