//! Per-server log tail with bounded replay.
//!
//! A [`LogBroadcaster`] keeps the most recent [`MAX_BUFFER_SIZE`] entries and
//! a set of live subscribers. Subscribing replays the buffer snapshot and then
//! joins the live set under the same lock, so a subscriber sees every entry
//! from its snapshot onwards without gaps or duplicates.
//!
//! Publishing never waits on a subscriber: each one has a bounded queue, a
//! full queue drops the entry for that subscriber only, and a closed one is
//! pruned.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Number of entries replayed to a new subscriber.
pub const MAX_BUFFER_SIZE: usize = 200;

/// Per-subscriber queue depth.
const SUBSCRIBER_QUEUE: usize = 1024;

// ─── Entries ─────────────────────────────────────────────────────────────────

/// A timestamped log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

impl LogEntry {
    pub fn now(line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            line: line.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.line
        )
    }
}

// ─── Broadcaster ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    buffer: VecDeque<LogEntry>,
    subscribers: HashMap<Uuid, mpsc::Sender<LogEntry>>,
}

/// Bounded-replay multicast channel for one server's log lines.
pub struct LogBroadcaster {
    server: String,
    inner: Mutex<Inner>,
}

impl LogBroadcaster {
    pub fn new(server: &str) -> Arc<Self> {
        Arc::new(Self {
            server: server.to_string(),
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Append a line stamped with the current time and fan it out.
    pub fn publish(&self, line: impl Into<String>) {
        self.publish_entry(LogEntry::now(line));
    }

    pub fn publish_entry(&self, entry: LogEntry) {
        let mut inner = self.lock();
        inner.buffer.push_back(entry.clone());
        while inner.buffer.len() > MAX_BUFFER_SIZE {
            inner.buffer.pop_front();
        }

        let server = &self.server;
        inner.subscribers.retain(|id, tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(server = %server, subscriber = %id, "log subscriber lagging, entry dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Replay the current buffer, then receive live entries.
    pub fn subscribe(self: &Arc<Self>) -> LogSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE.max(MAX_BUFFER_SIZE));
        let id = Uuid::new_v4();

        let mut inner = self.lock();
        for entry in &inner.buffer {
            // Capacity is at least the buffer size, so replay always fits.
            let _ = tx.try_send(entry.clone());
        }
        inner.subscribers.insert(id, tx);
        drop(inner);

        LogSubscription {
            id,
            rx,
            broadcaster: Arc::downgrade(self),
        }
    }

    /// Copy of the buffered entries, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().buffer.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// A cloneable handle transports use to mirror traffic into this tail.
    pub fn sink(self: &Arc<Self>) -> LogSink {
        LogSink {
            stream: Arc::clone(self),
        }
    }

    fn unsubscribe(&self, id: &Uuid) {
        self.lock().subscribers.remove(id);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ─── Subscription ────────────────────────────────────────────────────────────

/// Live view of a broadcaster. Dropping it unsubscribes.
pub struct LogSubscription {
    id: Uuid,
    rx: mpsc::Receiver<LogEntry>,
    broadcaster: Weak<LogBroadcaster>,
}

impl LogSubscription {
    /// Wait for the next entry. `None` once the broadcaster is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    /// Take an already queued entry without waiting.
    pub fn try_recv(&mut self) -> Option<LogEntry> {
        self.rx.try_recv().ok()
    }
}

impl Stream for LogSubscription {
    type Item = LogEntry;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LogEntry>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unsubscribe(&self.id);
        }
    }
}

// ─── Sink ────────────────────────────────────────────────────────────────────

/// Where transports write traffic lines (`>>` sent, `<<` received, `..` noise,
/// `!!` errors). Lines also go to `tracing` at debug level.
#[derive(Clone)]
pub struct LogSink {
    stream: Arc<LogBroadcaster>,
}

impl LogSink {
    pub fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!(server = %self.stream.server, "{line}");
        self.stream.publish(line);
    }

    pub fn server(&self) -> &str {
        &self.stream.server
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
