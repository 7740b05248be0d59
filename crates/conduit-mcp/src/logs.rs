//! Per-server diagnostic log buffers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Entries kept per server before the oldest are evicted.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Origin of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Non-protocol output on the server's stdout.
    Stdout,
    /// The server's stderr.
    Stderr,
    /// Failures seen by the connection layer.
    Error,
    /// Protocol traffic worth keeping (notifications, server requests).
    Protocol,
    /// Lifecycle messages from the connection layer itself.
    System,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Stdout => "stdout",
            LogKind::Stderr => "stderr",
            LogKind::Error => "error",
            LogKind::Protocol => "protocol",
            LogKind::System => "system",
        }
    }
}

/// One recorded line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: u64,
    pub server_id: String,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Fixed-capacity FIFO buffers, one per server.
#[derive(Debug)]
pub struct LogRecorder {
    capacity: usize,
    next_id: AtomicU64,
    buffers: Mutex<HashMap<String, VecDeque<LogEntry>>>,
}

impl Default for LogRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<String, VecDeque<LogEntry>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry, evicting the oldest once the buffer is full.
    pub fn record(
        &self,
        server_id: &str,
        kind: LogKind,
        message: impl Into<String>,
        payload: Option<Value>,
    ) -> LogEntry {
        let entry = LogEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            server_id: server_id.to_string(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            payload,
        };
        if self.capacity == 0 {
            return entry;
        }

        let mut buffers = self.buffers();
        let buffer = buffers.entry(server_id.to_string()).or_default();
        while buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(entry.clone());
        entry
    }

    /// Entries for a server, oldest first.
    pub fn entries(&self, server_id: &str) -> Vec<LogEntry> {
        self.buffers()
            .get(server_id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all entries for a server. Returns how many were removed.
    pub fn clear(&self, server_id: &str) -> usize {
        self.buffers()
            .remove(server_id)
            .map(|b| b.len())
            .unwrap_or(0)
    }
}
