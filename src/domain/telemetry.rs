//! Telemetry log
//!
//! Append-only record of everything observable the engine does: decoded
//! notifications, command echoes, informational and error messages. Only the
//! most recent entries are retained; identifiers are never reused.

use crate::domain::models::{AppEvent, ConnectionState};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Number of entries kept before the oldest are dropped
pub const DEFAULT_LOG_CAPACITY: usize = 200;

/// Classification of one log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryFrame {
    /// Notification carrying a spell name; `hex` is the full payload dump
    Spell { name: String, hex: String },
    /// Undecoded payload, tagged with its characteristic when sniffed
    Raw {
        hex: String,
        characteristic: Option<Uuid>,
    },
    Info(String),
    Error(String),
    /// Bytes written to the wand
    CommandEcho { description: String, hex: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    /// Capture time, Unix milliseconds
    pub timestamp_ms: i64,
    pub frame: TelemetryFrame,
}

#[derive(Debug)]
pub struct TelemetryLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_id: u64,
}

impl Default for TelemetryLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl TelemetryLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    pub fn append(&mut self, frame: TelemetryFrame) -> LogEntry {
        let entry = LogEntry {
            id: self.next_id,
            timestamp_ms: now_millis(),
            frame,
        };
        self.next_id += 1;

        self.entries.push_back(entry.clone());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        entry
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Shared output side of the engine: the telemetry log plus the event
/// channel the presentation layer listens on.
#[derive(Debug, Clone)]
pub struct EventSink {
    events: mpsc::UnboundedSender<AppEvent>,
    log: Arc<Mutex<TelemetryLog>>,
}

impl EventSink {
    pub fn new(events: mpsc::UnboundedSender<AppEvent>, capacity: usize) -> Self {
        Self {
            events,
            log: Arc::new(Mutex::new(TelemetryLog::with_capacity(capacity))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TelemetryLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, frame: TelemetryFrame) -> LogEntry {
        let entry = self.lock().append(frame);
        let _ = self.events.send(AppEvent::Telemetry(entry.clone()));
        entry
    }

    pub fn info(&self, message: impl Into<String>) -> LogEntry {
        self.record(TelemetryFrame::Info(message.into()))
    }

    pub fn error(&self, message: impl Into<String>) -> LogEntry {
        self.record(TelemetryFrame::Error(message.into()))
    }

    pub fn connection_state(&self, state: ConnectionState) {
        let _ = self.events.send(AppEvent::ConnectionState(state));
    }

    pub fn sniffer_state(&self, state: ConnectionState) {
        let _ = self.events.send(AppEvent::SnifferState(state));
    }

    /// Copy of the retained entries, oldest first
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().entries().cloned().collect()
    }
}
