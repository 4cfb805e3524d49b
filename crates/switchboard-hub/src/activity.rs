use crate::connections::Connections;
use crate::roster::now_ms;
use std::collections::VecDeque;
use std::sync::Arc;
use switchboard_core::wire::{events, Frame};
use switchboard_core::{LogEntry, LogLevel};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const DEFAULT_TAIL: usize = 500;

/// Bounded ring of operator-facing log lines. Entries are mirrored to
/// `tracing` and pushed to controllers as `log` events.
pub struct ActivityLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
    connections: Arc<Connections>,
}

impl ActivityLog {
    pub fn new(capacity: usize, connections: Arc<Connections>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            connections,
        }
    }

    pub async fn info(&self, msg: impl Into<String>) {
        self.record(LogLevel::Info, msg.into()).await;
    }

    pub async fn warn(&self, msg: impl Into<String>) {
        self.record(LogLevel::Warn, msg.into()).await;
    }

    pub async fn record(&self, level: LogLevel, msg: String) {
        match level {
            LogLevel::Info => info!(event = "activity", msg = %msg),
            LogLevel::Warn => warn!(event = "activity", msg = %msg),
            LogLevel::Error => error!(event = "activity", msg = %msg),
        }
        let entry = LogEntry {
            ts: now_ms(),
            level,
            msg,
        };
        {
            let mut entries = self.entries.lock().await;
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        self.connections
            .broadcast_to_controllers(Frame::from_serializable(events::LOG, &entry))
            .await;
    }

    /// Most recent `limit` entries, oldest first.
    pub async fn tail(&self, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().await;
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
