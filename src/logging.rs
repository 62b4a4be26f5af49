//! In-memory log stream shared by the coordinator, the socket and the session.

use std::{collections::VecDeque, sync::Arc, time::SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::protocol::Severity;

/// Amount of entries kept when no capacity is configured.
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Listener channel depth, slow listeners skip entries instead of blocking writers.
const LISTENER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: u64,
    pub severity: Severity,
    pub message: String,
    pub time: SystemTime,
}

struct Ring {
    next_id: u64,
    entries: VecDeque<LogEntry>,
}

/// Capped ring buffer of the most recent log entries plus a set of listeners.
///
/// Every entry is also forwarded to the `log` facade. Cloning yields another
/// handle to the same sink.
#[derive(Clone)]
pub struct LogSink {
    ring: Arc<Mutex<Ring>>,
    capacity: usize,
    listeners: broadcast::Sender<LogEntry>,
}

impl LogSink {
    /// Creates a new `LogSink`.
    ///
    /// # Arguments
    /// * `capacity` - The maximum amount of entries retained, at least one.
    ///
    /// # Returns
    /// A new `LogSink` instance.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (listeners, _) = broadcast::channel(LISTENER_CAPACITY);

        Self {
            ring: Arc::new(Mutex::new(Ring {
                next_id: 0,
                entries: VecDeque::with_capacity(capacity),
            })),
            capacity,
            listeners,
        }
    }

    /// Records a new entry, evicting the oldest one when full.
    ///
    /// # Returns
    /// The id assigned to the entry.
    pub fn insert(&self, message: impl Into<String>, severity: Severity) -> u64 {
        let message = message.into();

        match severity {
            Severity::Info => log::info!("{message}"),
            Severity::Warning => log::warn!("{message}"),
            Severity::Error => log::error!("{message}"),
        }

        let entry = {
            let mut ring = self.ring.lock();
            let entry = LogEntry {
                id: ring.next_id,
                severity,
                message,
                time: SystemTime::now(),
            };

            ring.next_id += 1;
            if ring.entries.len() == self.capacity {
                ring.entries.pop_front();
            }

            ring.entries.push_back(entry.clone());
            entry
        };

        let id = entry.id;
        // No listeners is fine.
        let _ = self.listeners.send(entry);
        id
    }

    /// Shorthand for an `Info` entry.
    pub fn info(&self, message: impl Into<String>) -> u64 {
        self.insert(message, Severity::Info)
    }

    /// Shorthand for a `Warning` entry.
    pub fn warn(&self, message: impl Into<String>) -> u64 {
        self.insert(message, Severity::Warning)
    }

    /// Shorthand for an `Error` entry.
    pub fn error(&self, message: impl Into<String>) -> u64 {
        self.insert(message, Severity::Error)
    }

    /// Registers a new listener, it only sees entries inserted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.listeners.subscribe()
    }

    /// A snapshot of the retained entries, oldest first.
    pub fn recent(&self) -> Vec<LogEntry> {
        self.ring.lock().entries.iter().cloned().collect()
    }

    /// Amount of retained entries with the given severity.
    pub fn count(&self, severity: Severity) -> usize {
        self.ring
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.severity == severity)
            .count()
    }

    /// Drops every retained entry, ids keep increasing.
    pub fn clear(&self) {
        self.ring.lock().entries.clear();
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

/// Initializes `env_logger` for hosts embedding the client, `RUST_LOG` overrides
/// the default `info` filter. Calling it more than once is harmless.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env).try_init();
}
