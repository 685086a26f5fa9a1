// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-event log streams.
//!
//! Every task writes its progress to a [`Logger`] obtained from an
//! [`EventLogManager`] by event ID. The logger must be handed back with
//! [`EventLogManager::release_logger`] when the task ends; [`LoggerLease`]
//! does that on drop so no exit path can skip it.
//!
//! Attributes follow a small vocabulary consumed by the API layer:
//!
//! | Key | Values |
//! |-----|--------|
//! | `step` | `builder-exector`, `code-version`, `progress`, `callback`, `last` |
//! | `status` | `starting`, `success`, `failure` |

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use kiln_core::persistence::{EventLogRecord, Persistence};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Log entry attributes.
pub type Attributes = BTreeMap<String, String>;

/// Build an attribute map from literal pairs.
pub fn attrs<const N: usize>(pairs: [(&str, &str); N]) -> Attributes {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Progress visible to users.
    Info,
    /// Failure visible to users.
    Error,
    /// Verbose output (command output, transfer progress).
    Debug,
}

impl LogLevel {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }
}

/// Append-only log stream of one event.
pub trait Logger: Send + Sync {
    /// Event the stream belongs to.
    fn event_id(&self) -> &str;

    /// Append one entry.
    fn log(&self, level: LogLevel, message: &str, attributes: Attributes);

    /// Append an info entry.
    fn info(&self, message: &str, attributes: Attributes) {
        self.log(LogLevel::Info, message, attributes);
    }

    /// Append an error entry.
    fn error(&self, message: &str, attributes: Attributes) {
        self.log(LogLevel::Error, message, attributes);
    }

    /// Append a debug entry.
    fn debug(&self, message: &str, attributes: Attributes) {
        self.log(LogLevel::Debug, message, attributes);
    }

    /// Stop accepting entries. Called by the manager on release.
    fn close(&self) {}
}

/// Hands out and takes back loggers.
pub trait EventLogManager: Send + Sync {
    /// Open the log stream of an event.
    fn get_logger(&self, event_id: &str) -> Arc<dyn Logger>;

    /// Close a stream obtained from [`get_logger`](Self::get_logger).
    fn release_logger(&self, logger: Arc<dyn Logger>);
}

/// Releases a logger when dropped.
pub struct LoggerLease {
    manager: Arc<dyn EventLogManager>,
    logger: Option<Arc<dyn Logger>>,
}

impl LoggerLease {
    /// Open a logger for `event_id` that is released when the lease drops.
    pub fn acquire(manager: Arc<dyn EventLogManager>, event_id: &str) -> Self {
        let logger = manager.get_logger(event_id);
        Self {
            manager,
            logger: Some(logger),
        }
    }

    /// Wrap a logger that was already obtained from `manager`.
    pub fn wrap(manager: Arc<dyn EventLogManager>, logger: Arc<dyn Logger>) -> Self {
        Self {
            manager,
            logger: Some(logger),
        }
    }

    /// The leased logger.
    pub fn logger(&self) -> Arc<dyn Logger> {
        match &self.logger {
            Some(logger) => logger.clone(),
            None => Arc::new(NullLogger),
        }
    }
}

impl Drop for LoggerLease {
    fn drop(&mut self) {
        if let Some(logger) = self.logger.take() {
            self.manager.release_logger(logger);
        }
    }
}

struct NullLogger;

impl Logger for NullLogger {
    fn event_id(&self) -> &str {
        ""
    }

    fn log(&self, _level: LogLevel, _message: &str, _attributes: Attributes) {}
}

// ============================================================================
// Persisted logger
// ============================================================================

/// Logger that appends entries to the store in order.
///
/// Entries are queued on a channel drained by a dedicated writer task, so
/// logging never blocks the caller. Every entry is also mirrored to `tracing`.
pub struct PersistedLogger {
    event_id: String,
    sender: Mutex<Option<mpsc::UnboundedSender<EventLogRecord>>>,
}

impl Logger for PersistedLogger {
    fn event_id(&self) -> &str {
        &self.event_id
    }

    fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    fn log(&self, level: LogLevel, message: &str, attributes: Attributes) {
        let step = attributes.get("step").cloned();
        let status = attributes.get("status").cloned();

        match level {
            LogLevel::Error => tracing::warn!(
                event_id = %self.event_id,
                step = step.as_deref().unwrap_or(""),
                status = status.as_deref().unwrap_or(""),
                "{}",
                message
            ),
            LogLevel::Info => tracing::info!(
                event_id = %self.event_id,
                step = step.as_deref().unwrap_or(""),
                status = status.as_deref().unwrap_or(""),
                "{}",
                message
            ),
            LogLevel::Debug => tracing::debug!(
                event_id = %self.event_id,
                step = step.as_deref().unwrap_or(""),
                "{}",
                message
            ),
        }

        let record = EventLogRecord {
            id: None,
            event_id: self.event_id.clone(),
            level: level.as_str().to_string(),
            message: message.to_string(),
            step,
            status,
            attributes: serde_json::to_string(&attributes).unwrap_or_else(|_| "{}".to_string()),
            created_at: Utc::now(),
        };

        let sent = match self.sender.lock() {
            Ok(sender) => sender.as_ref().map(|tx| tx.send(record).is_ok()),
            Err(_) => None,
        };
        if sent != Some(true) {
            debug!(event_id = %self.event_id, "Log entry dropped, logger already released");
        }
    }
}

/// [`EventLogManager`] writing to a [`Persistence`] store.
pub struct PersistedEventLogManager {
    store: Arc<dyn Persistence>,
    writers: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistedEventLogManager {
    /// Create a manager writing into `store`.
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self {
            store,
            writers: Mutex::new(Vec::new()),
        }
    }

    /// Wait until every released logger has written its queued entries.
    ///
    /// Loggers that are still held keep their writers alive; call this after
    /// the tasks using them have finished.
    pub async fn flush(&self) {
        let writers: Vec<JoinHandle<()>> = match self.writers.lock() {
            Ok(mut writers) => writers.drain(..).collect(),
            Err(_) => return,
        };
        for writer in writers {
            if let Err(e) = writer.await {
                warn!(error = %e, "Event log writer panicked");
            }
        }
    }
}

impl EventLogManager for PersistedEventLogManager {
    fn get_logger(&self, event_id: &str) -> Arc<dyn Logger> {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventLogRecord>();
        let store = self.store.clone();
        let writer = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = store.append_event_log(&record).await {
                    warn!(
                        event_id = %record.event_id,
                        error = %e,
                        "Failed to persist event log entry"
                    );
                }
            }
        });

        if let Ok(mut writers) = self.writers.lock() {
            writers.retain(|w| !w.is_finished());
            writers.push(writer);
        }

        Arc::new(PersistedLogger {
            event_id: event_id.to_string(),
            sender: Mutex::new(Some(tx)),
        })
    }

    fn release_logger(&self, logger: Arc<dyn Logger>) {
        // The writer drains what is queued, then exits.
        debug!(event_id = %logger.event_id(), "Releasing event logger");
        logger.close();
    }
}

// ============================================================================
// Recording logger
// ============================================================================

/// One entry captured by [`RecordingEventLogManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEntry {
    /// Event the entry was written to.
    pub event_id: String,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Attributes.
    pub attributes: Attributes,
}

impl RecordedEntry {
    /// Value of an attribute.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[derive(Default)]
struct Recording {
    entries: Vec<RecordedEntry>,
    acquired: usize,
    released: usize,
}

/// In-memory [`EventLogManager`] for tests.
#[derive(Default, Clone)]
pub struct RecordingEventLogManager {
    inner: Arc<Mutex<Recording>>,
}

struct RecordingLogger {
    event_id: String,
    inner: Arc<Mutex<Recording>>,
}

impl Logger for RecordingLogger {
    fn event_id(&self) -> &str {
        &self.event_id
    }

    fn log(&self, level: LogLevel, message: &str, attributes: Attributes) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.push(RecordedEntry {
                event_id: self.event_id.clone(),
                level,
                message: message.to_string(),
                attributes,
            });
        }
    }
}

impl RecordingEventLogManager {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, in write order.
    pub fn entries(&self) -> Vec<RecordedEntry> {
        self.inner
            .lock()
            .map(|i| i.entries.clone())
            .unwrap_or_default()
    }

    /// Entries of one event, in write order.
    pub fn entries_for(&self, event_id: &str) -> Vec<RecordedEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.event_id == event_id)
            .collect()
    }

    /// Entries of one event tagged with the given step and status.
    pub fn tagged(&self, event_id: &str, step: &str, status: &str) -> Vec<RecordedEntry> {
        self.entries_for(event_id)
            .into_iter()
            .filter(|e| e.attr("step") == Some(step) && e.attr("status") == Some(status))
            .collect()
    }

    /// Number of loggers handed out.
    pub fn acquired(&self) -> usize {
        self.inner.lock().map(|i| i.acquired).unwrap_or_default()
    }

    /// Number of loggers handed back.
    pub fn released(&self) -> usize {
        self.inner.lock().map(|i| i.released).unwrap_or_default()
    }
}

impl EventLogManager for RecordingEventLogManager {
    fn get_logger(&self, event_id: &str) -> Arc<dyn Logger> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.acquired += 1;
        }
        Arc::new(RecordingLogger {
            event_id: event_id.to_string(),
            inner: self.inner.clone(),
        })
    }

    fn release_logger(&self, _logger: Arc<dyn Logger>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.released += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::persistence::SqlitePersistence;

    #[test]
    fn test_attrs_builds_map() {
        let a = attrs([("step", "callback"), ("status", "failure")]);
        assert_eq!(a.get("step").map(String::as_str), Some("callback"));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let manager = RecordingEventLogManager::new();
        {
            let lease = LoggerLease::acquire(Arc::new(manager.clone()), "e1");
            lease.logger().info("hello", attrs([("step", "builder-exector")]));
            assert_eq!(manager.acquired(), 1);
            assert_eq!(manager.released(), 0);
        }
        assert_eq!(manager.released(), 1);
        assert_eq!(manager.entries_for("e1").len(), 1);
    }

    #[tokio::test]
    async fn test_persisted_logger_writes_in_order() {
        let store: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let manager = PersistedEventLogManager::new(store.clone());

        let logger = manager.get_logger("e1");
        logger.info("Start build", attrs([("step", "builder-exector"), ("status", "starting")]));
        logger.debug("Step 1/3", attrs([("step", "progress")]));
        logger.error("Build failed", attrs([("step", "callback"), ("status", "failure")]));
        manager.release_logger(logger);
        manager.flush().await;

        let logs = store.list_event_logs("e1").await.unwrap();
        let levels: Vec<_> = logs.iter().map(|l| l.level.as_str()).collect();
        assert_eq!(levels, vec!["info", "debug", "error"]);
        assert_eq!(logs[2].step.as_deref(), Some("callback"));
        assert_eq!(logs[2].status.as_deref(), Some("failure"));
        assert!(logs[0].attributes.contains("starting"));
    }
}
