//! Observability events emitted by folder controllers.
//!
//! Logging is fire-and-forget: the controller never waits on a consumer and
//! never fails because of one.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Sink for controller events. Injected by the host; shared process-wide.
pub trait EventLogger: Send + Sync {
    fn log(&self, event: Event);
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    LocalIndexUpdated(IndexUpdated),
    LocalChangeDetected(DiskChange),
    RemoteChangeDetected(DiskChange),
    FolderWatchStateChanged(WatchStateChanged),
    FolderStateChanged(StateChanged),
    FolderSummary(FolderSummary),
    Failure(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexUpdated {
    pub folder: String,
    pub items: usize,
    pub filenames: Vec<String>,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskChange {
    pub folder: String,
    pub label: String,
    /// `modified` or `deleted`.
    pub action: &'static str,
    /// `file`, `dir` or `symlink`.
    pub kind: &'static str,
    /// Path in native separators.
    pub path: String,
    pub modified_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchStateChanged {
    pub folder: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateChanged {
    pub folder: String,
    pub from: String,
    pub to: String,
    pub duration_secs: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderSummary {
    pub folder: String,
    pub label: String,
    pub sequence: u64,
    pub last_scan: DateTime<Utc>,
}

/// Discards everything.
pub struct NoopLogger;

impl EventLogger for NoopLogger {
    fn log(&self, _event: Event) {}
}

/// Buffers events for inspection; used by tests and the admin surface.
#[derive(Default)]
pub struct CapturingLogger {
    events: Mutex<Vec<Event>>,
}

impl CapturingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event buffer poisoned").clone()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().expect("event buffer poisoned"))
    }
}

impl EventLogger for CapturingLogger {
    fn log(&self, event: Event) {
        self.events.lock().expect("event buffer poisoned").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_as_keyed_maps() {
        let event = Event::LocalChangeDetected(DiskChange {
            folder: "photos".into(),
            label: "Photos".into(),
            action: "deleted",
            kind: "file",
            path: "summer/beach.jpg".into(),
            modified_by: "00000000000AB1DE".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "LocalChangeDetected");
        assert_eq!(json["data"]["folder"], "photos");
        assert_eq!(json["data"]["action"], "deleted");
        assert_eq!(json["data"]["path"], "summer/beach.jpg");
    }

    #[test]
    fn capturing_logger_takes_its_buffer() {
        let logger = CapturingLogger::new();
        logger.log(Event::Failure("boom".into()));
        assert_eq!(logger.events().len(), 1);
        assert_eq!(logger.take().len(), 1);
        assert!(logger.events().is_empty());
    }
}
