use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::events::{Event, EventLogger, StateChanged};

/// Coarse folder state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FolderState {
    Idle,
    Scanning,
    ScanWaiting,
    SyncWaiting,
    Syncing,
    CleanWaiting,
    Cleaning,
    Error,
}

impl fmt::Display for FolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FolderState::Idle => "idle",
            FolderState::Scanning => "scanning",
            FolderState::ScanWaiting => "scan-waiting",
            FolderState::SyncWaiting => "sync-waiting",
            FolderState::Syncing => "syncing",
            FolderState::CleanWaiting => "clean-waiting",
            FolderState::Cleaning => "cleaning",
            FolderState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Tracks the folder's coarse state and the latest sticky error. While an
/// error is latched, plain state changes are ignored; only clearing the error
/// leaves the `Error` state.
pub struct StateTracker {
    folder_id: String,
    logger: Arc<dyn EventLogger>,
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    current: FolderState,
    err: Option<String>,
    changed: DateTime<Utc>,
}

impl StateTracker {
    pub fn new(folder_id: impl Into<String>, logger: Arc<dyn EventLogger>) -> Self {
        Self {
            folder_id: folder_id.into(),
            logger,
            inner: Mutex::new(TrackerInner {
                current: FolderState::Idle,
                err: None,
                changed: Utc::now(),
            }),
        }
    }

    pub fn state(&self) -> (FolderState, DateTime<Utc>, Option<String>) {
        let inner = self.inner.lock().expect("state tracker poisoned");
        (inner.current, inner.changed, inner.err.clone())
    }

    pub fn set_state(&self, to: FolderState) {
        let mut inner = self.inner.lock().expect("state tracker poisoned");
        if inner.err.is_some() || inner.current == to || to == FolderState::Error {
            return;
        }
        self.transition(&mut inner, to, None);
    }

    /// Latch or clear the sticky error. Setting the same error text twice is
    /// a no-op; clearing returns the folder to `Idle`.
    pub fn set_error(&self, err: Option<String>) {
        let mut inner = self.inner.lock().expect("state tracker poisoned");
        if inner.err == err {
            return;
        }
        match err {
            Some(text) => {
                inner.err = Some(text.clone());
                self.transition(&mut inner, FolderState::Error, Some(text));
            }
            None => {
                inner.err = None;
                if inner.current == FolderState::Error {
                    self.transition(&mut inner, FolderState::Idle, None);
                }
            }
        }
    }

    fn transition(&self, inner: &mut TrackerInner, to: FolderState, error: Option<String>) {
        let from = inner.current;
        let now = Utc::now();
        let duration = (now - inner.changed).num_milliseconds() as f64 / 1000.0;
        inner.current = to;
        inner.changed = now;
        self.logger.log(Event::FolderStateChanged(StateChanged {
            folder: self.folder_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            duration_secs: duration,
            error,
        }));
    }
}

/// Log the error transition the way the user sees it: a warning for a fresh
/// error, an info line when it changes or clears.
pub(crate) fn log_error_transition(description: &str, old: Option<&str>, new: Option<&str>) {
    match (old, new) {
        (None, Some(err)) => warn!(folder = description, error = err, "folder error"),
        (Some(old), Some(new)) if old != new => {
            info!(folder = description, from = old, to = new, "folder error changed")
        }
        (Some(_), None) => info!(folder = description, "cleared folder error"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CapturingLogger;

    fn tracker() -> (Arc<CapturingLogger>, StateTracker) {
        let logger = Arc::new(CapturingLogger::new());
        let tracker = StateTracker::new("f1", Arc::clone(&logger) as Arc<dyn EventLogger>);
        (logger, tracker)
    }

    #[test]
    fn plain_transitions_emit_events() {
        let (logger, tracker) = tracker();
        tracker.set_state(FolderState::Scanning);
        tracker.set_state(FolderState::Scanning);
        tracker.set_state(FolderState::Idle);
        let events = logger.events();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn same_error_twice_is_a_noop() {
        let (logger, tracker) = tracker();
        tracker.set_error(Some("disk gone".into()));
        tracker.set_error(Some("disk gone".into()));
        assert_eq!(logger.events().len(), 1);
        assert_eq!(tracker.state().0, FolderState::Error);
    }

    #[test]
    fn sticky_error_blocks_state_changes_until_cleared() {
        let (_, tracker) = tracker();
        tracker.set_error(Some("disk gone".into()));
        tracker.set_state(FolderState::Scanning);
        assert_eq!(tracker.state().0, FolderState::Error);
        tracker.set_error(None);
        assert_eq!(tracker.state().0, FolderState::Idle);
        tracker.set_state(FolderState::Scanning);
        assert_eq!(tracker.state().0, FolderState::Scanning);
    }
}
