use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use crate::paths;

/// One failed path with its error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub path: String,
    pub error: String,
}

/// Per-path errors accumulated by scans and pulls. Callers are asynchronous,
/// so the journal guards itself.
#[derive(Default)]
pub struct ErrorJournal {
    description: String,
    inner: Mutex<JournalInner>,
}

#[derive(Default)]
struct JournalInner {
    scan: Vec<FileError>,
    pull: Vec<FileError>,
}

impl ErrorJournal {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            inner: Mutex::default(),
        }
    }

    /// Record a scan failure for one item. Duplicate (path, error) pairs
    /// within the same scan are dropped.
    pub fn push_scan(&self, path: impl Into<String>, error: impl Into<String>) {
        let entry = FileError {
            path: path.into(),
            error: error.into(),
        };
        info!(
            folder = %self.description,
            path = %entry.path,
            error = %entry.error,
            "scanner item failed"
        );
        let mut inner = self.inner.lock().expect("error journal poisoned");
        if !inner.scan.contains(&entry) {
            inner.scan.push(entry);
        }
    }

    pub fn push_pull(&self, path: impl Into<String>, error: impl Into<String>) {
        let mut inner = self.inner.lock().expect("error journal poisoned");
        inner.pull.push(FileError {
            path: path.into(),
            error: error.into(),
        });
    }

    pub fn clear_pull(&self) {
        self.inner.lock().expect("error journal poisoned").pull.clear();
    }

    /// Drop scan errors for the given subtrees; an empty list clears all.
    pub fn clear_scan(&self, subs: &[String]) {
        let mut inner = self.inner.lock().expect("error journal poisoned");
        if subs.is_empty() {
            inner.scan.clear();
            return;
        }
        inner.scan.retain(|entry| {
            !subs
                .iter()
                .any(|sub| entry.path == *sub || paths::is_parent(&entry.path, sub))
        });
    }

    /// Scan errors followed by pull errors, sorted by path.
    pub fn all(&self) -> Vec<FileError> {
        let inner = self.inner.lock().expect("error journal poisoned");
        let mut out = Vec::with_capacity(inner.scan.len() + inner.pull.len());
        out.extend(inner.scan.iter().cloned());
        out.extend(inner.pull.iter().cloned());
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }
}
