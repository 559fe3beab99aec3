use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Scan statistics kept per folder.
#[derive(Default)]
pub struct FolderStats {
    inner: Mutex<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    last_scan: Option<DateTime<Utc>>,
    scans: u64,
}

impl FolderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan_completed(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("folder stats poisoned");
        inner.last_scan = Some(now);
        inner.scans += 1;
        now
    }

    pub fn last_scan(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().expect("folder stats poisoned").last_scan
    }

    pub fn completed_scans(&self) -> u64 {
        self.inner.lock().expect("folder stats poisoned").scans
    }
}
