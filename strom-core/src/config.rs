use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strom_model::ShortDeviceId;

/// Default pause between failed pull attempts.
pub const DEFAULT_PULL_PAUSE_SECS: u64 = 60;

/// How a folder participates in synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FolderType {
    SendReceive,
    SendOnly,
    ReceiveOnly,
    ReceiveEncrypted,
}

impl std::fmt::Display for FolderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FolderType::SendReceive => "sendreceive",
            FolderType::SendOnly => "sendonly",
            FolderType::ReceiveOnly => "receiveonly",
            FolderType::ReceiveEncrypted => "receiveencrypted",
        };
        f.write_str(s)
    }
}

/// Immutable descriptor a controller is bound to at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    /// Stable folder id shared between peers.
    pub id: String,
    /// Display label; falls back to the id when empty.
    pub label: String,
    pub folder_type: FolderType,
    pub root: PathBuf,

    /// Interval between timed full rescans; zero disables the timer.
    pub rescan_interval_secs: u64,
    /// Base pause between failed pull attempts; zero means the default.
    pub pull_pause_secs: u64,
    /// Interval between version cleanup runs; zero disables cleanup.
    pub version_cleanup_interval_secs: u64,

    pub fs_watcher_enabled: bool,
    /// Debounce window for collapsing bursts of watcher events.
    pub watch_debounce_ms: u64,
    /// Maximum paths bundled into one watcher batch.
    pub watch_max_batch: usize,

    pub ignore_perms: bool,
    pub auto_normalize: bool,
    /// Tolerance when comparing modification times, for filesystems with
    /// coarse timestamps.
    pub mod_time_window_ns: i64,
    /// Name of the ignore-pattern file inside the folder root.
    pub ignore_file: String,

    /// Flag bits stamped on locally changed entries (receive-only folders
    /// mark their scans with the receive-only bit).
    pub local_flags: u32,
    /// Short id of the local device, stamped on modified entries.
    pub short_id: ShortDeviceId,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            label: String::new(),
            folder_type: FolderType::SendReceive,
            root: PathBuf::new(),
            rescan_interval_secs: 3600,
            pull_pause_secs: 0,
            version_cleanup_interval_secs: 3600,
            fs_watcher_enabled: false,
            watch_debounce_ms: 250,
            watch_max_batch: 1024,
            ignore_perms: false,
            auto_normalize: true,
            mod_time_window_ns: 0,
            ignore_file: ".stromignore".to_string(),
            local_flags: 0,
            short_id: ShortDeviceId::default(),
        }
    }
}

impl FolderConfig {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub fn pull_base_pause(&self) -> Duration {
        if self.pull_pause_secs == 0 {
            Duration::from_secs(DEFAULT_PULL_PAUSE_SECS)
        } else {
            Duration::from_secs(self.pull_pause_secs)
        }
    }

    pub fn version_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.version_cleanup_interval_secs)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms.max(1))
    }

    /// Human-readable handle used in logs.
    pub fn description(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}
