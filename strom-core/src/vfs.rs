//! Filesystem abstraction consumed by the controller.
//!
//! The controller never touches the disk directly; everything goes through
//! this trait so tests and exotic backends can substitute their own
//! implementation. `RealFs` is the tokio + notify backed default, `MemFs` is
//! the in-memory fake with scriptable watch behavior.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::ignore::IgnoreMatcher;
use crate::paths;

/// Failure reported by a running watch subscription.
#[derive(Debug, Clone)]
pub enum WatchFault {
    /// The event stream broke and has to be re-established.
    Stream(String),
    /// The backend delivered an event for a path outside the folder root.
    OutsideRoot(String),
}

impl WatchFault {
    pub fn message(&self) -> String {
        match self {
            WatchFault::Stream(msg) => msg.clone(),
            WatchFault::OutsideRoot(path) => {
                format!("event outside folder root: {path}")
            }
        }
    }
}

/// Live watch subscription: folder-relative changed paths plus faults.
pub struct WatchStreams {
    pub events: mpsc::Receiver<String>,
    pub faults: mpsc::Receiver<WatchFault>,
}

#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Folder root exists and is a directory.
    async fn check_root(&self) -> Result<()>;

    /// Subscribe to change notifications below the root. Paths matching the
    /// ignore patterns are filtered out before delivery. The subscription
    /// ends when `token` is cancelled.
    async fn watch(
        &self,
        matcher: Arc<dyn IgnoreMatcher>,
        token: CancellationToken,
        ignore_perms: bool,
    ) -> Result<WatchStreams>;

    /// Names of the direct children of a folder-relative directory.
    async fn dir_names(&self, rel: &str) -> Result<Vec<String>>;

    async fn remove(&self, rel: &str) -> Result<()>;

    /// Whether the path is gone from disk. Robust against the corner cases a
    /// plain stat misses (parent replaced by a file or symlink, permission
    /// holes): those count as deleted too.
    async fn is_deleted(&self, rel: &str) -> bool;
}

/// Disk-backed filesystem rooted at the folder path.
pub struct RealFs {
    root: PathBuf,
}

impl RealFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn join(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }
}

#[async_trait]
impl Filesystem for RealFs {
    async fn check_root(&self) -> Result<()> {
        match tokio::fs::metadata(&self.root).await {
            Ok(md) if md.is_dir() => Ok(()),
            _ => Err(SyncError::PathMissing(self.root.display().to_string())),
        }
    }

    async fn watch(
        &self,
        matcher: Arc<dyn IgnoreMatcher>,
        token: CancellationToken,
        _ignore_perms: bool,
    ) -> Result<WatchStreams> {
        let (event_tx, events) = mpsc::channel::<String>(1024);
        let (fault_tx, faults) = mpsc::channel::<WatchFault>(16);
        let root = self.root.clone();

        let watcher = spawn_blocking(move || -> Result<RecommendedWatcher> {
            let cb_root = root.clone();
            let mut watcher = RecommendedWatcher::new(
                move |res: std::result::Result<notify::Event, notify::Error>| match res {
                    Ok(event) => {
                        for path in event.paths {
                            match path.strip_prefix(&cb_root) {
                                Ok(rel) => {
                                    let rel = rel.to_string_lossy().replace('\\', "/");
                                    if rel.is_empty() || matcher.is_ignored(&rel) {
                                        continue;
                                    }
                                    let _ = event_tx.blocking_send(rel);
                                }
                                Err(_) => {
                                    let _ = fault_tx.blocking_send(WatchFault::OutsideRoot(
                                        path.display().to_string(),
                                    ));
                                }
                            }
                        }
                    }
                    Err(err) => {
                        let _ = fault_tx.blocking_send(WatchFault::Stream(err.to_string()));
                    }
                },
                notify::Config::default(),
            )
            .map_err(|err| SyncError::Watch(err.to_string()))?;
            watcher
                .watch(&root, RecursiveMode::Recursive)
                .map_err(|err| SyncError::Watch(err.to_string()))?;
            Ok(watcher)
        })
        .await
        .map_err(|err| SyncError::Watch(format!("watcher init panicked: {err}")))??;

        // The subscription lives as long as the watcher; drop it on cancel.
        tokio::spawn(async move {
            token.cancelled().await;
            drop(watcher);
        });

        Ok(WatchStreams { events, faults })
    }

    async fn dir_names(&self, rel: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(self.join(rel)).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn remove(&self, rel: &str) -> Result<()> {
        let path = self.join(rel);
        let md = tokio::fs::symlink_metadata(&path).await?;
        if md.is_dir() {
            tokio::fs::remove_dir(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn is_deleted(&self, rel: &str) -> bool {
        match tokio::fs::symlink_metadata(self.join(rel)).await {
            Ok(_) => false,
            Err(err) => matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ),
        }
    }
}

/// In-memory filesystem with scriptable watch behavior.
///
/// Entries are folder-relative names; watch subscriptions hand the test a rig
/// it can push events and faults through.
#[derive(Default)]
pub struct MemFs {
    state: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    /// name -> is_dir
    entries: HashMap<String, bool>,
    root_missing: bool,
    /// Scripted outcomes for subscribe attempts; empty means success.
    watch_failures: VecDeque<String>,
    rigs: Vec<WatchRig>,
    attempts: Vec<tokio::time::Instant>,
}

/// Sender side of one successful watch subscription.
#[derive(Clone)]
pub struct WatchRig {
    pub events: mpsc::Sender<String>,
    pub faults: mpsc::Sender<WatchFault>,
}

impl MemFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_file(&self, name: &str) {
        self.state
            .lock()
            .expect("mem fs poisoned")
            .entries
            .insert(name.to_string(), false);
    }

    pub fn add_dir(&self, name: &str) {
        self.state
            .lock()
            .expect("mem fs poisoned")
            .entries
            .insert(name.to_string(), true);
    }

    pub fn remove_entry(&self, name: &str) {
        self.state
            .lock()
            .expect("mem fs poisoned")
            .entries
            .remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state
            .lock()
            .expect("mem fs poisoned")
            .entries
            .contains_key(name)
    }

    pub fn set_root_missing(&self, missing: bool) {
        self.state.lock().expect("mem fs poisoned").root_missing = missing;
    }

    /// Make the next subscribe attempt fail with the given message.
    pub fn queue_watch_failure(&self, msg: &str) {
        self.state
            .lock()
            .expect("mem fs poisoned")
            .watch_failures
            .push_back(msg.to_string());
    }

    /// Instants of every subscribe attempt, successful or not.
    pub fn watch_attempts(&self) -> Vec<tokio::time::Instant> {
        self.state.lock().expect("mem fs poisoned").attempts.clone()
    }

    /// The rig of the most recent successful subscription.
    pub fn last_rig(&self) -> Option<WatchRig> {
        self.state
            .lock()
            .expect("mem fs poisoned")
            .rigs
            .last()
            .cloned()
    }
}

#[async_trait]
impl Filesystem for MemFs {
    async fn check_root(&self) -> Result<()> {
        if self.state.lock().expect("mem fs poisoned").root_missing {
            Err(SyncError::PathMissing("mem:/".to_string()))
        } else {
            Ok(())
        }
    }

    async fn watch(
        &self,
        _matcher: Arc<dyn IgnoreMatcher>,
        _token: CancellationToken,
        _ignore_perms: bool,
    ) -> Result<WatchStreams> {
        let mut state = self.state.lock().expect("mem fs poisoned");
        state.attempts.push(tokio::time::Instant::now());
        if let Some(msg) = state.watch_failures.pop_front() {
            return Err(SyncError::Watch(msg));
        }
        let (event_tx, events) = mpsc::channel(64);
        let (fault_tx, faults) = mpsc::channel(16);
        state.rigs.push(WatchRig {
            events: event_tx,
            faults: fault_tx,
        });
        Ok(WatchStreams { events, faults })
    }

    async fn dir_names(&self, rel: &str) -> Result<Vec<String>> {
        let state = self.state.lock().expect("mem fs poisoned");
        let names = state
            .entries
            .keys()
            .filter(|name| paths::parent_of(name) == rel)
            .map(|name| match name.rfind('/') {
                Some(idx) => name[idx + 1..].to_string(),
                None => name.clone(),
            })
            .collect();
        Ok(names)
    }

    async fn remove(&self, rel: &str) -> Result<()> {
        self.state
            .lock()
            .expect("mem fs poisoned")
            .entries
            .remove(rel);
        Ok(())
    }

    async fn is_deleted(&self, rel: &str) -> bool {
        !self.contains(rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn real_fs_basic_operations() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFs::new(dir.path());
        fs.check_root().await.unwrap();

        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/a.txt"), b"hello")
            .await
            .unwrap();

        assert!(!fs.is_deleted("sub/a.txt").await);
        assert!(fs.is_deleted("sub/missing.txt").await);
        assert_eq!(fs.dir_names("sub").await.unwrap(), vec!["a.txt"]);

        fs.remove("sub/a.txt").await.unwrap();
        assert!(fs.is_deleted("sub/a.txt").await);

        let gone = RealFs::new(dir.path().join("nope"));
        assert!(gone.check_root().await.is_err());
    }

    #[tokio::test]
    async fn mem_fs_tracks_entries() {
        let fs = MemFs::new();
        fs.add_dir("docs");
        fs.add_file("docs/readme.md");
        assert!(!fs.is_deleted("docs/readme.md").await);
        assert_eq!(fs.dir_names("docs").await.unwrap(), vec!["readme.md"]);
        fs.remove("docs/readme.md").await.unwrap();
        assert!(fs.is_deleted("docs/readme.md").await);
    }

    #[tokio::test]
    async fn mem_fs_scripts_watch_failures() {
        let fs = MemFs::new();
        fs.queue_watch_failure("boom");
        let matcher: Arc<dyn IgnoreMatcher> = Arc::new(crate::ignore::StaticMatcher::new());
        let token = CancellationToken::new();
        assert!(fs
            .watch(Arc::clone(&matcher), token.clone(), false)
            .await
            .is_err());
        assert!(fs.watch(matcher, token, false).await.is_ok());
        assert_eq!(fs.watch_attempts().len(), 2);
    }
}
