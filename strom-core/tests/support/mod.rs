//! Shared fixture wiring a controller to in-memory collaborators.
#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strom_core::config::FolderConfig;
use strom_core::events::CapturingLogger;
use strom_core::folder::{ControllerDeps, FolderController};
use strom_core::host::{ControllerHost, DiskUsage};
use strom_core::ignore::StaticMatcher;
use strom_core::index::memory::MemoryFileSet;
use strom_core::index::FileSet;
use strom_core::limiter::IoLimiter;
use strom_core::puller::{Puller, ScriptedPuller};
use strom_core::vfs::MemFs;
use strom_core::walker::ScriptedWalker;
use strom_model::flags::FLAG_LOCAL_MUST_RESCAN;
use strom_model::{BlocksHash, DeviceId, FileKind, FileRecord, ShortDeviceId, Version};
use tokio_util::sync::CancellationToken;

pub const LOCAL_SHORT: ShortDeviceId = ShortDeviceId(0x1001);
pub const REMOTE_SHORT: ShortDeviceId = ShortDeviceId(0x2002);

pub struct TestHost {
    running: AtomicI64,
    free: AtomicU64,
    min_free: AtomicU64,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicI64::new(0),
            free: AtomicU64::new(u64::MAX),
            min_free: AtomicU64::new(0),
        })
    }

    pub fn running(&self) -> i64 {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_free(&self, free: u64, min_free: u64) {
        self.free.store(free, Ordering::SeqCst);
        self.min_free.store(min_free, Ordering::SeqCst);
    }
}

impl ControllerHost for TestHost {
    fn folder_started(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    fn folder_stopped(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn database_usage(&self) -> std::io::Result<DiskUsage> {
        Ok(DiskUsage {
            free: self.free.load(Ordering::SeqCst),
            total: u64::MAX,
        })
    }

    fn min_database_free(&self) -> u64 {
        self.min_free.load(Ordering::SeqCst)
    }
}

pub struct Fixture {
    pub host: Arc<TestHost>,
    pub fset: Arc<MemoryFileSet>,
    pub matcher: Arc<StaticMatcher>,
    pub walker: Arc<ScriptedWalker>,
    pub fs: Arc<MemFs>,
    pub logger: Arc<CapturingLogger>,
    pub limiter: Arc<IoLimiter>,
    pub token: CancellationToken,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            host: TestHost::new(),
            fset: Arc::new(MemoryFileSet::new()),
            matcher: Arc::new(StaticMatcher::new()),
            walker: Arc::new(ScriptedWalker::new()),
            fs: MemFs::new(),
            logger: Arc::new(CapturingLogger::new()),
            limiter: IoLimiter::new(4),
            token: CancellationToken::new(),
        }
    }

    pub fn deps(&self, puller: Arc<dyn Puller>) -> ControllerDeps {
        let host: Arc<dyn ControllerHost> = self.host.clone();
        let fset: Arc<dyn strom_core::index::FileSet> = self.fset.clone();
        let matcher: Arc<dyn strom_core::ignore::IgnoreMatcher> = self.matcher.clone();
        let walker: Arc<dyn strom_core::walker::Walker> = self.walker.clone();
        let fs: Arc<dyn strom_core::vfs::Filesystem> = self.fs.clone();
        let logger: Arc<dyn strom_core::events::EventLogger> = self.logger.clone();
        ControllerDeps {
            host,
            fset,
            matcher,
            walker,
            puller,
            fs,
            logger,
            limiter: Arc::clone(&self.limiter),
            versioner: None,
        }
    }

    pub fn controller(&self, cfg: FolderConfig, puller: Arc<dyn Puller>) -> Arc<FolderController> {
        FolderController::new(cfg, self.deps(puller))
    }

    /// Insert a valid record for a remote device so the local device needs it.
    pub fn add_remote_need(&self, name: &str) {
        let mut record = file_record(name, REMOTE_SHORT);
        record.modified_by = REMOTE_SHORT;
        self.fset.update(DeviceId::new(), vec![record]);
    }
}

pub fn test_config(id: &str) -> FolderConfig {
    let mut cfg = FolderConfig::new(id, format!("/{id}"));
    cfg.short_id = LOCAL_SHORT;
    cfg.rescan_interval_secs = 0;
    cfg.pull_pause_secs = 1;
    cfg
}

pub fn file_record(name: &str, by: ShortDeviceId) -> FileRecord {
    let mut record = FileRecord::new(name, FileKind::File);
    record.size = 1024;
    record.modified_ns = 1_700_000_000_000_000_000;
    record.blocks_hash = Some(BlocksHash([0xAB; 32]));
    record.block_count = 8;
    record.version = Version::new().updated(by);
    record.modified_by = by;
    record
}

pub fn dir_record(name: &str, by: ShortDeviceId) -> FileRecord {
    let mut record = FileRecord::new(name, FileKind::Directory);
    record.version = Version::new().updated(by);
    record.modified_by = by;
    record
}

pub fn is_marked_for_rescan(record: &FileRecord) -> bool {
    record.local_flags & FLAG_LOCAL_MUST_RESCAN != 0
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..300 {
        tokio::task::yield_now().await;
    }
}

/// Move the paused clock and let everything woken by it run.
pub async fn advance_by(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

/// Poll for a condition, nudging the clock a millisecond at a time.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        settle().await;
        tokio::time::advance(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}
