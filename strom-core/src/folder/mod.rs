//! The per-folder synchronization controller.
//!
//! One controller owns one shared folder. Every stimulus (timers,
//! filesystem notifications, peer index updates, user requests) funnels
//! into a single event loop which serializes scans, pulls and ad-hoc work.
//! The loop is the sole writer of scan/pull decision state; the few fields
//! touched from other tasks carry their own locks.

pub mod batch;
pub mod journal;
mod scan;
pub mod state;
pub mod stats;
mod watch;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use strom_model::{DeviceId, FileRecord};
use tokio::sync::{mpsc, oneshot, watch as watch_ch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{FolderConfig, FolderType};
use crate::error::{Result, SyncError};
use crate::events::{DiskChange, Event, EventLogger, FolderSummary, IndexUpdated};
use crate::host::ControllerHost;
use crate::ignore::IgnoreMatcher;
use crate::index::FileSet;
use crate::limiter::IoLimiter;
use crate::puller::Puller;
use crate::versioner::Versioner;
use crate::vfs::Filesystem;
use crate::walker::Walker;

use batch::{BatchSink, FileBatch};
use journal::{ErrorJournal, FileError};
use state::{FolderState, StateTracker};
use stats::FolderStats;
use watch::WatchHandle;

/// Hard ceiling on the pull retry pause, as a multiple of the base pause.
const MAX_PULL_PAUSE_FACTOR: u32 = 60;

/// Collaborators a controller is wired to at construction.
pub struct ControllerDeps {
    pub host: Arc<dyn ControllerHost>,
    pub fset: Arc<dyn FileSet>,
    pub matcher: Arc<dyn IgnoreMatcher>,
    pub walker: Arc<dyn Walker>,
    pub puller: Arc<dyn Puller>,
    pub fs: Arc<dyn Filesystem>,
    pub logger: Arc<dyn EventLogger>,
    pub limiter: Arc<IoLimiter>,
    pub versioner: Option<Arc<dyn Versioner>>,
}

type SyncOpFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type SyncOp = Box<dyn FnOnce() -> SyncOpFuture + Send>;

pub(crate) struct SyncRequest {
    op: SyncOp,
    reply: oneshot::Sender<Result<()>>,
}

/// Receiver halves owned by `serve`.
struct ServeChannels {
    pull_scheduled: mpsc::Receiver<()>,
    restart_watch: mpsc::Receiver<()>,
    forced_rescan: mpsc::Receiver<()>,
    scan_delay: mpsc::Receiver<Duration>,
    in_sync: mpsc::Receiver<SyncRequest>,
    watch_events: mpsc::Receiver<Vec<String>>,
}

pub struct FolderController {
    /// Handle to ourselves for spawning owned tasks (watch monitor, in-loop
    /// closures). Always upgradable while the registry owns the controller.
    me: Weak<FolderController>,

    pub(crate) cfg: FolderConfig,
    pub(crate) state: StateTracker,
    pub(crate) stats: FolderStats,
    pub(crate) journal: ErrorJournal,

    pub(crate) host: Arc<dyn ControllerHost>,
    pub(crate) fset: Arc<dyn FileSet>,
    pub(crate) matcher: Arc<dyn IgnoreMatcher>,
    pub(crate) walker: Arc<dyn Walker>,
    pub(crate) puller: Arc<dyn Puller>,
    pub(crate) fs: Arc<dyn Filesystem>,
    pub(crate) logger: Arc<dyn EventLogger>,
    pub(crate) limiter: Arc<IoLimiter>,
    pub(crate) versioner: Option<Arc<dyn Versioner>>,

    /// Serve-lifetime cancellation; set when the loop starts.
    ctx: Mutex<CancellationToken>,
    /// Cancelled exactly once when the loop exits.
    done: CancellationToken,

    initial_scan_tx: watch_ch::Sender<bool>,
    initial_scan_rx: watch_ch::Receiver<bool>,

    // Capacity-1 coalescing edges: non-blocking send, drop when full.
    pull_scheduled_tx: mpsc::Sender<()>,
    restart_watch_tx: mpsc::Sender<()>,
    forced_rescan_tx: mpsc::Sender<()>,

    scan_delay_tx: mpsc::Sender<Duration>,
    in_sync_tx: mpsc::Sender<SyncRequest>,
    pub(crate) watch_events_tx: mpsc::Sender<Vec<String>>,

    chans: Mutex<Option<ServeChannels>>,

    pull_pause: Mutex<Duration>,
    pull_fail_at: Mutex<Option<Instant>>,

    forced_rescan_paths: Mutex<HashSet<String>>,
    pub(crate) watch_handle: WatchHandle,
}

impl FolderController {
    pub fn new(cfg: FolderConfig, deps: ControllerDeps) -> Arc<Self> {
        let (initial_scan_tx, initial_scan_rx) = watch_ch::channel(false);
        let (pull_scheduled_tx, pull_scheduled) = mpsc::channel(1);
        let (restart_watch_tx, restart_watch) = mpsc::channel(1);
        let (forced_rescan_tx, forced_rescan) = mpsc::channel(1);
        let (scan_delay_tx, scan_delay) = mpsc::channel(1);
        let (in_sync_tx, in_sync) = mpsc::channel(1);
        let (watch_events_tx, watch_events) = mpsc::channel(16);

        let pull_pause = cfg.pull_base_pause();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: StateTracker::new(cfg.id.clone(), Arc::clone(&deps.logger)),
            stats: FolderStats::new(),
            journal: ErrorJournal::new(cfg.description().to_string()),
            cfg,

            host: deps.host,
            fset: deps.fset,
            matcher: deps.matcher,
            walker: deps.walker,
            puller: deps.puller,
            fs: deps.fs,
            logger: deps.logger,
            limiter: deps.limiter,
            versioner: deps.versioner,

            ctx: Mutex::new(CancellationToken::new()),
            done: CancellationToken::new(),

            initial_scan_tx,
            initial_scan_rx,

            pull_scheduled_tx,
            restart_watch_tx,
            forced_rescan_tx,
            scan_delay_tx,
            in_sync_tx,
            watch_events_tx,

            chans: Mutex::new(Some(ServeChannels {
                pull_scheduled,
                restart_watch,
                forced_rescan,
                scan_delay,
                in_sync,
                watch_events,
            })),

            pull_pause: Mutex::new(pull_pause),
            pull_fail_at: Mutex::new(None),

            forced_rescan_paths: Mutex::new(HashSet::new()),
            watch_handle: WatchHandle::new(),
        })
    }

    pub fn description(&self) -> &str {
        self.cfg.description()
    }

    pub(crate) fn ctx(&self) -> CancellationToken {
        self.ctx.lock().expect("controller ctx poisoned").clone()
    }

    pub(crate) fn weak_self(&self) -> Weak<FolderController> {
        self.me.clone()
    }

    /// Latch observable by external callers once the loop has exited.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    // ---- event loop --------------------------------------------------

    /// The controller's supervised entry point. Runs until `token` is
    /// cancelled; the `done` latch closes on the way out.
    pub async fn serve(self: Arc<Self>, token: CancellationToken) {
        self.host.folder_started();
        *self.ctx.lock().expect("controller ctx poisoned") = token.clone();

        let taken = self.chans.lock().expect("controller channels poisoned").take();
        let Some(mut ch) = taken else {
            error!(folder = self.description(), "serve called more than once");
            self.host.folder_stopped();
            return;
        };

        debug!(folder = %self, "starting");

        if self.cfg.fs_watcher_enabled && self.health_error_loading_ignores().await.is_ok() {
            self.start_watch();
        }

        let mut initial_pending = true;
        let mut initial_rx = self.initial_scan_rx.clone();

        // The first rescan is unconditional and immediate.
        let mut scan_at: Option<Instant> = Some(Instant::now());

        let cleanup_interval = self.cfg.version_cleanup_interval();
        let mut cleanup_at = if !cleanup_interval.is_zero() && self.versioner.is_some() {
            Some(Instant::now() + cleanup_interval)
        } else {
            None
        };

        loop {
            let pull_fail_at = *self.pull_fail_at.lock().expect("pull timer poisoned");
            tokio::select! {
                _ = token.cancelled() => break,

                Some(()) = ch.pull_scheduled.recv() => {
                    self.pull().await;
                }

                _ = sleep_until(timer_target(pull_fail_at)), if pull_fail_at.is_some() => {
                    *self.pull_fail_at.lock().expect("pull timer poisoned") = None;
                    if !self.pull().await {
                        self.raise_pull_pause();
                    }
                }

                _ = initial_rx.changed(), if initial_pending => {
                    // Initial scan completed; pull once as a direct consequence.
                    initial_pending = false;
                    self.pull().await;
                }

                Some(()) = ch.forced_rescan.recv() => {
                    self.handle_forced_rescans().await;
                }

                _ = sleep_until(timer_target(scan_at)), if scan_at.is_some() => {
                    scan_at = None;
                    debug!(folder = %self, "scanning due to timer");
                    self.scan_timer_fired(&mut scan_at).await;
                }

                Some(req) = ch.in_sync.recv() => {
                    debug!(folder = %self, "running request in sync");
                    let _ = req.reply.send((req.op)().await);
                }

                Some(next) = ch.scan_delay.recv() => {
                    debug!(folder = %self, delay = ?next, "delaying scan");
                    scan_at = Some(Instant::now() + next);
                }

                Some(paths) = ch.watch_events.recv() => {
                    debug!(folder = %self, items = paths.len(), "scan due to watcher");
                    let _ = self.scan_subdirs(paths).await;
                }

                Some(()) = ch.restart_watch.recv() => {
                    debug!(folder = %self, "restarting watcher");
                    self.restart_watch().await;
                }

                _ = sleep_until(timer_target(cleanup_at)), if cleanup_at.is_some() => {
                    debug!(folder = %self, "version cleanup due to timer");
                    self.version_cleanup_timer_fired().await;
                    cleanup_at = Some(Instant::now() + cleanup_interval);
                }
            }
        }

        self.stop_watch();
        self.state.set_state(FolderState::Idle);
        self.done.cancel();
        self.host.folder_stopped();
        debug!(folder = %self, "exiting");
    }

    async fn scan_timer_fired(&self, scan_at: &mut Option<Instant>) {
        let res = self.scan_subdirs(Vec::new()).await;

        if !*self.initial_scan_tx.borrow() {
            match &res {
                Ok(()) => info!(folder = self.description(), "completed initial scan"),
                Err(err) => info!(folder = self.description(), %err, "failed initial scan"),
            }
            self.initial_scan_tx.send_replace(true);
        }

        *scan_at = self.next_rescan_at();
    }

    fn next_rescan_at(&self) -> Option<Instant> {
        self.random_rescan_delay().map(|delay| {
            debug!(folder = self.description(), next = ?delay, "next rescan");
            Instant::now() + delay
        })
    }

    /// A uniformly random duration in [3/4, 5/4] of the configured interval,
    /// or None when timed rescans are disabled.
    fn random_rescan_delay(&self) -> Option<Duration> {
        let interval = self.cfg.rescan_interval();
        if interval.is_zero() {
            return None;
        }
        let nanos = interval.as_nanos() as u64;
        let jittered = (nanos * 3 + rand::thread_rng().gen_range(0..nanos * 2)) / 4;
        Some(Duration::from_nanos(jittered))
    }

    async fn version_cleanup_timer_fired(&self) {
        let Some(versioner) = self.versioner.clone() else {
            return;
        };
        self.state.set_state(FolderState::CleanWaiting);
        let token = self.ctx();
        let permit = match self.limiter.take(&token).await {
            Ok(permit) => permit,
            Err(_) => {
                self.state.set_state(FolderState::Idle);
                return;
            }
        };
        self.state.set_state(FolderState::Cleaning);
        if let Err(err) = versioner.clean(&token).await {
            info!(folder = self.description(), %err, "failed to clean versions");
        }
        drop(permit);
        self.state.set_state(FolderState::Idle);
    }

    // ---- pull scheduling ---------------------------------------------

    /// One pull attempt. Returns true when the attempt succeeded (or there
    /// was nothing to do) and need not be retried soon.
    async fn pull(&self) -> bool {
        *self.pull_fail_at.lock().expect("pull timer poisoned") = None;

        if !*self.initial_scan_tx.borrow() {
            // A pull is scheduled when the initial scan latch opens.
            return true;
        }

        let success = self.pull_inner().await;
        if success {
            *self.pull_pause.lock().expect("pull pause poisoned") = self.cfg.pull_base_pause();
        }
        success
    }

    async fn pull_inner(&self) -> bool {
        {
            let snap = self.fset.snapshot();
            let nothing_needed = snap.need(DeviceId::LOCAL).next().is_none();
            drop(snap);
            if nothing_needed {
                // Also forget failures on items that are no longer needed.
                self.journal.clear_pull();
                return true;
            }
        }

        // Abort early, before acquiring a token, on folder errors.
        match self.health_error_without_ignores().await {
            Err(err) => {
                self.set_error(Some(&err));
                debug!(folder = self.description(), %err, "skipping pull due to folder error");
                return false;
            }
            Ok(()) => self.set_error(None),
        }

        // Send-only folders do no sync I/O; they only reconcile metadata.
        let mut _permit = None;
        if self.cfg.folder_type != FolderType::SendOnly {
            self.state.set_state(FolderState::SyncWaiting);
            match self.limiter.take(&self.ctx()).await {
                Ok(permit) => _permit = Some(permit),
                Err(err) => {
                    self.set_error(Some(&err));
                    return true;
                }
            }
        }

        let start = Instant::now();
        let old_hash = self.matcher.hash();

        let attempted = match self.health_error_loading_ignores().await {
            Err(err) => {
                self.set_error(Some(&err));
                debug!(folder = self.description(), %err, "skipping pull due to folder error");
                None
            }
            Ok(()) => {
                self.set_error(None);
                self.state.set_state(FolderState::Syncing);
                let success = self.puller.pull().await;
                self.state.set_state(FolderState::Idle);
                Some(success)
            }
        };

        if self.matcher.hash() != old_hash {
            self.ignores_updated();
        }

        match attempted {
            // Health failure: retried when whatever cleared it wakes us.
            None => false,
            Some(true) => true,
            Some(false) => {
                let delay =
                    *self.pull_pause.lock().expect("pull pause poisoned") + start.elapsed();
                info!(
                    folder = self.description(),
                    retry_in = ?delay,
                    "folder isn't making sync progress, retrying later"
                );
                *self.pull_fail_at.lock().expect("pull timer poisoned") =
                    Some(Instant::now() + delay);
                false
            }
        }
    }

    fn raise_pull_pause(&self) {
        let cap = self.cfg.pull_base_pause() * MAX_PULL_PAUSE_FACTOR;
        let mut pause = self.pull_pause.lock().expect("pull pause poisoned");
        *pause = (*pause * 2).min(cap);
    }

    /// Called after scans or pulls observe an ignore-pattern edit.
    pub(crate) fn ignores_updated(&self) {
        if self.cfg.fs_watcher_enabled {
            self.schedule_watch_restart();
        }
    }

    // ---- forced rescans ----------------------------------------------

    async fn handle_forced_rescans(&self) {
        let paths: Vec<String> = {
            let mut set = self
                .forced_rescan_paths
                .lock()
                .expect("forced rescan ledger poisoned");
            set.drain().collect()
        };
        if paths.is_empty() {
            return;
        }

        let mut batch = FileBatch::new();
        let mut sink = IndexSink { folder: self };
        {
            let snap = self.fset.snapshot();
            for path in &paths {
                let _ = batch.flush_if_full(&mut sink).await;
                // Paths with no index entry are silently skipped.
                let Some(mut record) = snap.get(DeviceId::LOCAL, path) else {
                    continue;
                };
                record.set_must_rescan(self.cfg.short_id);
                batch.append(record);
            }
        }
        // The marks must reach the index before the scan takes its snapshot.
        let _ = batch.flush(&mut sink).await;

        let _ = self.scan_subdirs(paths).await;
    }

    // ---- shared error / health handling ------------------------------

    pub(crate) fn set_error(&self, err: Option<&SyncError>) {
        if self.ctx().is_cancelled() {
            return;
        }
        let new_text = err.map(|e| e.to_string());
        let (_, _, old_text) = self.state.state();
        if old_text == new_text {
            return;
        }

        state::log_error_transition(self.description(), old_text.as_deref(), new_text.as_deref());

        if self.cfg.fs_watcher_enabled {
            if new_text.is_some() {
                self.stop_watch();
            } else {
                self.schedule_watch_restart();
            }
        }

        self.state.set_error(new_text);
    }

    pub(crate) async fn health_error_without_ignores(&self) -> Result<()> {
        self.fs.check_root().await?;
        if let Ok(usage) = self.host.database_usage() {
            let required = self.host.min_database_free();
            if usage.free < required {
                return Err(SyncError::InsufficientSpace {
                    free: usage.free,
                    required,
                });
            }
        }
        Ok(())
    }

    pub(crate) async fn health_error_loading_ignores(&self) -> Result<()> {
        self.health_error_without_ignores().await?;
        if let Err(err) = self.matcher.load(&self.cfg.ignore_file) {
            // A missing ignore file just means no patterns.
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(SyncError::LoadIgnores(err.to_string()));
            }
        }
        Ok(())
    }

    // ---- index commits ------------------------------------------------

    /// Commit locally scanned changes and announce them.
    pub fn update_locals_from_scanning(&self, records: Vec<FileRecord>) {
        self.emit_disk_change_events(&records, false);
        self.update_locals(records);
    }

    /// Commit changes written by the puller and announce them. Part of the
    /// surface because the puller commits through its folder.
    pub fn update_locals_from_pulling(&self, records: Vec<FileRecord>) {
        self.emit_disk_change_events(&records, true);
        self.update_locals(records);
    }

    fn update_locals(&self, records: Vec<FileRecord>) {
        let mut filenames = Vec::with_capacity(records.len());
        {
            let mut forced = self
                .forced_rescan_paths
                .lock()
                .expect("forced rescan ledger poisoned");
            for record in &records {
                filenames.push(record.name.clone());
                // No need to rescan an entry that was just updated anyway.
                forced.remove(&record.name);
            }
        }
        let items = records.len();
        self.fset.update(DeviceId::LOCAL, records);
        let sequence = self.fset.sequence(DeviceId::LOCAL);
        self.logger.log(Event::LocalIndexUpdated(IndexUpdated {
            folder: self.cfg.id.clone(),
            items,
            filenames,
            sequence,
        }));
    }

    fn emit_disk_change_events(&self, records: &[FileRecord], remote: bool) {
        for record in records {
            if record.is_invalid() {
                continue;
            }
            let action = if record.is_deleted() {
                "deleted"
            } else {
                "modified"
            };
            let kind = if record.is_symlink() {
                "symlink"
            } else if record.is_directory() {
                "dir"
            } else {
                "file"
            };
            let payload = DiskChange {
                folder: self.cfg.id.clone(),
                label: self.cfg.label.clone(),
                action,
                kind,
                path: record
                    .name
                    .replace('/', std::path::MAIN_SEPARATOR_STR),
                modified_by: record.modified_by.to_string(),
            };
            self.logger.log(if remote {
                Event::RemoteChangeDetected(payload)
            } else {
                Event::LocalChangeDetected(payload)
            });
        }
    }

    pub(crate) fn scan_completed(&self) {
        let last_scan = self.stats.scan_completed();
        self.logger.log(Event::FolderSummary(FolderSummary {
            folder: self.cfg.id.clone(),
            label: self.cfg.label.clone(),
            sequence: self.fset.sequence(DeviceId::LOCAL),
            last_scan,
        }));
    }

    // ---- surface exposed to siblings ---------------------------------

    /// Coalescing wake: at most one pull is queued no matter how often this
    /// is called while a pull runs.
    pub fn schedule_pull(&self) {
        let _ = self.pull_scheduled_tx.try_send(());
    }

    /// Reset the scan timer to fire after `next`.
    pub async fn delay_scan(&self, next: Duration) {
        tokio::select! {
            res = self.scan_delay_tx.send(next) => {
                let _ = res;
            }
            _ = self.done.cancelled() => {}
        }
    }

    /// Blocks until the initial scan completed at least once, then runs a
    /// targeted scan inside the loop.
    pub async fn scan(&self, subs: Vec<String>) -> Result<()> {
        let mut initial = self.initial_scan_rx.clone();
        tokio::select! {
            res = initial.wait_for(|done| *done) => {
                if res.is_err() {
                    return Err(SyncError::Cancelled);
                }
            }
            _ = self.done.cancelled() => return Err(SyncError::Cancelled),
        }
        let Some(this) = self.me.upgrade() else {
            return Err(SyncError::Cancelled);
        };
        self.do_in_sync(Box::new(move || {
            Box::pin(async move { this.scan_subdirs(subs).await })
        }))
        .await
    }

    /// Remember a path for re-hashing and wake the loop.
    pub fn schedule_force_rescan(&self, path: impl Into<String>) {
        self.forced_rescan_paths
            .lock()
            .expect("forced rescan ledger poisoned")
            .insert(path.into());
        let _ = self.forced_rescan_tx.try_send(());
    }

    /// Merged scan and pull errors, sorted by path.
    pub fn errors(&self) -> Vec<FileError> {
        self.journal.all()
    }

    /// Latest watcher error, if any.
    pub fn watch_error(&self) -> Option<SyncError> {
        self.watch_handle.error().map(SyncError::Watch)
    }

    /// Pick a fresh randomized rescan time.
    pub async fn reschedule(&self) {
        if let Some(delay) = self.random_rescan_delay() {
            self.delay_scan(delay).await;
        }
    }

    /// Run `op` inside the loop's serialization domain.
    pub(crate) async fn do_in_sync(&self, op: SyncOp) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let req = SyncRequest { op, reply: tx };
        tokio::select! {
            res = self.in_sync_tx.send(req) => {
                if res.is_err() {
                    return Err(SyncError::Cancelled);
                }
            }
            _ = self.done.cancelled() => return Err(SyncError::Cancelled),
        }
        tokio::select! {
            res = rx => match res {
                Ok(result) => result,
                Err(_) => Err(SyncError::Cancelled),
            },
            _ = self.done.cancelled() => Err(SyncError::Cancelled),
        }
    }
}

impl fmt::Display for FolderController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cfg.folder_type, self.cfg.id)
    }
}

/// Sink committing straight to the index, without change announcements.
/// Used for bookkeeping writes such as must-rescan marks.
struct IndexSink<'a> {
    folder: &'a FolderController,
}

#[async_trait]
impl BatchSink for IndexSink<'_> {
    async fn commit(&mut self, records: Vec<FileRecord>) -> Result<()> {
        self.folder.fset.update(DeviceId::LOCAL, records);
        Ok(())
    }
}

fn timer_target(at: Option<Instant>) -> Instant {
    // The arm is disabled when `at` is none; any placeholder works.
    at.unwrap_or_else(|| Instant::now() + Duration::from_secs(24 * 3600))
}
