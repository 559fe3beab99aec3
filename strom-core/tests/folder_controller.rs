//! Event-loop level behavior: startup scanning, pull scheduling and backoff,
//! watcher supervision, cancellation.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use strom_core::config::FolderType;
use strom_core::puller::{Puller, ScriptedPuller};
use strom_core::versioner::Versioner;
use strom_core::vfs::WatchFault;
use strom_core::SyncError;
use tokio_util::sync::CancellationToken;

use support::{advance_by, settle, test_config, wait_until, Fixture};

#[tokio::test(start_paused = true)]
async fn first_run_scans_immediately_then_pulls_and_reschedules() {
    let fixture = Fixture::new();
    let mut cfg = test_config("s1");
    cfg.rescan_interval_secs = 30;
    let puller = Arc::new(ScriptedPuller::new());
    fixture.add_remote_need("wanted.txt");

    let controller = fixture.controller(cfg, Arc::clone(&puller) as Arc<dyn Puller>);
    tokio::spawn(Arc::clone(&controller).serve(fixture.token.clone()));

    // Scan timer fires at t=0; the initial-scan latch then triggers one pull.
    wait_until(|| fixture.walker.calls().len() == 1 && puller.calls() == 1).await;

    // The next scan lands in [3/4, 5/4] of the configured 30s interval.
    advance_by(Duration::from_secs(22)).await;
    assert_eq!(fixture.walker.calls().len(), 1, "rescanned before the window");
    advance_by(Duration::from_secs(16)).await;
    assert_eq!(fixture.walker.calls().len(), 2, "no rescan within the window");
}

#[tokio::test(start_paused = true)]
async fn scan_call_blocks_until_initial_scan_completed() {
    let fixture = Fixture::new();
    let puller = Arc::new(ScriptedPuller::new());
    let controller = fixture.controller(test_config("blocked"), puller);

    let waiting = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.scan(Vec::new()).await })
    };

    // Nothing serves the folder yet, so the call must still be parked.
    settle().await;
    assert!(!waiting.is_finished());

    tokio::spawn(Arc::clone(&controller).serve(fixture.token.clone()));
    wait_until(|| waiting.is_finished()).await;

    // The blocked call went through as a second, in-loop scan.
    assert_eq!(fixture.walker.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_supervisor_closes_done_exactly_once() {
    let fixture = Fixture::new();
    let puller = Arc::new(ScriptedPuller::new());
    let controller = fixture.controller(test_config("done"), puller);

    let serve = tokio::spawn(Arc::clone(&controller).serve(fixture.token.clone()));
    wait_until(|| fixture.walker.calls().len() == 1).await;
    assert_eq!(fixture.host.running(), 1);

    fixture.token.cancel();
    wait_until(|| serve.is_finished()).await;

    assert!(controller.done().is_cancelled());
    assert_eq!(fixture.host.running(), 0);

    // Callers arriving after shutdown observe cancellation.
    let res = controller.scan(Vec::new()).await;
    assert!(matches!(res, Err(SyncError::Cancelled)));
}

/// Puller that parks inside pull() until the test releases it.
struct GatedPuller {
    calls: AtomicUsize,
    gate: tokio::sync::Semaphore,
}

impl GatedPuller {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            gate: tokio::sync::Semaphore::new(0),
        })
    }

    fn release_one(&self) {
        self.gate.add_permits(1);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Puller for GatedPuller {
    async fn pull(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.gate.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => {}
        }
        true
    }
}

#[tokio::test(start_paused = true)]
async fn thousand_schedule_pulls_during_a_pull_coalesce_into_one() {
    let fixture = Fixture::new();
    fixture.add_remote_need("wanted.txt");
    let puller = GatedPuller::new();
    let controller = fixture.controller(
        test_config("s6"),
        Arc::clone(&puller) as Arc<dyn Puller>,
    );
    tokio::spawn(Arc::clone(&controller).serve(fixture.token.clone()));

    // Initial scan, then the latch pull parks inside the puller.
    wait_until(|| puller.calls() == 1).await;

    for _ in 0..1000 {
        controller.schedule_pull();
    }

    puller.release_one();
    wait_until(|| puller.calls() == 2).await;
    puller.release_one();

    // All thousand wakes collapsed into that single follow-up.
    advance_by(Duration::from_secs(120)).await;
    assert_eq!(puller.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn pull_retry_delay_doubles_to_the_cap_and_resets_on_success() {
    let fixture = Fixture::new();
    fixture.add_remote_need("wanted.txt");
    let puller = Arc::new(ScriptedPuller::new());
    for _ in 0..9 {
        puller.queue(false);
    }
    puller.queue(true);
    puller.queue(false);

    // Base pause 1s; the cap is 60x base.
    let controller = fixture.controller(
        test_config("backoff"),
        Arc::clone(&puller) as Arc<dyn Puller>,
    );
    tokio::spawn(Arc::clone(&controller).serve(fixture.token.clone()));

    wait_until(|| puller.calls() == 1).await;

    let expected_delays = [1u64, 1, 2, 4, 8, 16, 32, 60, 60];
    for (i, secs) in expected_delays.iter().enumerate() {
        advance_by(Duration::from_millis(secs * 1000 + 200)).await;
        assert_eq!(puller.calls(), i + 2, "retry {} not at {}s", i + 2, secs);
    }

    // Call 10 succeeded, resetting the pause to base.
    controller.schedule_pull();
    wait_until(|| puller.calls() == 11).await;
    advance_by(Duration::from_millis(1200)).await;
    assert_eq!(puller.calls(), 12, "pause did not reset after success");
}

#[tokio::test(start_paused = true)]
async fn send_only_pull_runs_without_an_io_token() {
    let fixture = Fixture::new();
    fixture.add_remote_need("wanted.txt");
    let mut cfg = test_config("sendonly");
    cfg.folder_type = FolderType::SendOnly;
    let puller = Arc::new(ScriptedPuller::new());
    let controller = fixture.controller(cfg, Arc::clone(&puller) as Arc<dyn Puller>);
    tokio::spawn(Arc::clone(&controller).serve(fixture.token.clone()));

    wait_until(|| puller.calls() == 1).await;

    // Exhaust the process-wide limiter entirely.
    let token = CancellationToken::new();
    let mut held = Vec::new();
    while fixture.limiter.available() > 0 {
        held.push(fixture.limiter.take(&token).await.unwrap());
    }

    controller.schedule_pull();
    wait_until(|| puller.calls() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn watcher_retries_with_doubling_pause_and_resets_after_long_run() {
    let fixture = Fixture::new();
    let mut cfg = test_config("watch");
    cfg.fs_watcher_enabled = true;
    for _ in 0..3 {
        fixture.fs.queue_watch_failure("inotify limit reached");
    }
    let puller = Arc::new(ScriptedPuller::new());
    let controller = fixture.controller(cfg, puller);
    tokio::spawn(Arc::clone(&controller).serve(fixture.token.clone()));

    settle().await;
    assert_eq!(fixture.fs.watch_attempts().len(), 1);
    assert!(controller.watch_error().is_some());

    // Retries at 1, 2, 4 minutes; the fourth attempt succeeds.
    advance_by(Duration::from_secs(60)).await;
    assert_eq!(fixture.fs.watch_attempts().len(), 2);
    advance_by(Duration::from_secs(120)).await;
    assert_eq!(fixture.fs.watch_attempts().len(), 3);
    advance_by(Duration::from_secs(240)).await;
    assert_eq!(fixture.fs.watch_attempts().len(), 4);
    wait_until(|| controller.watch_error().is_none()).await;

    // A run outliving the current pause resets it to one minute.
    advance_by(Duration::from_secs(500)).await;
    fixture.fs.queue_watch_failure("inotify limit reached");
    let rig = fixture.fs.last_rig().unwrap();
    rig.faults
        .send(WatchFault::Stream("inotify stream broke".into()))
        .await
        .unwrap();
    // Long-lived run: the retry happens immediately...
    wait_until(|| fixture.fs.watch_attempts().len() == 5).await;
    // ...and the next one a single minute later.
    advance_by(Duration::from_secs(60)).await;
    assert_eq!(fixture.fs.watch_attempts().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn watch_event_bursts_collapse_into_one_targeted_scan() {
    let fixture = Fixture::new();
    let mut cfg = test_config("events");
    cfg.fs_watcher_enabled = true;
    let puller = Arc::new(ScriptedPuller::new());
    let controller = fixture.controller(cfg, puller);
    tokio::spawn(Arc::clone(&controller).serve(fixture.token.clone()));

    wait_until(|| fixture.fs.last_rig().is_some() && fixture.walker.calls().len() == 1).await;

    let rig = fixture.fs.last_rig().unwrap();
    for path in ["foo/a.txt", "foo/b.txt", "foo/a.txt"] {
        rig.events.send(path.to_string()).await.unwrap();
    }

    // Debounce window passes, the batch lands, and the scan is targeted at
    // the highest unknown ancestor of the changed paths.
    advance_by(Duration::from_millis(400)).await;
    wait_until(|| fixture.walker.calls().len() == 2).await;
    let call = &fixture.walker.calls()[1];
    assert_eq!(call.cfg.subs, vec!["foo".to_string()]);
}

struct CountingVersioner {
    calls: AtomicUsize,
}

#[async_trait]
impl Versioner for CountingVersioner {
    async fn clean(&self, _token: &CancellationToken) -> strom_core::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn version_cleanup_runs_on_its_own_interval() {
    let fixture = Fixture::new();
    let mut cfg = test_config("cleanup");
    cfg.version_cleanup_interval_secs = 300;
    let versioner = Arc::new(CountingVersioner {
        calls: AtomicUsize::new(0),
    });
    let mut deps = fixture.deps(Arc::new(ScriptedPuller::new()));
    deps.versioner = Some(Arc::clone(&versioner) as Arc<dyn Versioner>);
    let controller = strom_core::FolderController::new(cfg, deps);
    tokio::spawn(Arc::clone(&controller).serve(fixture.token.clone()));

    wait_until(|| fixture.walker.calls().len() == 1).await;
    assert_eq!(versioner.calls.load(Ordering::SeqCst), 0);

    advance_by(Duration::from_secs(301)).await;
    assert_eq!(versioner.calls.load(Ordering::SeqCst), 1);
    advance_by(Duration::from_secs(300)).await;
    assert_eq!(versioner.calls.load(Ordering::SeqCst), 2);
}
