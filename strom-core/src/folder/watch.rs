//! Watch supervisor: owns the filesystem watcher subscription, collapses
//! event bursts into path batches for the loop, and retries failed
//! subscriptions with capped exponential backoff.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, WatchStateChanged};
use crate::vfs::{WatchFault, WatchStreams};

use super::FolderController;

/// First retry pause after a failure.
pub(crate) const WATCH_INITIAL_PAUSE: Duration = Duration::from_secs(60);
/// Retry pauses double up to this cap.
pub(crate) const WATCH_MAX_PAUSE: Duration = Duration::from_secs(3600);

/// Watcher state reachable from outside the monitor task.
pub(crate) struct WatchHandle {
    inner: Mutex<WatchInner>,
}

#[derive(Default)]
struct WatchInner {
    cancel: Option<CancellationToken>,
    err: Option<String>,
}

impl WatchHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(WatchInner::default()),
        }
    }

    pub(crate) fn error(&self) -> Option<String> {
        self.inner.lock().expect("watch handle poisoned").err.clone()
    }

    fn swap_error(&self, err: Option<String>) -> Option<String> {
        std::mem::replace(
            &mut self.inner.lock().expect("watch handle poisoned").err,
            err,
        )
    }

    fn set_cancel(&self, token: Option<CancellationToken>) -> Option<CancellationToken> {
        std::mem::replace(
            &mut self.inner.lock().expect("watch handle poisoned").cancel,
            token,
        )
    }
}

impl FolderController {
    /// Start watching. Only called from the loop; `stop_watch` is safe from
    /// anywhere.
    pub(crate) fn start_watch(&self) {
        let Some(this) = self.weak_self().upgrade() else {
            return;
        };
        let token = self.ctx().child_token();
        if let Some(old) = self.watch_handle.set_cancel(Some(token.clone())) {
            old.cancel();
        }
        tokio::spawn(async move {
            this.monitor_watch(token).await;
        });
    }

    /// Abort watching immediately. Idempotent.
    pub(crate) fn stop_watch(&self) {
        if let Some(token) = self.watch_handle.set_cancel(None) {
            token.cancel();
        }
        self.set_watch_error(None, Duration::ZERO);
    }

    /// Coalesced wake into the loop; the restart itself runs there.
    pub(crate) fn schedule_watch_restart(&self) {
        let _ = self.restart_watch_tx.try_send(());
    }

    /// Loop-side restart: stop, start, and rescan everything since events
    /// may have been lost in between.
    pub(crate) async fn restart_watch(&self) {
        self.stop_watch();
        self.start_watch();
        let _ = self.scan_subdirs(Vec::new()).await;
    }

    /// If a watcher error is latched, an event may have been missed: get a
    /// full scan going right away.
    async fn scan_on_watch_error(&self) {
        if self.watch_handle.error().is_some() {
            self.delay_scan(Duration::ZERO).await;
        }
    }

    async fn monitor_watch(self: Arc<Self>, token: CancellationToken) {
        let mut pause = WATCH_INITIAL_PAUSE;
        let mut warned_outside = false;
        // The first attempt runs immediately.
        let mut retry_at = Instant::now();

        loop {
            // Subscribe, retrying with backoff.
            let mut streams: WatchStreams;
            let started;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep_until(retry_at) => {}
                }
                self.scan_on_watch_error().await;
                match self
                    .fs
                    .watch(
                        Arc::clone(&self.matcher),
                        token.child_token(),
                        self.cfg.ignore_perms,
                    )
                    .await
                {
                    Ok(s) => {
                        self.set_watch_error(None, pause);
                        debug!(folder = self.description(), "started filesystem watcher");
                        streams = s;
                        started = Instant::now();
                        break;
                    }
                    Err(err) => {
                        self.set_watch_error(Some(err.to_string()), pause);
                        retry_at = Instant::now() + pause;
                        pause = (pause * 2).min(WATCH_MAX_PAUSE);
                    }
                }
            }

            // Aggregate events until the subscription fails.
            let mut pending: Vec<String> = Vec::new();
            let mut flush_at: Option<Instant> = None;
            let fault: Option<WatchFault> = loop {
                let flush_deadline =
                    flush_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
                tokio::select! {
                    _ = token.cancelled() => return,

                    event = streams.events.recv() => match event {
                        Some(path) => {
                            if !pending.contains(&path) {
                                pending.push(path);
                            }
                            if pending.len() >= self.cfg.watch_max_batch {
                                if !self.deliver_watch_batch(&mut pending, &token).await {
                                    return;
                                }
                                flush_at = None;
                            } else {
                                flush_at = Some(Instant::now() + self.cfg.watch_debounce());
                            }
                        }
                        None => break None,
                    },

                    fault = streams.faults.recv() => break fault,

                    _ = sleep_until(flush_deadline), if flush_at.is_some() => {
                        flush_at = None;
                        if !self.deliver_watch_batch(&mut pending, &token).await {
                            return;
                        }
                    }
                }
            };

            let message = match &fault {
                Some(f) => f.message(),
                None => "watch event stream closed".to_string(),
            };

            // A long-lived run means the backoff did its job; start over.
            let next = if started.elapsed() >= pause {
                pause = WATCH_INITIAL_PAUSE;
                Duration::ZERO
            } else {
                let next = pause - started.elapsed();
                pause = (pause * 2).min(WATCH_MAX_PAUSE);
                next
            };
            retry_at = Instant::now() + next;
            self.set_watch_error(Some(message), next);

            if let Some(WatchFault::OutsideRoot(path)) = &fault {
                // Should never happen; warn once, but keep the retry path.
                if !warned_outside {
                    warn!(
                        folder = self.description(),
                        path = %path,
                        "watcher delivered an event outside the folder root"
                    );
                    warned_outside = true;
                }
                self.logger.log(Event::Failure(
                    "watching for changes encountered an event outside of the filesystem root"
                        .to_string(),
                ));
            }
        }
    }

    /// Hand a batch to the loop, blocking while it is busy. False on
    /// cancellation.
    async fn deliver_watch_batch(
        &self,
        pending: &mut Vec<String>,
        token: &CancellationToken,
    ) -> bool {
        if pending.is_empty() {
            return true;
        }
        let batch = std::mem::take(pending);
        tokio::select! {
            res = self.watch_events_tx.send(batch) => res.is_ok(),
            _ = token.cancelled() => false,
        }
    }

    /// Latch the watcher error state; emits an event and a user-visible log
    /// line on transitions only.
    pub(crate) fn set_watch_error(&self, err: Option<String>, next_try: Duration) {
        let prev = self.watch_handle.swap_error(err.clone());
        if prev != err {
            self.logger
                .log(Event::FolderWatchStateChanged(WatchStateChanged {
                    folder: self.cfg.id.clone(),
                    from: prev.clone(),
                    to: err.clone(),
                }));
        }
        let Some(message) = err else {
            return;
        };
        if prev.as_deref() != Some(message.as_str()) {
            info!(
                folder = self.description(),
                error = %message,
                retry_in = ?next_try,
                "failed to start filesystem watcher, retrying"
            );
        } else {
            debug!(
                folder = self.description(),
                error = %message,
                retry_in = ?next_try,
                "failed to start filesystem watcher, retrying"
            );
        }
    }
}
