//! Scanner (directory walker) contract.
//!
//! The walker owns directory traversal and block hashing; the controller
//! consumes its output stream and never walks the disk itself. Results
//! arrive on a channel so the walk runs concurrently with index
//! reconciliation.

use std::collections::VecDeque;
use std::sync::Mutex;

use strom_model::{FileRecord, ShortDeviceId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Parameters for one walk.
#[derive(Debug, Clone)]
pub struct WalkConfig {
    pub folder_id: String,
    /// Normalized scan roots; empty means the whole folder.
    pub subs: Vec<String>,
    pub ignore_perms: bool,
    pub auto_normalize: bool,
    pub short_id: ShortDeviceId,
    /// Flag bits to stamp on detected changes.
    pub local_flags: u32,
    pub mod_time_window_ns: i64,
}

/// One result from a walk.
#[derive(Debug, Clone)]
pub enum WalkItem {
    Entry(FileRecord),
    Failed { path: String, error: String },
}

pub trait Walker: Send + Sync {
    /// Full walk including block hashing.
    fn walk(&self, token: CancellationToken, cfg: WalkConfig) -> mpsc::Receiver<WalkItem>;

    /// Metadata-only walk, for folders that never look inside file content.
    fn walk_without_hashing(
        &self,
        token: CancellationToken,
        cfg: WalkConfig,
    ) -> mpsc::Receiver<WalkItem>;
}

/// Records one walk invocation, for assertions.
#[derive(Debug, Clone)]
pub struct WalkCall {
    pub cfg: WalkConfig,
    pub hashing: bool,
}

type WalkHook = Box<dyn Fn(&WalkCall) + Send + Sync>;

/// Walker fake fed from scripted result batches. Each walk pops the next
/// batch (an exhausted script yields empty walks) and records the call.
#[derive(Default)]
pub struct ScriptedWalker {
    script: Mutex<VecDeque<Vec<WalkItem>>>,
    calls: Mutex<Vec<WalkCall>>,
    on_walk: Mutex<Option<WalkHook>>,
}

impl ScriptedWalker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, items: Vec<WalkItem>) {
        self.script
            .lock()
            .expect("walker script poisoned")
            .push_back(items);
    }

    pub fn calls(&self) -> Vec<WalkCall> {
        self.calls.lock().expect("walker calls poisoned").clone()
    }

    /// Invoked at the start of every walk, before any item is emitted.
    pub fn set_on_walk(&self, hook: impl Fn(&WalkCall) + Send + Sync + 'static) {
        *self.on_walk.lock().expect("walker hook poisoned") = Some(Box::new(hook));
    }

    fn run(&self, _token: CancellationToken, cfg: WalkConfig, hashing: bool) -> mpsc::Receiver<WalkItem> {
        let call = WalkCall { cfg, hashing };
        if let Some(hook) = &*self.on_walk.lock().expect("walker hook poisoned") {
            hook(&call);
        }
        self.calls
            .lock()
            .expect("walker calls poisoned")
            .push(call);
        let items = self
            .script
            .lock()
            .expect("walker script poisoned")
            .pop_front()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(items.len().max(1));
        tokio::spawn(async move {
            for item in items {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}

impl Walker for ScriptedWalker {
    fn walk(&self, token: CancellationToken, cfg: WalkConfig) -> mpsc::Receiver<WalkItem> {
        self.run(token, cfg, true)
    }

    fn walk_without_hashing(
        &self,
        token: CancellationToken,
        cfg: WalkConfig,
    ) -> mpsc::Receiver<WalkItem> {
        self.run(token, cfg, false)
    }
}
