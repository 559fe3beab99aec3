//! Contract of the external puller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

/// Fetches needed content from peers and writes it locally. One pull attempt
/// covers everything currently needed; `true` means the attempt succeeded and
/// need not be retried soon.
#[async_trait]
pub trait Puller: Send + Sync {
    async fn pull(&self) -> bool;
}

/// Puller fake returning scripted results (exhausted script means success).
#[derive(Default)]
pub struct ScriptedPuller {
    results: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
}

impl ScriptedPuller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, result: bool) {
        self.results
            .lock()
            .expect("puller script poisoned")
            .push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Puller for ScriptedPuller {
    async fn pull(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .lock()
            .expect("puller script poisoned")
            .pop_front()
            .unwrap_or(true)
    }
}
