//! Process-wide cap on concurrent heavy I/O.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};

/// Bounds concurrent heavy I/O (scans, pulls) across every folder in the
/// process. Constructed once by the host and injected into each controller.
pub struct IoLimiter {
    sem: Arc<Semaphore>,
}

impl IoLimiter {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            sem: Arc::new(Semaphore::new(capacity.max(1))),
        })
    }

    /// Acquire one token, racing cancellation. The returned permit gives the
    /// token back when dropped, on every exit path.
    pub async fn take(&self, token: &CancellationToken) -> Result<IoPermit> {
        tokio::select! {
            permit = Arc::clone(&self.sem).acquire_owned() => match permit {
                Ok(permit) => Ok(IoPermit { _permit: permit }),
                Err(_) => Err(SyncError::Cancelled),
            },
            _ = token.cancelled() => Err(SyncError::Cancelled),
        }
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

pub struct IoPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_return_on_drop() {
        let limiter = IoLimiter::new(1);
        let token = CancellationToken::new();
        let permit = limiter.take(&token).await.unwrap();
        assert_eq!(limiter.available(), 0);
        drop(permit);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn cancelled_acquire_fails() {
        let limiter = IoLimiter::new(1);
        let token = CancellationToken::new();
        let _held = limiter.take(&token).await.unwrap();
        token.cancel();
        assert!(matches!(
            limiter.take(&token).await,
            Err(SyncError::Cancelled)
        ));
    }
}
