//! Contract of the version-history keeper.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Retains or prunes old versions of changed files. Optional; folders without
/// versioning never arm the cleanup timer.
#[async_trait]
pub trait Versioner: Send + Sync {
    async fn clean(&self, token: &CancellationToken) -> Result<()>;
}
