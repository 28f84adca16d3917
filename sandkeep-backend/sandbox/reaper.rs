use std::time::Duration;

use async_trait::async_trait;

use super::error::SandboxError;

/// Observed state of a backing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceState {
    pub running: bool,
}

/// Inspect / stop / remove, as needed by the timeout registry.
///
/// `stop` reports an already stopped resource as `NotRunning` and `remove`
/// reports a missing one as `NotFound`; the registry tolerates both.
#[async_trait]
pub trait ResourceReaper: Send + Sync {
    /// `Ok(None)` when the resource does not exist.
    async fn inspect(&self, id: &str) -> Result<Option<ResourceState>, SandboxError>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), SandboxError>;

    async fn remove(&self, id: &str) -> Result<(), SandboxError>;

    /// Called once the registry has reclaimed `id`, whether it was removed
    /// or already gone.
    fn on_reclaimed(&self, _id: &str) {}
}
