use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::error::SandboxError;
use super::handle::SandboxHandle;
use super::reaper::ResourceReaper;
use super::types::{SandboxProviderInfo, SandboxSpec, TimeoutOptions};

/// Creates sandboxes on one backend.
///
/// One provider is selected at startup and shared through the factory.
/// Backends without server-side expiry expose a `ResourceReaper` so the
/// timeout registry can tear their sandboxes down.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Metadata about this provider (backend kind, capability flags).
    fn info(&self) -> SandboxProviderInfo;

    /// Create a new sandbox from the given spec.
    async fn provision(&self, spec: SandboxSpec) -> Result<Box<dyn SandboxHandle>, SandboxError>;

    /// Backend-native expiry. Only called when `info().native_expiry` is set.
    async fn set_timeout(
        &self,
        _id: &str,
        _duration: Duration,
        _options: &TimeoutOptions,
    ) -> Result<(), SandboxError> {
        Err(SandboxError::Unsupported("backend has no native sandbox timeout"))
    }

    /// Cheap reachability check of the backend.
    async fn check(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Destroy a sandbox directly, bypassing any registry.
    async fn destroy(&self, id: &str) -> Result<(), SandboxError>;

    /// Teardown capability for registry-managed backends.
    fn reaper(&self) -> Option<Arc<dyn ResourceReaper>> {
        None
    }
}
