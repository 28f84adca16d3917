//! The selected provider plus, for backends without native expiry, the
//! timeout registry that reclaims its sandboxes.

use std::sync::Arc;
use std::time::Duration;

use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::timeouts::{RegistryConfig, TeardownOutcome, TimeoutRegistry, TrackedSandbox};
use crate::sandbox::types::*;

pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(10 * 60);

pub struct SandboxFactory {
    provider: Arc<dyn SandboxProvider>,
    registry: Option<TimeoutRegistry>,
    default_lifetime: Duration,
}

impl std::fmt::Debug for SandboxFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxFactory")
            .field("provider", &self.provider_name())
            .field("registry", &self.registry)
            .field("default_lifetime", &self.default_lifetime)
            .finish()
    }
}

impl SandboxFactory {
    /// Wrap `provider`, starting a registry when the backend needs one.
    /// Must run inside a tokio runtime.
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        registry_config: RegistryConfig,
        default_lifetime: Duration,
    ) -> Result<Self, SandboxError> {
        let info = provider.info();
        let registry = if info.native_expiry {
            None
        } else {
            let reaper = provider.reaper().ok_or_else(|| {
                SandboxError::Config(format!("{} has no native expiry and no reaper", info.kind))
            })?;
            tracing::info!(
                provider = %info.kind,
                sweep_interval_ms = registry_config.sweep_interval.as_millis() as u64,
                "starting timeout registry"
            );
            Some(TimeoutRegistry::start(reaper, registry_config))
        };
        Ok(Self {
            provider,
            registry,
            default_lifetime,
        })
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.info().kind.name()
    }

    pub fn display_name(&self) -> &'static str {
        self.provider.info().kind.display_name()
    }

    pub fn info(&self) -> SandboxProviderInfo {
        self.provider.info()
    }

    pub fn registry(&self) -> Option<&TimeoutRegistry> {
        self.registry.as_ref()
    }

    pub async fn create_sandbox(
        &self,
        mut spec: SandboxSpec,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let lifetime = *spec.max_lifetime.get_or_insert(self.default_lifetime);
        let handle = self.provider.provision(spec).await?;

        if let Some(registry) = &self.registry {
            registry.register(handle.id(), lifetime);
        }
        let metadata = handle.metadata();
        tracing::info!(
            sandbox_id = %handle.id(),
            template = %handle.template(),
            backend = %handle.backend_kind().name(),
            user_id = metadata.user_id.as_deref().unwrap_or("-"),
            team_id = metadata.team_id.as_deref().unwrap_or("-"),
            lifetime_ms = lifetime.as_millis() as u64,
            "sandbox created"
        );
        Ok(handle)
    }

    /// Check the backend once; used at startup to surface an unreachable daemon early.
    pub async fn check_backend(&self) -> Result<(), SandboxError> {
        self.provider.check().await
    }

    /// Extend (or set) a sandbox's lifetime, counted from now.
    pub async fn set_timeout(
        &self,
        id: &str,
        duration: Duration,
        options: &TimeoutOptions,
    ) -> Result<(), SandboxError> {
        match &self.registry {
            Some(registry) => {
                registry.extend(id, duration);
                Ok(())
            }
            None => self.provider.set_timeout(id, duration, options).await,
        }
    }

    pub async fn destroy(&self, id: &str) -> Result<(), SandboxError> {
        let Some(registry) = &self.registry else {
            return self.provider.destroy(id).await;
        };
        match registry.teardown(id).await {
            TeardownOutcome::Failed(reason) => Err(SandboxError::RemoveFailed(reason)),
            outcome => {
                tracing::info!(sandbox_id = %id, outcome = ?outcome, "sandbox destroyed");
                Ok(())
            }
        }
    }

    pub fn tracked(&self) -> Vec<TrackedSandbox> {
        self.registry
            .as_ref()
            .map(TimeoutRegistry::tracked)
            .unwrap_or_default()
    }

    /// Stop timers and the sweep. Sandboxes themselves are left running.
    pub fn shutdown(&self) {
        if let Some(registry) = &self.registry {
            registry.shutdown();
        }
    }
}
