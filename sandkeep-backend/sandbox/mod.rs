pub mod archive;
pub mod backends;
pub mod daytona;
pub mod demux;
pub mod docker_engine;
pub mod e2b;
pub mod error;
pub mod factory;
pub mod handle;
pub mod ports;
pub mod provider;
pub mod reaper;
pub mod templates;
pub mod timeouts;
pub mod transcript;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

pub use error::SandboxError;
pub use factory::SandboxFactory;
pub use handle::SandboxHandle;
pub use provider::SandboxProvider;
pub use timeouts::{RegistryConfig, TimeoutRegistry};
pub use types::*;

use backends::{DaytonaProvider, DockerProvider, E2bProvider};

/// Build a sandbox provider from runtime config.
pub fn build_provider(
    config: SandboxRuntimeConfig,
) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
    match config {
        SandboxRuntimeConfig::E2b(c) => {
            tracing::info!(api_url = %c.api_url, domain = %c.domain, "initializing E2B sandbox provider");
            Ok(Arc::new(E2bProvider::new(c)))
        }
        SandboxRuntimeConfig::Daytona(c) => {
            tracing::info!(
                api_url = %c.api_url,
                target = %c.target,
                "initializing Daytona sandbox provider"
            );
            Ok(Arc::new(DaytonaProvider::new(c)))
        }
        SandboxRuntimeConfig::Docker(c) => {
            tracing::info!(
                endpoint = %c.endpoint,
                ports = %format!("{}-{}", c.port_range_start, c.port_range_end),
                "initializing Docker sandbox provider"
            );
            Ok(Arc::new(DockerProvider::new(c)?))
        }
    }
}

/// Provider plus registry, ready to be shared through app state.
pub fn build_factory(
    config: SandboxRuntimeConfig,
    registry: RegistryConfig,
    default_lifetime: Duration,
) -> Result<SandboxFactory, SandboxError> {
    SandboxFactory::new(build_provider(config)?, registry, default_lifetime)
}
