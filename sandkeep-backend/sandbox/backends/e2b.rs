//! E2B sandbox backend.
//!
//! E2B owns expiry: the lifetime travels as the creation timeout and later
//! extensions go straight to the service. Nothing here is registry-managed.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::sandbox::archive::ArchiveTarget;
use crate::sandbox::e2b::{CreateSandboxRequest, E2bClient};
use crate::sandbox::error::SandboxError;
use crate::sandbox::factory::DEFAULT_LIFETIME;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::templates;
use crate::sandbox::types::*;

pub struct E2bProvider {
    client: E2bClient,
}

impl E2bProvider {
    pub fn new(config: E2bConfig) -> Self {
        Self {
            client: E2bClient::new(&config),
        }
    }
}

/// E2B counts timeouts in whole seconds; round up so short lifetimes survive.
fn timeout_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 { secs + 1 } else { secs }.max(1)
}

#[async_trait]
impl SandboxProvider for E2bProvider {
    fn info(&self) -> SandboxProviderInfo {
        SandboxProviderInfo {
            kind: SandboxBackendKind::E2b,
            native_expiry: true,
            supports_port_mapping: false,
            supports_code_interpreter: true,
        }
    }

    async fn provision(&self, spec: SandboxSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let metadata = SandboxMetadata::from_spec(&spec);
        let lifetime = spec.max_lifetime.unwrap_or(DEFAULT_LIFETIME);
        let req = CreateSandboxRequest {
            template_id: spec.template.clone(),
            timeout: timeout_secs(lifetime),
            metadata: BTreeMap::from_iter(
                metadata
                    .labels()
                    .into_iter()
                    .map(|(k, v)| (k.replace('.', "_"), v)),
            ),
        };

        let created = self.client.create_sandbox(&req, &spec.team_headers()).await?;
        Ok(Box::new(E2bSandbox {
            id: created.sandbox_id,
            access_token: created.envd_access_token,
            client: self.client.clone(),
            interpreter: templates::is_interpreter(&spec.template),
            metadata,
        }))
    }

    async fn set_timeout(
        &self,
        id: &str,
        duration: Duration,
        options: &TimeoutOptions,
    ) -> Result<(), SandboxError> {
        self.client
            .set_timeout(id, timeout_secs(duration), &options.headers)
            .await
    }

    async fn destroy(&self, id: &str) -> Result<(), SandboxError> {
        match self.client.kill(id).await {
            Ok(()) => Ok(()),
            Err(SandboxError::NotFound(_)) => {
                tracing::info!(sandbox_id = %id, "E2B sandbox already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────

pub struct E2bSandbox {
    id: String,
    access_token: Option<String>,
    client: E2bClient,
    interpreter: bool,
    metadata: SandboxMetadata,
}

#[async_trait]
impl SandboxHandle for E2bSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn template(&self) -> &str {
        &self.metadata.template
    }

    fn backend_kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::E2b
    }

    fn metadata(&self) -> &SandboxMetadata {
        &self.metadata
    }

    async fn run_code(&self, code: &str) -> Result<ExecutionTranscript, SandboxError> {
        if !self.interpreter {
            return Err(SandboxError::Unsupported(
                "code execution needs an interpreter template",
            ));
        }
        let transcript = self
            .client
            .execute(&self.id, self.access_token.as_deref(), code)
            .await?;
        tracing::debug!(
            sandbox_id = %self.id,
            results = transcript.results.len(),
            failed = transcript.error.is_some(),
            "code cell finished"
        );
        Ok(transcript)
    }

    async fn run_command(&self, command: &str) -> Result<CommandResult, SandboxError> {
        self.client
            .run_process(&self.id, self.access_token.as_deref(), command)
            .await
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        let target = ArchiveTarget::resolve(path)?;
        self.client
            .upload_file(&self.id, self.access_token.as_deref(), &target.full_path(), content)
            .await?;
        tracing::debug!(sandbox_id = %self.id, path = %target.full_path(), bytes = content.len(), "file written");
        Ok(())
    }

    fn resolve_host(&self, port: u16) -> String {
        self.client.host(&self.id, port)
    }

    fn port_mappings(&self) -> &[PortMapping] {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rounds_up_to_whole_seconds() {
        assert_eq!(timeout_secs(Duration::from_secs(600)), 600);
        assert_eq!(timeout_secs(Duration::from_millis(1500)), 2);
        assert_eq!(timeout_secs(Duration::from_millis(10)), 1);
        assert_eq!(timeout_secs(Duration::ZERO), 1);
    }

    #[test]
    fn provider_reports_native_expiry() {
        let provider = E2bProvider::new(E2bConfig {
            api_key: "k".into(),
            api_url: "https://api.e2b.dev".into(),
            domain: "e2b.app".into(),
            sandbox_url: None,
        });
        let info = provider.info();
        assert!(info.native_expiry);
        assert_eq!(info.kind, SandboxBackendKind::E2b);
        assert!(provider.reaper().is_none());
    }

    #[test]
    fn handle_resolves_e2b_host() {
        let sandbox = E2bSandbox {
            id: "i123".into(),
            access_token: None,
            client: E2bClient::new(&E2bConfig {
                api_key: "k".into(),
                api_url: "https://api.e2b.dev".into(),
                domain: "e2b.app".into(),
                sandbox_url: None,
            }),
            interpreter: false,
            metadata: SandboxMetadata::from_spec(&SandboxSpec::new("nextjs-developer")),
        };
        assert_eq!(sandbox.resolve_host(3000), "3000-i123.e2b.app");
        assert!(sandbox.port_mappings().is_empty());
    }

    #[tokio::test]
    async fn web_template_rejects_run_code() {
        let sandbox = E2bSandbox {
            id: "i123".into(),
            access_token: None,
            client: E2bClient::new(&E2bConfig {
                api_key: "k".into(),
                api_url: "http://127.0.0.1:9".into(),
                domain: "e2b.app".into(),
                sandbox_url: None,
            }),
            interpreter: false,
            metadata: SandboxMetadata::from_spec(&SandboxSpec::new("nextjs-developer")),
        };
        assert!(matches!(
            sandbox.run_code("print(1)").await,
            Err(SandboxError::Unsupported(_))
        ));
    }
}
