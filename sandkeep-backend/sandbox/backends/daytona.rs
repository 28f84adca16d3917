//! Daytona sandbox backend.
//!
//! Daytona offers no expiry we can drive per request, so its sandboxes are
//! handed to the timeout registry through `DaytonaReaper`, same as Docker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::sandbox::archive::ArchiveTarget;
use crate::sandbox::daytona::DaytonaClient;
use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::reaper::{ResourceReaper, ResourceState};
use crate::sandbox::templates::{daytona_language, is_interpreter};
use crate::sandbox::transcript;
use crate::sandbox::types::*;

const CODE_FILE: &str = "/tmp/exec_code.py";

pub struct DaytonaProvider {
    client: DaytonaClient,
    preview_domain: String,
    reaper: Arc<DaytonaReaper>,
}

impl DaytonaProvider {
    pub fn new(config: DaytonaConfig) -> Self {
        let client = DaytonaClient::new(&config);
        Self {
            reaper: Arc::new(DaytonaReaper {
                client: client.clone(),
            }),
            client,
            preview_domain: config.preview_domain,
        }
    }
}

#[async_trait]
impl SandboxProvider for DaytonaProvider {
    fn info(&self) -> SandboxProviderInfo {
        SandboxProviderInfo {
            kind: SandboxBackendKind::Daytona,
            native_expiry: false,
            supports_port_mapping: false,
            supports_code_interpreter: true,
        }
    }

    async fn provision(&self, spec: SandboxSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let language = daytona_language(&spec.template)?;
        let metadata = SandboxMetadata::from_spec(&spec);

        let created = self.client.create_sandbox(language, metadata.labels()).await?;
        if let Err(e) = self.client.wait_started(&created.id).await {
            tracing::error!(sandbox_id = %created.id, error = %e, "Daytona sandbox failed to start");
            if let Err(cleanup) = self.client.delete_sandbox(&created.id).await {
                if !cleanup.is_already_gone() {
                    tracing::warn!(sandbox_id = %created.id, error = %cleanup, "failed to clean up Daytona sandbox");
                }
            }
            return Err(e);
        }
        tracing::info!(sandbox_id = %created.id, template = %spec.template, language, "Daytona sandbox started");

        Ok(Box::new(DaytonaSandbox {
            id: created.id,
            client: self.client.clone(),
            preview_domain: self.preview_domain.clone(),
            interpreter: is_interpreter(&spec.template),
            metadata,
        }))
    }

    async fn destroy(&self, id: &str) -> Result<(), SandboxError> {
        match self.client.delete_sandbox(id).await {
            Ok(()) | Err(SandboxError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn reaper(&self) -> Option<Arc<dyn ResourceReaper>> {
        Some(self.reaper.clone())
    }
}

// ── Reaper ──────────────────────────────────────────────────────────

pub struct DaytonaReaper {
    client: DaytonaClient,
}

#[async_trait]
impl ResourceReaper for DaytonaReaper {
    async fn inspect(&self, id: &str) -> Result<Option<ResourceState>, SandboxError> {
        Ok(self.client.get_sandbox(id).await?.map(|s| ResourceState {
            running: s.is_started(),
        }))
    }

    /// Daytona stops on its own schedule; `grace` is not forwarded.
    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), SandboxError> {
        self.client.stop_sandbox(id).await
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        self.client.delete_sandbox(id).await
    }
}

// ── Handle ──────────────────────────────────────────────────────────

pub struct DaytonaSandbox {
    id: String,
    client: DaytonaClient,
    preview_domain: String,
    interpreter: bool,
    metadata: SandboxMetadata,
}

#[async_trait]
impl SandboxHandle for DaytonaSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn template(&self) -> &str {
        &self.metadata.template
    }

    fn backend_kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::Daytona
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
        self.write_file(CODE_FILE, code.as_bytes()).await?;
        let res = self.client.execute(&self.id, &format!("python3 {CODE_FILE}")).await?;
        tracing::debug!(sandbox_id = %self.id, exit_code = res.exit_code, "code cell finished");

        // The toolbox merges both streams; on failure the output ends with
        // the traceback, so it is read as stderr.
        Ok(if res.exit_code == 0 {
            transcript::from_process_output(&res.result, "", 0)
        } else {
            transcript::from_process_output("", &res.result, res.exit_code)
        })
    }

    async fn run_command(&self, command: &str) -> Result<CommandResult, SandboxError> {
        let res = self.client.execute(&self.id, command).await?;
        Ok(CommandResult {
            stdout: res.result,
            stderr: String::new(),
            exit_code: res.exit_code,
        })
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        let target = ArchiveTarget::resolve(path)?;
        self.client.create_folder(&self.id, &target.parent).await?;
        self.client
            .upload_file(&self.id, &target.full_path(), content)
            .await?;
        tracing::debug!(sandbox_id = %self.id, path = %target.full_path(), bytes = content.len(), "file written");
        Ok(())
    }

    fn resolve_host(&self, port: u16) -> String {
        format!("{port}-{}.{}", self.id, self.preview_domain)
    }

    fn port_mappings(&self) -> &[PortMapping] {
        &[]
    }
}
