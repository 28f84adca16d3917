//! Local Docker sandbox backend.
//!
//! One container per sandbox, named `sbx-<12 hex>`, created from the
//! template's image and kept alive until the timeout registry reclaims it.
//! Exposed template ports are published on host ports leased from the
//! `PortAllocator`. Docker has no notion of sandbox expiry, so the provider
//! hands a `DockerReaper` to the registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::sandbox::archive::{ArchiveTarget, single_file_archive};
use crate::sandbox::docker_engine::models::{ContainerCreateBody, HostConfig, PortBinding};
use crate::sandbox::docker_engine::{ArchiveUpload, DockerEngine, ExecOutput};
use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::ports::PortAllocator;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::reaper::{ResourceReaper, ResourceState};
use crate::sandbox::templates::resolve_docker;
use crate::sandbox::transcript;
use crate::sandbox::types::*;

const CODE_FILE: &str = "/tmp/exec_code.py";

// ── Provider ────────────────────────────────────────────────────────

pub struct DockerProvider {
    engine: DockerEngine,
    config: DockerConfig,
    ports: Arc<PortAllocator>,
    reaper: Arc<DockerReaper>,
}

impl DockerProvider {
    pub fn new(config: DockerConfig) -> Result<Self, SandboxError> {
        let engine = DockerEngine::new(config.endpoint.clone());
        let mut ports = PortAllocator::new(config.port_range_start, config.port_range_end)?;
        if !config.endpoint.is_local() {
            tracing::info!(endpoint = %config.endpoint, "remote docker engine, host ports guarded by leases only");
            ports = ports.without_bind_check();
        }
        let ports = Arc::new(ports);
        let reaper = Arc::new(DockerReaper {
            engine: engine.clone(),
            ports: ports.clone(),
        });
        Ok(Self {
            engine,
            config,
            ports,
            reaper,
        })
    }

    #[cfg(test)]
    pub(crate) fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    async fn create_and_start(
        &self,
        id: &str,
        body: &ContainerCreateBody,
    ) -> Result<(), SandboxError> {
        self.engine.create_container(id, body).await?;
        self.engine.start_container(id).await
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn info(&self) -> SandboxProviderInfo {
        SandboxProviderInfo {
            kind: SandboxBackendKind::Docker,
            native_expiry: false,
            supports_port_mapping: true,
            supports_code_interpreter: true,
        }
    }

    async fn provision(&self, spec: SandboxSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let template = resolve_docker(&spec.template, &self.config.image_overrides)?;
        let id = new_container_name();

        let host_ports = self.ports.allocate_many(&id, template.exposed_ports.len())?;
        let mappings: Vec<PortMapping> = template
            .exposed_ports
            .iter()
            .zip(&host_ports)
            .map(|(&container_port, &host_port)| PortMapping {
                container_port,
                host_port,
            })
            .collect();

        let metadata = SandboxMetadata::from_spec(&spec);
        let body = ContainerCreateBody {
            image: template.image.clone(),
            cmd: template.command.clone(),
            labels: metadata.labels(),
            working_dir: SANDBOX_HOME.to_string(),
            tty: false,
            exposed_ports: mappings
                .iter()
                .map(|m| (format!("{}/tcp", m.container_port), json!({})))
                .collect(),
            host_config: HostConfig {
                port_bindings: port_bindings(&mappings),
            },
        };

        tracing::info!(
            sandbox_id = %id,
            template = %spec.template,
            image = %template.image,
            ports = ?mappings,
            "creating docker sandbox"
        );

        if let Err(e) = self.create_and_start(&id, &body).await {
            tracing::error!(sandbox_id = %id, error = %e, "docker sandbox creation failed");
            self.ports.release_owner(&id);
            if !e.is_transport() {
                if let Err(cleanup) = self.engine.remove_container(&id).await {
                    if !cleanup.is_already_gone() {
                        tracing::warn!(sandbox_id = %id, error = %cleanup, "failed to clean up partial container");
                    }
                }
            }
            return Err(e);
        }

        tracing::info!(sandbox_id = %id, template = %spec.template, "docker sandbox running");

        Ok(Box::new(DockerSandbox {
            id,
            engine: self.engine.clone(),
            metadata,
            mappings,
            public_host: self.config.endpoint.public_host().to_string(),
            interpreter: template.interpreter,
            max_output_bytes: self.config.max_output_bytes,
        }))
    }

    async fn check(&self) -> Result<(), SandboxError> {
        self.engine.ping().await
    }

    async fn destroy(&self, id: &str) -> Result<(), SandboxError> {
        let result = async {
            match self.reaper.stop(id, Duration::from_secs(5)).await {
                Ok(()) | Err(SandboxError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
            self.reaper.remove(id).await
        }
        .await;
        match result {
            Ok(()) | Err(SandboxError::NotFound(_)) => {
                self.reaper.on_reclaimed(id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn reaper(&self) -> Option<Arc<dyn ResourceReaper>> {
        Some(self.reaper.clone())
    }
}

fn new_container_name() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("sbx-{}", &hex[..12])
}

fn port_bindings(mappings: &[PortMapping]) -> BTreeMap<String, Vec<PortBinding>> {
    mappings
        .iter()
        .map(|m| {
            (
                format!("{}/tcp", m.container_port),
                vec![PortBinding {
                    host_ip: "0.0.0.0".into(),
                    host_port: m.host_port.to_string(),
                }],
            )
        })
        .collect()
}

// ── Reaper ──────────────────────────────────────────────────────────

pub struct DockerReaper {
    engine: DockerEngine,
    ports: Arc<PortAllocator>,
}

#[async_trait]
impl ResourceReaper for DockerReaper {
    async fn inspect(&self, id: &str) -> Result<Option<ResourceState>, SandboxError> {
        Ok(self
            .engine
            .inspect_container(id)
            .await?
            .map(|c| ResourceState {
                running: c.state.running,
            }))
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), SandboxError> {
        self.engine.stop_container(id, grace).await
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        self.engine.remove_container(id).await
    }

    fn on_reclaimed(&self, id: &str) {
        self.ports.release_owner(id);
    }
}

// ── Handle ──────────────────────────────────────────────────────────

pub struct DockerSandbox {
    id: String,
    engine: DockerEngine,
    metadata: SandboxMetadata,
    mappings: Vec<PortMapping>,
    public_host: String,
    interpreter: bool,
    max_output_bytes: usize,
}

impl DockerSandbox {
    async fn exec(&self, cmd: &[&str]) -> Result<ExecOutput, SandboxError> {
        self.engine
            .exec(
                &self.id,
                cmd.iter().map(|s| s.to_string()).collect(),
                SANDBOX_HOME,
                self.max_output_bytes,
            )
            .await
    }

    async fn make_dir(&self, dir: &str) -> Result<(), SandboxError> {
        let out = self.exec(&["mkdir", "-p", dir]).await?;
        if out.exit_code != 0 {
            return Err(SandboxError::Transfer(format!(
                "mkdir -p {dir} exited with {}: {}",
                out.exit_code,
                out.output.stderr_lossy().trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxHandle for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn template(&self) -> &str {
        &self.metadata.template
    }

    fn backend_kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::Docker
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
        let out = self.exec(&["python3", CODE_FILE]).await?;
        tracing::debug!(sandbox_id = %self.id, exit_code = out.exit_code, "code cell finished");
        Ok(transcript::from_process_output(
            &out.output.stdout_lossy(),
            &out.output.stderr_lossy(),
            out.exit_code,
        ))
    }

    async fn run_command(&self, command: &str) -> Result<CommandResult, SandboxError> {
        let out = self.exec(&["sh", "-c", command]).await?;
        Ok(CommandResult {
            stdout: out.output.stdout_lossy(),
            stderr: out.output.stderr_lossy(),
            exit_code: out.exit_code,
        })
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        let target = ArchiveTarget::resolve(path)?;
        let archive = single_file_archive(&target.file_name, content)?;

        let uploaded = self
            .engine
            .put_archive(&self.id, &target.parent, archive.clone())
            .await?;
        if uploaded == ArchiveUpload::Extracted {
            tracing::debug!(sandbox_id = %self.id, path = %target.full_path(), bytes = content.len(), "file written");
            return Ok(());
        }

        self.make_dir(&target.parent).await?;
        match self.engine.put_archive(&self.id, &target.parent, archive).await? {
            ArchiveUpload::Extracted => {
                tracing::debug!(sandbox_id = %self.id, path = %target.full_path(), bytes = content.len(), "file written");
                Ok(())
            }
            ArchiveUpload::MissingDirectory => Err(SandboxError::Transfer(format!(
                "{} still missing after mkdir",
                target.parent
            ))),
        }
    }

    fn resolve_host(&self, port: u16) -> String {
        let host_port = self
            .mappings
            .iter()
            .find(|m| m.container_port == port)
            .map(|m| m.host_port)
            .unwrap_or(port);
        format!("{}:{host_port}", self.public_host)
    }

    fn port_mappings(&self) -> &[PortMapping] {
        &self.mappings
    }
}
