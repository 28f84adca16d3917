use async_trait::async_trait;

use super::error::SandboxError;
use super::types::*;

/// Handle to a running sandbox.
///
/// Backends implement this trait. Operations a template cannot serve (code
/// execution on a web template) return `SandboxError::Unsupported`. A
/// non-zero exit from user code is reported inside the result, never as an
/// error.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn id(&self) -> &str;
    fn template(&self) -> &str;
    fn backend_kind(&self) -> SandboxBackendKind;
    fn metadata(&self) -> &SandboxMetadata;

    // ── Exec ────────────────────────────────────────────────────

    /// Run a code cell in the template's interpreter.
    async fn run_code(&self, code: &str) -> Result<ExecutionTranscript, SandboxError>;

    /// Run a shell command to completion, capturing stdout/stderr.
    async fn run_command(&self, command: &str) -> Result<CommandResult, SandboxError>;

    // ── Files ───────────────────────────────────────────────────

    /// Create or overwrite `path`, creating missing parent directories.
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError>;

    // ── Ports ───────────────────────────────────────────────────

    /// Public `host:port` under which `port` inside the sandbox is reachable.
    fn resolve_host(&self, port: u16) -> String;

    fn port_mappings(&self) -> &[PortMapping];
}
