use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Sandbox identity ────────────────────────────────────────────────

pub type SandboxId = String;

/// Working directory inside every sandbox; relative paths resolve here.
pub const SANDBOX_HOME: &str = "/home/user";

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxBackendKind {
    E2b,
    Daytona,
    Docker,
}

impl SandboxBackendKind {
    /// Stable lowercase name, as accepted by `SANDBOX_PROVIDER`.
    pub fn name(self) -> &'static str {
        match self {
            SandboxBackendKind::E2b => "e2b",
            SandboxBackendKind::Daytona => "daytona",
            SandboxBackendKind::Docker => "docker",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            SandboxBackendKind::E2b => "E2B",
            SandboxBackendKind::Daytona => "Daytona",
            SandboxBackendKind::Docker => "Docker",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "e2b" => Some(SandboxBackendKind::E2b),
            "daytona" => Some(SandboxBackendKind::Daytona),
            "docker" => Some(SandboxBackendKind::Docker),
            _ => None,
        }
    }
}

impl std::fmt::Display for SandboxBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Provider info ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxProviderInfo {
    pub kind: SandboxBackendKind,
    /// The backend expires sandboxes server-side; no registry needed.
    pub native_expiry: bool,
    pub supports_port_mapping: bool,
    pub supports_code_interpreter: bool,
}

// ── Provision request ───────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    pub template: String,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub access_token: Option<String>,
    pub max_lifetime: Option<Duration>,
}

impl SandboxSpec {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub(crate) fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Team headers forwarded to backends that bill per team.
    pub fn team_headers(&self) -> BTreeMap<String, String> {
        team_headers(self.team_id.as_deref(), self.access_token.as_deref())
    }
}

/// `X-Supabase-Team` / `X-Supabase-Token`, only when both are present.
pub fn team_headers(team_id: Option<&str>, access_token: Option<&str>) -> BTreeMap<String, String> {
    match (team_id, access_token) {
        (Some(team), Some(token)) if !team.is_empty() && !token.is_empty() => BTreeMap::from([
            ("X-Supabase-Team".to_string(), team.to_string()),
            ("X-Supabase-Token".to_string(), token.to_string()),
        ]),
        _ => BTreeMap::new(),
    }
}

// ── Metadata / ports ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxMetadata {
    pub template: String,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub created_at_unix_ms: i64,
}

impl SandboxMetadata {
    pub fn from_spec(spec: &SandboxSpec) -> Self {
        Self {
            template: spec.template.clone(),
            user_id: spec.user_id.clone(),
            team_id: spec.team_id.clone(),
            created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Labels attached to the backing resource (advisory ownership tag).
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            ("sandkeep.template".to_string(), self.template.clone()),
            ("sandkeep.managed".to_string(), "true".to_string()),
        ]);
        if let Some(user) = &self.user_id {
            labels.insert("sandkeep.user".into(), user.clone());
        }
        if let Some(team) = &self.team_id {
            labels.insert("sandkeep.team".into(), team.clone());
        }
        labels
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

// ── Execution results ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub name: String,
    pub value: String,
    pub traceback: String,
}

/// One rich result of a code cell. `text` is the plain representation;
/// other formats (html, png, ...) are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub formats: BTreeMap<String, serde_json::Value>,
}

impl CellResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            formats: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionTranscript {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub error: Option<ExecutionError>,
    pub results: Vec<CellResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Split captured output into transcript lines, dropping blank ones.
pub fn transcript_lines(output: &str) -> Vec<String> {
    output
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(String::from)
        .collect()
}

// ── Timeout request options ─────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TimeoutOptions {
    pub headers: BTreeMap<String, String>,
}

// ── Backend configs ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct E2bConfig {
    pub api_key: String,
    pub api_url: String,
    /// Domain under which sandbox hosts are published (`{port}-{id}.{domain}`).
    pub domain: String,
    /// One base URL serving every sandbox's data plane (`E2B_SANDBOX_URL`),
    /// such as a local emulator. Unset means `https://{port}-{id}.{domain}`.
    pub sandbox_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DaytonaConfig {
    pub api_key: String,
    pub api_url: String,
    pub target: String,
    pub preview_domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl DockerEndpoint {
    /// Host that published container ports are reachable on.
    pub fn public_host(&self) -> &str {
        match self {
            DockerEndpoint::Unix(_) => "localhost",
            DockerEndpoint::Tcp { host, .. } => host,
        }
    }

    /// True when the engine runs on this machine.
    pub fn is_local(&self) -> bool {
        match self {
            DockerEndpoint::Unix(_) => true,
            DockerEndpoint::Tcp { host, .. } => {
                host.eq_ignore_ascii_case("localhost")
                    || host
                        .trim_matches(|c| c == '[' || c == ']')
                        .parse::<std::net::IpAddr>()
                        .is_ok_and(|ip| ip.is_loopback())
            }
        }
    }
}

impl std::fmt::Display for DockerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DockerEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            DockerEndpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub endpoint: DockerEndpoint,
    /// Per-template image overrides (`SANDBOX_DOCKER_IMAGES`).
    pub image_overrides: BTreeMap<String, String>,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub max_output_bytes: usize,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            endpoint: DockerEndpoint::Unix(PathBuf::from("/var/run/docker.sock")),
            image_overrides: BTreeMap::new(),
            port_range_start: 30000,
            port_range_end: 39999,
            max_output_bytes: 10 * 1024 * 1024, // 10 MB
        }
    }
}

// ── Runtime config selector ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SandboxRuntimeConfig {
    E2b(E2bConfig),
    Daytona(DaytonaConfig),
    Docker(DockerConfig),
}

impl SandboxRuntimeConfig {
    pub fn kind(&self) -> SandboxBackendKind {
        match self {
            SandboxRuntimeConfig::E2b(_) => SandboxBackendKind::E2b,
            SandboxRuntimeConfig::Daytona(_) => SandboxBackendKind::Daytona,
            SandboxRuntimeConfig::Docker(_) => SandboxBackendKind::Docker,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
