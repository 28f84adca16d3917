/// Errors from sandbox operations.
///
/// Backends map their internal errors into these variants. A non-zero exit
/// from user code is never one of these: it travels inside the successful
/// transcript. `NotFound` and `NotRunning` are tolerated by teardown.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("unsupported template: {0}")]
    UnsupportedTemplate(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox not running: {0}")]
    NotRunning(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("file transfer rejected: {0}")]
    Transfer(String),

    #[error("provision failed: {0}")]
    Provision(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("stop failed: {0}")]
    StopFailed(String),

    #[error("remove failed: {0}")]
    RemoveFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// True when the backing resource is already gone.
    pub fn is_already_gone(&self) -> bool {
        matches!(self, SandboxError::NotFound(_))
    }

    /// True for failures that mean the backend could not be reached at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, SandboxError::Transport(_))
    }
}
