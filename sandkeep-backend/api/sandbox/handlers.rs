use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::AppState;
use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::templates::CODE_INTERPRETER;
use crate::sandbox::types::{SandboxSpec, TimeoutOptions, team_headers};

use super::publish::{check_duration, parse_duration};

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.into() })))
}

fn sandbox_error(e: SandboxError) -> ApiError {
    let status = match &e {
        SandboxError::UnsupportedTemplate(_)
        | SandboxError::Unsupported(_)
        | SandboxError::Transfer(_)
        | SandboxError::Config(_) => StatusCode::BAD_REQUEST,
        SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::Transport(_) | SandboxError::Backend(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "sandbox request failed");
    } else {
        tracing::warn!(error = %e, "sandbox request rejected");
    }
    (status, Json(json!({ "error": e.to_string() })))
}

// ── Provider ────────────────────────────────────────────────────────

/// GET /api/provider
pub(crate) async fn provider(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": state.factory.provider_name(),
        "displayName": state.factory.display_name(),
    }))
}

/// GET /api/sandbox/info: provider kind and capabilities.
pub(crate) async fn sandbox_info(State(state): State<AppState>) -> Json<Value> {
    let info = state.factory.info();
    Json(json!({
        "provider": info.kind.name(),
        "displayName": info.kind.display_name(),
        "nativeExpiry": info.native_expiry,
        "supportsPortMapping": info.supports_port_mapping,
        "supportsCodeInterpreter": info.supports_code_interpreter,
    }))
}

/// GET /api/sandbox/tracked: sandboxes awaiting client-side expiry.
pub(crate) async fn sandbox_tracked(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sandboxes": state.factory.tracked() }))
}

// ── Create ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct FragmentFile {
    pub file_path: String,
    pub file_content: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum FragmentCode {
    Files(Vec<FragmentFile>),
    Source(String),
}

impl Default for FragmentCode {
    fn default() -> Self {
        FragmentCode::Source(String::new())
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Fragment {
    pub template: String,
    #[serde(default)]
    pub code: FragmentCode,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub has_additional_dependencies: bool,
    #[serde(default)]
    pub install_dependencies_command: Option<String>,
    #[serde(default)]
    pub additional_dependencies: Vec<String>,
}

impl Fragment {
    /// `(path, content)` pairs to write before running anything.
    fn files(&self) -> Result<Vec<(&str, &str)>, ApiError> {
        match &self.code {
            FragmentCode::Files(files) => Ok(files
                .iter()
                .map(|f| (f.file_path.as_str(), f.file_content.as_str()))
                .collect()),
            FragmentCode::Source(source) => {
                let path = self
                    .file_path
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| bad_request("fragment.file_path is required"))?;
                Ok(vec![(path, source.as_str())])
            }
        }
    }

    /// The cell an interpreter fragment runs: the source, or the first file.
    fn entry_code(&self) -> &str {
        match &self.code {
            FragmentCode::Source(source) => source,
            FragmentCode::Files(files) => files.first().map(|f| f.file_content.as_str()).unwrap_or(""),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSandboxBody {
    pub fragment: Fragment,
    #[serde(rename = "userID", default)]
    pub user_id: Option<String>,
    #[serde(rename = "teamID", default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub max_lifetime_ms: Option<u64>,
}

/// POST /api/sandbox: provision, install, write files, then run or expose.
pub(crate) async fn create_sandbox(
    State(state): State<AppState>,
    Json(body): Json<CreateSandboxBody>,
) -> Result<Json<Value>, ApiError> {
    let fragment = &body.fragment;
    let files = fragment.files()?;
    if body.max_lifetime_ms == Some(0) {
        return Err(bad_request("maxLifetimeMs must be greater than zero"));
    }

    let spec = SandboxSpec {
        template: fragment.template.clone(),
        user_id: body.user_id.clone(),
        team_id: body.team_id.clone(),
        access_token: body.access_token.clone(),
        max_lifetime: body.max_lifetime_ms.map(Duration::from_millis),
    };
    let sbx = state.factory.create_sandbox(spec).await.map_err(sandbox_error)?;

    match prepare_and_run(sbx.as_ref(), fragment, &files).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            if let Err(cleanup) = state.factory.destroy(sbx.id()).await {
                tracing::warn!(sandbox_id = %sbx.id(), error = %cleanup, "failed to destroy sandbox after error");
            }
            Err(sandbox_error(e))
        }
    }
}

async fn prepare_and_run(
    sbx: &dyn SandboxHandle,
    fragment: &Fragment,
    files: &[(&str, &str)],
) -> Result<Value, SandboxError> {
    if fragment.has_additional_dependencies {
        if let Some(command) = fragment
            .install_dependencies_command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        {
            let res = sbx.run_command(command).await?;
            if res.success() {
                tracing::info!(
                    sandbox_id = %sbx.id(),
                    dependencies = %fragment.additional_dependencies.join(", "),
                    "installed dependencies"
                );
            } else {
                tracing::warn!(
                    sandbox_id = %sbx.id(),
                    exit_code = res.exit_code,
                    stderr = %res.stderr.trim(),
                    "dependency install failed"
                );
            }
        }
    }

    for (path, content) in files {
        sbx.write_file(path, content.as_bytes()).await?;
        tracing::info!(sandbox_id = %sbx.id(), path = %path, "copied file");
    }

    if fragment.template == CODE_INTERPRETER {
        let transcript = sbx.run_code(fragment.entry_code()).await?;
        return Ok(json!({
            "sbxId": sbx.id(),
            "template": fragment.template,
            "stdout": transcript.stdout,
            "stderr": transcript.stderr,
            "runtimeError": transcript.error,
            "cellResults": transcript.results,
        }));
    }

    Ok(json!({
        "sbxId": sbx.id(),
        "template": fragment.template,
        "url": format!("https://{}", sbx.resolve_host(fragment.port.unwrap_or(80))),
    }))
}

// ── Timeout / delete ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TimeoutBody {
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "teamID", default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// POST /api/sandbox/{id}/timeout: extend a sandbox's lifetime (max 24 h).
pub(crate) async fn set_timeout(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TimeoutBody>,
) -> Result<Json<Value>, ApiError> {
    let duration = match (body.duration_ms, body.duration.as_deref()) {
        (Some(ms), _) => Duration::from_millis(ms),
        (None, Some(raw)) => parse_duration(raw).map_err(bad_request)?,
        (None, None) => return Err(bad_request("duration or durationMs is required")),
    };
    check_duration(duration).map_err(bad_request)?;
    if let Some(url) = body.url.as_deref() {
        state.host_policy.check(url).map_err(bad_request)?;
    }

    let options = TimeoutOptions {
        headers: team_headers(body.team_id.as_deref(), body.access_token.as_deref()),
    };
    state
        .factory
        .set_timeout(&id, duration, &options)
        .await
        .map_err(sandbox_error)?;
    tracing::info!(sandbox_id = %id, duration_ms = duration.as_millis() as u64, "sandbox timeout set");

    Ok(Json(json!({
        "sbxId": id,
        "timeoutMs": duration.as_millis() as u64,
        "url": body.url,
    })))
}

/// DELETE /api/sandbox/{id}
pub(crate) async fn delete_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.factory.destroy(&id).await.map_err(sandbox_error)?;
    Ok(Json(json!({ "sbxId": id, "deleted": true })))
}
