//! HTTP client for the E2B sandbox service.
//!
//! Control plane: `POST /sandboxes`, `POST /sandboxes/{id}/timeout`,
//! `DELETE /sandboxes/{id}` on `E2B_API_URL`, authenticated with `X-API-Key`.
//! Data plane: every sandbox is reachable at `https://{port}-{id}.{domain}`;
//! the code interpreter listens on 49999 (`/execute`, NDJSON) and envd on
//! 49983 (Connect process service and `/files`). `E2B_SANDBOX_URL` routes
//! the data plane through one base URL instead.

pub mod envd;

use std::collections::BTreeMap;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::*;

use envd::{EnvelopeDecoder, ProcessOutput, StartRequest, encode_envelope};

pub const INTERPRETER_PORT: u16 = 49999;
pub const ENVD_PORT: u16 = 49983;
const ENVD_USER: &str = "user";

// ── Request / Response types ────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxRequest {
    #[serde(rename = "templateID")]
    pub template_id: String,
    /// Seconds until the service kills the sandbox.
    pub timeout: u64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSandbox {
    #[serde(rename = "sandboxID")]
    pub sandbox_id: String,
    #[serde(rename = "clientID", default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub envd_access_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct TimeoutRequest {
    timeout: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
    language: &'a str,
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct E2bClient {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
    domain: String,
    sandbox_url: Option<String>,
}

impl E2bClient {
    pub fn new(config: &E2bConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            domain: config.domain.clone(),
            sandbox_url: config.sandbox_url.clone(),
        }
    }

    pub fn host(&self, sandbox_id: &str, port: u16) -> String {
        format!("{port}-{sandbox_id}.{}", self.domain)
    }

    fn sandbox_url(&self, sandbox_id: &str, port: u16, path: &str) -> String {
        match &self.sandbox_url {
            Some(base) => format!("{base}{path}"),
            None => format!("https://{}{path}", self.host(sandbox_id, port)),
        }
    }

    fn control(&self, method: reqwest::Method, path: &str, headers: &BTreeMap<String, String>) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{path}", self.api_url))
            .header("X-API-Key", &self.api_key);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        req
    }

    pub async fn create_sandbox(
        &self,
        req: &CreateSandboxRequest,
        headers: &BTreeMap<String, String>,
    ) -> Result<CreatedSandbox, SandboxError> {
        tracing::info!(template = %req.template_id, timeout_secs = req.timeout, "creating E2B sandbox");
        let resp = self
            .control(reqwest::Method::POST, "/sandboxes", headers)
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("E2B create failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 400 || status.as_u16() == 404 {
            let body = resp.text().await.unwrap_or_default();
            if body.to_ascii_lowercase().contains("template") {
                return Err(SandboxError::UnsupportedTemplate(req.template_id.clone()));
            }
            return Err(SandboxError::Provision(format!("E2B create returned {status}: {body}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Provision(format!("E2B create returned {status}: {body}")));
        }

        let created = resp
            .json::<CreatedSandbox>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse E2B sandbox: {e}")))?;
        tracing::info!(sandbox_id = %created.sandbox_id, "E2B sandbox created");
        Ok(created)
    }

    pub async fn set_timeout(
        &self,
        sandbox_id: &str,
        timeout_secs: u64,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), SandboxError> {
        let resp = self
            .control(reqwest::Method::POST, &format!("/sandboxes/{sandbox_id}/timeout"), headers)
            .json(&TimeoutRequest {
                timeout: timeout_secs,
            })
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("E2B set timeout failed: {e}")))?;

        match resp.status().as_u16() {
            200..=299 => {
                tracing::info!(sandbox_id = %sandbox_id, timeout_secs, "E2B sandbox timeout set");
                Ok(())
            }
            404 => Err(SandboxError::NotFound(sandbox_id.to_string())),
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(SandboxError::Backend(format!("E2B set timeout returned {status}: {body}")))
            }
        }
    }

    pub async fn kill(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        tracing::info!(sandbox_id = %sandbox_id, "killing E2B sandbox");
        let resp = self
            .control(reqwest::Method::DELETE, &format!("/sandboxes/{sandbox_id}"), &BTreeMap::new())
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("E2B kill failed: {e}")))?;

        match resp.status().as_u16() {
            200..=299 => Ok(()),
            404 => Err(SandboxError::NotFound(sandbox_id.to_string())),
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(SandboxError::RemoveFailed(format!("E2B kill returned {status}: {body}")))
            }
        }
    }

    fn with_access_token(req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
        match token {
            Some(token) => req.header("X-Access-Token", token),
            None => req,
        }
    }

    /// Run a code cell on the sandbox's interpreter.
    pub async fn execute(
        &self,
        sandbox_id: &str,
        access_token: Option<&str>,
        code: &str,
    ) -> Result<ExecutionTranscript, SandboxError> {
        let req = self
            .http
            .post(self.sandbox_url(sandbox_id, INTERPRETER_PORT, "/execute"))
            .json(&ExecuteRequest {
                code,
                language: "python",
            });
        let resp = Self::with_access_token(req, access_token)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("E2B execute failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Exec(format!("E2B execute returned {status}: {body}")));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| SandboxError::Transport(format!("E2B execute stream: {e}")))?;
        Ok(parse_execution(&body))
    }

    /// Run a shell command through envd's process service.
    pub async fn run_process(
        &self,
        sandbox_id: &str,
        access_token: Option<&str>,
        command: &str,
    ) -> Result<CommandResult, SandboxError> {
        let message = serde_json::to_vec(&StartRequest::shell(command, SANDBOX_HOME))
            .map_err(|e| SandboxError::Serde(format!("envd start request: {e}")))?;
        let req = self
            .http
            .post(self.sandbox_url(sandbox_id, ENVD_PORT, "/process.Process/Start"))
            .header("Content-Type", "application/connect+json")
            .header("Connect-Protocol-Version", "1")
            .basic_auth(ENVD_USER, None::<&str>)
            .body(encode_envelope(0, &message));
        let resp = Self::with_access_token(req, access_token)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("E2B process start failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Exec(format!("E2B process start returned {status}: {body}")));
        }

        let mut decoder = EnvelopeDecoder::default();
        let mut output = ProcessOutput::default();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SandboxError::Transport(format!("E2B process stream: {e}")))?;
            for envelope in decoder.push(&chunk) {
                output.apply(&envelope)?;
            }
        }
        if decoder.has_partial() || !output.ended {
            tracing::warn!(sandbox_id = %sandbox_id, "envd process stream closed early");
        }

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.exit_code.unwrap_or(-1),
        })
    }

    /// Upload one file; envd creates missing parent directories.
    pub async fn upload_file(
        &self,
        sandbox_id: &str,
        access_token: Option<&str>,
        path: &str,
        content: &[u8],
    ) -> Result<(), SandboxError> {
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let part = reqwest::multipart::Part::bytes(content.to_vec()).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);
        let req = self
            .http
            .post(self.sandbox_url(sandbox_id, ENVD_PORT, "/files"))
            .query(&[("path", path), ("username", ENVD_USER)])
            .multipart(form);
        let resp = Self::with_access_token(req, access_token)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("E2B upload failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Transfer(format!("E2B upload of {path} returned {status}: {body}")));
        }
        Ok(())
    }
}

/// Fold the interpreter's NDJSON event stream into a transcript.
pub fn parse_execution(body: &str) -> ExecutionTranscript {
    let mut transcript = ExecutionTranscript::default();
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut event: serde_json::Map<String, Value> = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed execution event");
                continue;
            }
        };
        let kind = event
            .remove("type")
            .and_then(|t| t.as_str().map(String::from))
            .unwrap_or_default();
        let text = || {
            event
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string()
        };
        match kind.as_str() {
            "stdout" => transcript.stdout.extend(transcript_lines(&text())),
            "stderr" => transcript.stderr.extend(transcript_lines(&text())),
            "result" => match serde_json::from_value::<CellResult>(Value::Object(event)) {
                Ok(result) => transcript.results.push(result),
                Err(e) => tracing::warn!(error = %e, "skipping malformed cell result"),
            },
            "error" => {
                let field = |k: &str| {
                    event
                        .get(k)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                transcript.error = Some(ExecutionError {
                    name: field("name"),
                    value: field("value"),
                    traceback: field("traceback"),
                });
            }
            _ => {}
        }
    }
    transcript
}
