//! HTTP client for the Docker Engine API.
//!
//! Talks HTTP/1.1 to the daemon over its Unix socket or a TCP endpoint
//! (`DOCKER_HOST=tcp://host:port`). Only the calls the sandbox backend needs:
//! container create/start/inspect/stop/remove, exec create/start/inspect,
//! archive upload and image pull.

pub mod models;

use std::path::PathBuf;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixClientExt, UnixConnector};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::sandbox::demux::{Demuxed, Demuxer};
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::DockerEndpoint;

use models::*;

/// How long to wait for an exec to report its exit code once its stream closed.
const EXEC_EXIT_WAIT: Duration = Duration::from_secs(5);
const EXEC_EXIT_POLL: Duration = Duration::from_millis(50);

// ── Transport ───────────────────────────────────────────────────────

#[derive(Clone)]
enum Transport {
    Unix {
        client: Client<UnixConnector, Full<Bytes>>,
        socket: PathBuf,
    },
    Tcp {
        client: Client<HttpConnector, Full<Bytes>>,
        base: String,
    },
}

/// Result of an archive upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveUpload {
    Extracted,
    /// The target directory does not exist in the container.
    MissingDirectory,
}

/// Output of one finished exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub output: Demuxed,
    pub exit_code: i64,
}

#[derive(Clone)]
pub struct DockerEngine {
    transport: Transport,
    endpoint: DockerEndpoint,
    exit_wait: Duration,
}

impl std::fmt::Debug for DockerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerEngine")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl DockerEngine {
    pub fn new(endpoint: DockerEndpoint) -> Self {
        let transport = match &endpoint {
            DockerEndpoint::Unix(socket) => Transport::Unix {
                client: Client::unix(),
                socket: socket.clone(),
            },
            DockerEndpoint::Tcp { host, port } => Transport::Tcp {
                client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
                base: format!("http://{host}:{port}"),
            },
        };
        Self {
            transport,
            endpoint,
            exit_wait: EXEC_EXIT_WAIT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_exit_wait(mut self, wait: Duration) -> Self {
        self.exit_wait = wait;
        self
    }

    // ── Raw requests ────────────────────────────────────────────

    fn uri(&self, path_and_query: &str) -> Result<Uri, SandboxError> {
        match &self.transport {
            Transport::Unix { socket, .. } => {
                Ok(hyperlocal::Uri::new(socket, path_and_query).into())
            }
            Transport::Tcp { base, .. } => format!("{base}{path_and_query}")
                .parse()
                .map_err(|e| SandboxError::Config(format!("invalid docker uri: {e}"))),
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<Response<Incoming>, SandboxError> {
        let mut builder = Request::builder().method(method.clone()).uri(self.uri(path)?);
        if let Some(ct) = content_type {
            builder = builder.header("content-type", ct);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| SandboxError::Backend(format!("failed to build docker request: {e}")))?;

        tracing::debug!(%method, path, "docker engine request");
        let result = match &self.transport {
            Transport::Unix { client, .. } => client.request(request).await,
            Transport::Tcp { client, .. } => client.request(request).await,
        };
        result.map_err(|e| {
            SandboxError::Transport(format!("docker engine at {} unreachable: {e}", self.endpoint))
        })
    }

    async fn send_json<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(StatusCode, Bytes), SandboxError> {
        let (content_type, bytes) = match body {
            Some(body) => (
                Some("application/json"),
                Bytes::from(
                    serde_json::to_vec(body)
                        .map_err(|e| SandboxError::Serde(format!("docker request body: {e}")))?,
                ),
            ),
            None => (None, Bytes::new()),
        };
        let resp = self.send(method, path, content_type, bytes).await?;
        let status = resp.status();
        let bytes = collect(resp).await?;
        Ok((status, bytes))
    }

    // ── Daemon ──────────────────────────────────────────────────

    pub async fn ping(&self) -> Result<(), SandboxError> {
        let (status, body) = self.send_json::<()>(Method::GET, "/_ping", None).await?;
        if !status.is_success() {
            return Err(SandboxError::Backend(format!(
                "docker ping returned {status}: {}",
                engine_message(&body)
            )));
        }
        Ok(())
    }

    /// Pull `image` (`repo[:tag]`), waiting for the pull to finish.
    pub async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        let (repo, tag) = split_image_ref(image);
        let path = format!("/images/create?fromImage={}&tag={}", encode(repo), encode(tag));
        tracing::info!(image = %image, "pulling image");
        let (status, body) = self.send_json::<()>(Method::POST, &path, None).await?;
        if !status.is_success() {
            return Err(SandboxError::Provision(format!(
                "pull of {image} returned {status}: {}",
                engine_message(&body)
            )));
        }
        // Errors during the pull arrive as a progress line with `error` set.
        for line in body.split(|b| *b == b'\n') {
            if let Ok(progress) = serde_json::from_slice::<serde_json::Value>(line) {
                if let Some(err) = progress.get("error").and_then(|e| e.as_str()) {
                    return Err(SandboxError::Provision(format!("pull of {image} failed: {err}")));
                }
            }
        }
        Ok(())
    }

    // ── Containers ──────────────────────────────────────────────

    /// Create a named container, pulling the image once when it is missing.
    pub async fn create_container(
        &self,
        name: &str,
        body: &ContainerCreateBody,
    ) -> Result<String, SandboxError> {
        let path = format!("/containers/create?name={}", encode(name));
        let (mut status, mut bytes) = self.send_json(Method::POST, &path, Some(body)).await?;
        if status == StatusCode::NOT_FOUND {
            self.pull_image(&body.image).await?;
            (status, bytes) = self.send_json(Method::POST, &path, Some(body)).await?;
        }
        if status != StatusCode::CREATED && !status.is_success() {
            return Err(SandboxError::Provision(format!(
                "container create returned {status}: {}",
                engine_message(&bytes)
            )));
        }
        let created: ContainerCreateResponse = parse(&bytes, "container create")?;
        for warning in created.warnings.iter().flatten() {
            tracing::warn!(container = %name, warning = %warning, "docker create warning");
        }
        Ok(created.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        let path = format!("/containers/{}/start", encode(id));
        let (status, body) = self.send_json::<()>(Method::POST, &path, None).await?;
        match status.as_u16() {
            204 | 304 => Ok(()),
            404 => Err(SandboxError::NotFound(id.to_string())),
            _ => Err(SandboxError::Provision(format!(
                "container start returned {status}: {}",
                engine_message(&body)
            ))),
        }
    }

    /// `Ok(None)` when the container does not exist.
    pub async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInspect>, SandboxError> {
        let path = format!("/containers/{}/json", encode(id));
        let (status, body) = self.send_json::<()>(Method::GET, &path, None).await?;
        match status.as_u16() {
            200 => parse(&body, "container inspect").map(Some),
            404 => Ok(None),
            _ => Err(SandboxError::Backend(format!(
                "container inspect returned {status}: {}",
                engine_message(&body)
            ))),
        }
    }

    pub async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), SandboxError> {
        let path = format!("/containers/{}/stop?t={}", encode(id), grace.as_secs());
        let (status, body) = self.send_json::<()>(Method::POST, &path, None).await?;
        match status.as_u16() {
            204 => Ok(()),
            304 => Err(SandboxError::NotRunning(id.to_string())),
            404 => Err(SandboxError::NotFound(id.to_string())),
            _ => Err(SandboxError::StopFailed(format!(
                "{id}: {status}: {}",
                engine_message(&body)
            ))),
        }
    }

    pub async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let path = format!("/containers/{}?force=true", encode(id));
        let (status, body) = self.send_json::<()>(Method::DELETE, &path, None).await?;
        match status.as_u16() {
            204 => Ok(()),
            404 => Err(SandboxError::NotFound(id.to_string())),
            _ => Err(SandboxError::RemoveFailed(format!(
                "{id}: {status}: {}",
                engine_message(&body)
            ))),
        }
    }

    // ── Exec ────────────────────────────────────────────────────

    /// Run `cmd` in the container and wait for it to finish.
    pub async fn exec(
        &self,
        container: &str,
        cmd: Vec<String>,
        working_dir: &str,
        max_output_bytes: usize,
    ) -> Result<ExecOutput, SandboxError> {
        let exec_id = self.create_exec(container, cmd, working_dir).await?;
        let output = self.start_exec(container, &exec_id, max_output_bytes).await?;
        let exit_code = self.exec_exit_code(&exec_id).await?;
        tracing::debug!(
            container = %container,
            exit_code,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "exec finished"
        );
        Ok(ExecOutput { output, exit_code })
    }

    async fn create_exec(
        &self,
        container: &str,
        cmd: Vec<String>,
        working_dir: &str,
    ) -> Result<String, SandboxError> {
        let body = ExecCreateBody {
            attach_stdin: false,
            attach_stdout: true,
            attach_stderr: true,
            tty: false,
            cmd,
            working_dir: working_dir.to_string(),
        };
        let path = format!("/containers/{}/exec", encode(container));
        let (status, bytes) = self.send_json(Method::POST, &path, Some(&body)).await?;
        match status.as_u16() {
            200 | 201 => parse::<ExecCreateResponse>(&bytes, "exec create").map(|r| r.id),
            404 => Err(SandboxError::NotFound(container.to_string())),
            409 => Err(SandboxError::NotRunning(container.to_string())),
            _ => Err(SandboxError::Exec(format!(
                "exec create returned {status}: {}",
                engine_message(&bytes)
            ))),
        }
    }

    /// Start the exec attached and decode its multiplexed output as it arrives.
    async fn start_exec(
        &self,
        container: &str,
        exec_id: &str,
        max_output_bytes: usize,
    ) -> Result<Demuxed, SandboxError> {
        let body = serde_json::to_vec(&ExecStartBody {
            detach: false,
            tty: false,
        })
        .map_err(|e| SandboxError::Serde(format!("exec start body: {e}")))?;
        let path = format!("/exec/{}/start", encode(exec_id));
        let resp = self
            .send(Method::POST, &path, Some("application/json"), Bytes::from(body))
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = collect(resp).await?;
            return match status.as_u16() {
                404 => Err(SandboxError::NotFound(container.to_string())),
                409 => Err(SandboxError::NotRunning(container.to_string())),
                _ => Err(SandboxError::Exec(format!(
                    "exec start returned {status}: {}",
                    engine_message(&bytes)
                ))),
            };
        }

        let mut demux = Demuxer::with_limit(max_output_bytes);
        let mut body = resp.into_body();
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        demux.feed(&data);
                    }
                }
                Err(e) => {
                    tracing::warn!(exec_id = %exec_id, error = %e, "exec stream ended with error");
                    break;
                }
            }
        }
        let output = demux.finish();
        if output.truncated {
            tracing::warn!(exec_id = %exec_id, limit = max_output_bytes, "exec output truncated");
        }
        Ok(output)
    }

    /// Exit code of a finished exec, or -1 when the daemon never reports one.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64, SandboxError> {
        let path = format!("/exec/{}/json", encode(exec_id));
        // The daemon may report the exec as running for a moment after the
        // stream closes.
        let deadline = tokio::time::Instant::now() + self.exit_wait;
        loop {
            let (status, bytes) = self.send_json::<()>(Method::GET, &path, None).await?;
            if !status.is_success() {
                return Err(SandboxError::Exec(format!(
                    "exec inspect returned {status}: {}",
                    engine_message(&bytes)
                )));
            }
            let inspect: ExecInspect = parse(&bytes, "exec inspect")?;
            if let Some(code) = inspect.exit_code.filter(|_| !inspect.running) {
                return Ok(code);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    exec_id = %exec_id,
                    waited_ms = self.exit_wait.as_millis() as u64,
                    "exec output closed but no exit code was reported"
                );
                return Ok(-1);
            }
            tokio::time::sleep(EXEC_EXIT_POLL).await;
        }
    }

    // ── Files ───────────────────────────────────────────────────

    /// Extract a tar archive into `dir` inside the container.
    pub async fn put_archive(
        &self,
        container: &str,
        dir: &str,
        archive: Vec<u8>,
    ) -> Result<ArchiveUpload, SandboxError> {
        let path = format!("/containers/{}/archive?path={}", encode(container), encode(dir));
        let resp = self
            .send(Method::PUT, &path, Some("application/x-tar"), Bytes::from(archive))
            .await?;
        let status = resp.status();
        let body = collect(resp).await?;
        match status.as_u16() {
            200 | 204 => Ok(ArchiveUpload::Extracted),
            404 => {
                let message = engine_message(&body);
                if message.contains("No such container") {
                    Err(SandboxError::NotFound(container.to_string()))
                } else {
                    Ok(ArchiveUpload::MissingDirectory)
                }
            }
            _ => Err(SandboxError::Transfer(format!(
                "archive upload to {dir} returned {status}: {}",
                engine_message(&body)
            ))),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

async fn collect(resp: Response<Incoming>) -> Result<Bytes, SandboxError> {
    resp.into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| SandboxError::Transport(format!("docker response body: {e}")))
}

fn parse<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T, SandboxError> {
    serde_json::from_slice(bytes)
        .map_err(|e| SandboxError::Serde(format!("failed to parse {what} response: {e}")))
}

fn engine_message(body: &[u8]) -> String {
    serde_json::from_slice::<EngineMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// `registry:5000/org/img:tag` -> (`registry:5000/org/img`, `tag`).
fn split_image_ref(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

/// Parse `DOCKER_HOST` / `DOCKER_SOCKET` into an endpoint.
pub fn parse_endpoint(
    docker_host: Option<&str>,
    docker_socket: Option<&str>,
) -> Result<DockerEndpoint, SandboxError> {
    if let Some(host) = docker_host.map(str::trim).filter(|h| !h.is_empty()) {
        if let Some(path) = host.strip_prefix("unix://") {
            return Ok(DockerEndpoint::Unix(PathBuf::from(path)));
        }
        let rest = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
            .unwrap_or(host)
            .trim_end_matches('/');
        let (name, port) = match rest.rsplit_once(':') {
            Some((name, port)) => (
                name,
                port.parse::<u16>()
                    .map_err(|_| SandboxError::Config(format!("invalid DOCKER_HOST port: {host}")))?,
            ),
            None => (rest, 2375),
        };
        if name.is_empty() {
            return Err(SandboxError::Config(format!("invalid DOCKER_HOST: {host}")));
        }
        return Ok(DockerEndpoint::Tcp {
            host: name.to_string(),
            port,
        });
    }

    let socket = docker_socket
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("/var/run/docker.sock");
    Ok(DockerEndpoint::Unix(PathBuf::from(socket)))
}

#[cfg(test)]
pub(crate) mod fake;
