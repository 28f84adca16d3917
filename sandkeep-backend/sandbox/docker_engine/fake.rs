//! In-process fake of the Docker Engine API for tests.
//!
//! Serves the subset `DockerEngine` calls over TCP on 127.0.0.1. Containers
//! are plain records with a file map; exec output is sent as multiplexed
//! frames cut into 3-byte chunks so the client sees split headers and
//! payloads. `python3 <file>` understands `print(<int> + <int>)` and
//! `print("<text>")` lines; anything else raises a `NameError`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::io::Read;
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::sandbox::demux::encode_frame;
use crate::sandbox::types::DockerEndpoint;

#[derive(Debug, Clone, Default)]
pub struct ExecScript {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[derive(Debug, Default)]
struct FakeContainer {
    running: bool,
    image: String,
    labels: BTreeMap<String, String>,
    port_bindings: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct FakeExec {
    container: String,
    cmd: Vec<String>,
    exit_code: Option<i64>,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    execs: HashMap<String, FakeExec>,
    scripts: VecDeque<ExecScript>,
    missing_images: HashSet<String>,
    pulls: Vec<String>,
    fail_stop: bool,
    fail_archive: bool,
    exec_never_exits: bool,
    next_exec: u64,
}

type Shared = Arc<Mutex<FakeState>>;

pub struct FakeEngine {
    state: Shared,
    port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl FakeEngine {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(FakeState::default()));
        let app = Router::new()
            .route("/_ping", get(|| async { "OK" }))
            .route("/images/create", post(pull_image))
            .route("/containers/create", post(create_container))
            .route("/containers/{id}/start", post(start_container))
            .route("/containers/{id}/json", get(inspect_container))
            .route("/containers/{id}/stop", post(stop_container))
            .route("/containers/{id}", delete(remove_container))
            .route("/containers/{id}/exec", post(create_exec))
            .route("/containers/{id}/archive", put(put_archive))
            .route("/exec/{id}/start", post(start_exec))
            .route("/exec/{id}/json", get(inspect_exec))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            state,
            port,
            server,
        }
    }

    pub fn endpoint(&self) -> DockerEndpoint {
        DockerEndpoint::Tcp {
            host: "127.0.0.1".into(),
            port: self.port,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_running(&self, id: &str) {
        self.lock().containers.insert(
            id.to_string(),
            FakeContainer {
                running: true,
                dirs: default_dirs(),
                ..FakeContainer::default()
            },
        );
    }

    pub fn mark_image_missing(&self, image: &str) {
        self.lock().missing_images.insert(image.to_string());
    }

    pub fn script_exec(&self, script: ExecScript) {
        self.lock().scripts.push_back(script);
    }

    pub fn fail_stop(&self, fail: bool) {
        self.lock().fail_stop = fail;
    }

    /// Reject every archive upload with a 500.
    pub fn fail_archive(&self, fail: bool) {
        self.lock().fail_archive = fail;
    }

    /// Exec inspect keeps reporting `Running` with no exit code.
    pub fn exec_never_exits(&self, stuck: bool) {
        self.lock().exec_never_exits = stuck;
    }

    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().containers.contains_key(id)
    }

    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn file(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .containers
            .get(container)
            .and_then(|c| c.files.get(path).cloned())
    }

    pub fn image_of(&self, container: &str) -> Option<String> {
        self.lock().containers.get(container).map(|c| c.image.clone())
    }

    pub fn label(&self, container: &str, key: &str) -> Option<String> {
        self.lock()
            .containers
            .get(container)
            .and_then(|c| c.labels.get(key).cloned())
    }

    /// Host port bound for `container_port/tcp`.
    pub fn host_port(&self, container: &str, container_port: u16) -> Option<String> {
        self.lock()
            .containers
            .get(container)
            .and_then(|c| c.port_bindings.get(&format!("{container_port}/tcp")).cloned())
    }

    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        let state = self.lock();
        let mut execs: Vec<_> = state.execs.iter().collect();
        execs.sort_by_key(|(id, _)| id.trim_start_matches("exec-").parse::<u64>().unwrap_or(0));
        execs.into_iter().map(|(_, e)| e.cmd.clone()).collect()
    }
}

fn default_dirs() -> BTreeSet<String> {
    ["/", "/home", "/home/user", "/tmp"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn not_found(what: &str, id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": format!("No such {what}: {id}") })),
    )
        .into_response()
}

// ── Handlers ────────────────────────────────────────────────────────

async fn pull_image(
    State(state): State<Shared>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let image = format!(
        "{}:{}",
        q.get("fromImage").cloned().unwrap_or_default(),
        q.get("tag").cloned().unwrap_or_else(|| "latest".into())
    );
    let mut s = state.lock().unwrap();
    s.missing_images.remove(&image);
    s.pulls.push(image.clone());
    format!("{{\"status\":\"Pulling from {image}\"}}\n{{\"status\":\"Downloaded\"}}\n").into_response()
}

async fn create_container(
    State(state): State<Shared>,
    Query(q): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let name = q.get("name").cloned().unwrap_or_else(|| "anon".into());
    let image = body["Image"].as_str().unwrap_or_default().to_string();
    let mut s = state.lock().unwrap();
    if s.missing_images.contains(&image) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": format!("No such image: {image}") })),
        )
            .into_response();
    }
    if s.containers.contains_key(&name) {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "message": format!("Conflict. The container name {name} is already in use") })),
        )
            .into_response();
    }

    let labels = body["Labels"]
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect()
        })
        .unwrap_or_default();
    let port_bindings = body["HostConfig"]["PortBindings"]
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), v[0]["HostPort"].as_str().unwrap_or_default().to_string()))
                .collect()
        })
        .unwrap_or_default();

    s.containers.insert(
        name.clone(),
        FakeContainer {
            running: false,
            image,
            labels,
            port_bindings,
            dirs: default_dirs(),
            files: BTreeMap::new(),
        },
    );
    (StatusCode::CREATED, Json(json!({ "Id": name, "Warnings": [] }))).into_response()
}

async fn start_container(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut s = state.lock().unwrap();
    match s.containers.get_mut(&id) {
        Some(c) if c.running => StatusCode::NOT_MODIFIED.into_response(),
        Some(c) => {
            c.running = true;
            StatusCode::NO_CONTENT.into_response()
        }
        None => not_found("container", &id),
    }
}

async fn inspect_container(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let s = state.lock().unwrap();
    match s.containers.get(&id) {
        Some(c) => Json(json!({
            "Id": id,
            "State": {
                "Running": c.running,
                "Status": if c.running { "running" } else { "exited" },
            }
        }))
        .into_response(),
        None => not_found("container", &id),
    }
}

async fn stop_container(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut s = state.lock().unwrap();
    if s.fail_stop {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": "cannot stop container: daemon busy" })),
        )
            .into_response();
    }
    match s.containers.get_mut(&id) {
        Some(c) if c.running => {
            c.running = false;
            StatusCode::NO_CONTENT.into_response()
        }
        Some(_) => StatusCode::NOT_MODIFIED.into_response(),
        None => not_found("container", &id),
    }
}

async fn remove_container(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut s = state.lock().unwrap();
    match s.containers.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => not_found("container", &id),
    }
}

async fn create_exec(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut s = state.lock().unwrap();
    match s.containers.get(&id) {
        None => return not_found("container", &id),
        Some(c) if !c.running => {
            return (
                StatusCode::CONFLICT,
                Json(json!({ "message": format!("Container {id} is not running") })),
            )
                .into_response();
        }
        Some(_) => {}
    }
    let cmd = body["Cmd"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    s.next_exec += 1;
    let exec_id = format!("exec-{}", s.next_exec);
    s.execs.insert(
        exec_id.clone(),
        FakeExec {
            container: id,
            cmd,
            exit_code: None,
        },
    );
    (StatusCode::CREATED, Json(json!({ "Id": exec_id }))).into_response()
}

async fn start_exec(State(state): State<Shared>, Path(exec_id): Path<String>) -> Response {
    let script = {
        let mut s = state.lock().unwrap();
        let Some(exec) = s.execs.get(&exec_id) else {
            return not_found("exec instance", &exec_id);
        };
        let cmd = exec.cmd.clone();
        let container = exec.container.clone();
        let script = match s.scripts.pop_front() {
            Some(script) => script,
            None => run_builtin(&mut s, &container, &cmd),
        };
        if let Some(exec) = s.execs.get_mut(&exec_id) {
            exec.exit_code = Some(script.exit_code);
        }
        script
    };

    let mut raw = Vec::new();
    if !script.stdout.is_empty() {
        raw.extend(encode_frame(1, script.stdout.as_bytes()));
    }
    if !script.stderr.is_empty() {
        raw.extend(encode_frame(2, script.stderr.as_bytes()));
    }
    let chunks: Vec<Result<Bytes, Infallible>> = raw
        .chunks(3)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/vnd.docker.raw-stream")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .unwrap()
}

async fn inspect_exec(State(state): State<Shared>, Path(exec_id): Path<String>) -> Response {
    let s = state.lock().unwrap();
    match s.execs.get(&exec_id) {
        Some(_) if s.exec_never_exits => Json(json!({ "ExitCode": null, "Running": true })).into_response(),
        Some(exec) => Json(json!({
            "ExitCode": exec.exit_code,
            "Running": exec.exit_code.is_none(),
        }))
        .into_response(),
        None => not_found("exec instance", &exec_id),
    }
}

async fn put_archive(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let dir = q.get("path").cloned().unwrap_or_default();
    let mut s = state.lock().unwrap();
    if s.fail_archive {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": "extraction failed: no space left on device" })),
        )
            .into_response();
    }
    let Some(container) = s.containers.get_mut(&id) else {
        return not_found("container", &id);
    };
    if !container.dirs.contains(&dir) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": format!("Could not find the file {dir} in container {id}") })),
        )
            .into_response();
    }

    let mut archive = tar::Archive::new(&body[..]);
    let Ok(entries) = archive.entries() else {
        return (StatusCode::BAD_REQUEST, "bad archive").into_response();
    };
    for entry in entries {
        let Ok(mut entry) = entry else {
            return (StatusCode::BAD_REQUEST, "bad archive").into_response();
        };
        let name = entry.path().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        let mut content = Vec::new();
        if entry.read_to_end(&mut content).is_err() {
            return (StatusCode::BAD_REQUEST, "bad archive").into_response();
        }
        let full = if dir == "/" {
            format!("/{name}")
        } else {
            format!("{dir}/{name}")
        };
        container.files.insert(full, content);
    }
    StatusCode::OK.into_response()
}

// ── Builtin commands ────────────────────────────────────────────────

fn run_builtin(state: &mut FakeState, container: &str, cmd: &[String]) -> ExecScript {
    let Some(c) = state.containers.get_mut(container) else {
        return ExecScript {
            exit_code: 126,
            ..ExecScript::default()
        };
    };
    match cmd {
        [mkdir, flag, dir] if mkdir == "mkdir" && flag == "-p" => {
            let mut path = String::new();
            for part in dir.split('/').filter(|p| !p.is_empty()) {
                path.push('/');
                path.push_str(part);
                c.dirs.insert(path.clone());
            }
            ExecScript::default()
        }
        [python, file] if python == "python3" => {
            let source = c.files.get(file).cloned().unwrap_or_default();
            run_python(&String::from_utf8_lossy(&source), file)
        }
        [sh, flag, script] if sh == "sh" && flag == "-c" => match script.strip_prefix("echo ") {
            Some(text) => ExecScript {
                stdout: format!("{}\n", text.trim_matches('\'')),
                ..ExecScript::default()
            },
            None if script.starts_with("exit ") => ExecScript {
                exit_code: script[5..].trim().parse().unwrap_or(1),
                ..ExecScript::default()
            },
            None => ExecScript::default(),
        },
        _ => ExecScript::default(),
    }
}

fn run_python(source: &str, file: &str) -> ExecScript {
    let mut stdout = String::new();
    for (lineno, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let printed = line
            .strip_prefix("print(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(eval_expr);
        match printed {
            Some(value) => {
                stdout.push_str(&value);
                stdout.push('\n');
            }
            None => {
                let name = line.split(|ch: char| !ch.is_alphanumeric() && ch != '_').next().unwrap_or(line);
                return ExecScript {
                    stdout,
                    stderr: format!(
                        "Traceback (most recent call last):\n  File \"{file}\", line {}, in <module>\n    {line}\nNameError: name '{name}' is not defined\n",
                        lineno + 1
                    ),
                    exit_code: 1,
                };
            }
        }
    }
    ExecScript {
        stdout,
        stderr: String::new(),
        exit_code: 0,
    }
}

fn eval_expr(expr: &str) -> Option<String> {
    let expr = expr.trim();
    if let Some(text) = expr
        .strip_prefix('"')
        .and_then(|e| e.strip_suffix('"'))
        .or_else(|| expr.strip_prefix('\'').and_then(|e| e.strip_suffix('\'')))
    {
        return Some(text.to_string());
    }
    let mut sum: i64 = 0;
    for term in expr.split('+') {
        sum += term.trim().parse::<i64>().ok()?;
    }
    Some(sum.to_string())
}
