//! In-process fake of the Daytona API for tests.
//!
//! Sandboxes are records with a label map and a file map. The toolbox
//! understands `echo <text>`, `exit <n>` and `python3 <file>` where the file
//! holds `print(<int> + <int>)` or `print("<text>")` lines; any other line
//! fails with a `NameError` traceback in the merged output.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::sandbox::types::DaytonaConfig;

const API_KEY: &str = "test-key";

#[derive(Debug, Default)]
struct FakeSandbox {
    state: String,
    target: String,
    labels: BTreeMap<String, String>,
    pending_polls: u32,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct FakeState {
    sandboxes: HashMap<String, FakeSandbox>,
    start_delay_polls: u32,
    commands: Vec<String>,
    fail_delete: bool,
    next_id: u64,
}

type Shared = Arc<Mutex<FakeState>>;

pub struct FakeDaytona {
    state: Shared,
    port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for FakeDaytona {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl FakeDaytona {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(FakeState::default()));
        let app = Router::new()
            .route("/sandbox", post(create_sandbox))
            .route("/sandbox/{id}", get(get_sandbox).delete(delete_sandbox))
            .route("/sandbox/{id}/stop", post(stop_sandbox))
            .route("/toolbox/{id}/toolbox/process/execute", post(execute))
            .route("/toolbox/{id}/toolbox/files/folder", post(create_folder))
            .route("/toolbox/{id}/toolbox/files/upload", post(upload))
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

    pub fn config(&self) -> DaytonaConfig {
        DaytonaConfig {
            api_key: API_KEY.into(),
            api_url: format!("http://127.0.0.1:{}", self.port),
            target: "us".into(),
            preview_domain: "daytona.app".into(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// New sandboxes report `creating` for this many inspections.
    pub fn set_start_delay_polls(&self, polls: u32) {
        self.lock().start_delay_polls = polls;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.lock().fail_delete = fail;
    }

    pub fn add_started(&self) -> String {
        let mut st = self.lock();
        st.next_id += 1;
        let id = format!("dt-{}", st.next_id);
        st.sandboxes.insert(
            id.clone(),
            FakeSandbox {
                state: "started".into(),
                target: "us".into(),
                dirs: default_dirs(),
                ..FakeSandbox::default()
            },
        );
        id
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().sandboxes.contains_key(id)
    }

    pub fn sandbox_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().sandboxes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn label(&self, id: &str, key: &str) -> Option<String> {
        self.lock().sandboxes.get(id)?.labels.get(key).cloned()
    }

    pub fn target_of(&self, id: &str) -> Option<String> {
        self.lock().sandboxes.get(id).map(|s| s.target.clone())
    }

    pub fn file(&self, id: &str, path: &str) -> Option<Vec<u8>> {
        self.lock().sandboxes.get(id)?.files.get(path).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }
}

fn default_dirs() -> BTreeSet<String> {
    ["/", "/tmp", "/home", "/home/user"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {API_KEY}"))
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"message": format!("sandbox {id} not found")})),
    )
        .into_response()
}

async fn create_sandbox(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let mut st = state.lock().unwrap();
    st.next_id += 1;
    let id = format!("dt-{}", st.next_id);
    let labels = body["labels"]
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect()
        })
        .unwrap_or_default();
    let pending_polls = st.start_delay_polls;
    st.sandboxes.insert(
        id.clone(),
        FakeSandbox {
            state: "creating".into(),
            target: body["target"].as_str().unwrap_or_default().to_string(),
            labels,
            pending_polls,
            dirs: default_dirs(),
            files: BTreeMap::new(),
        },
    );
    Json(json!({"id": id, "state": "creating"})).into_response()
}

async fn get_sandbox(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut st = state.lock().unwrap();
    let Some(sbx) = st.sandboxes.get_mut(&id) else {
        return not_found(&id);
    };
    if sbx.state == "creating" {
        if sbx.pending_polls == 0 {
            sbx.state = "started".into();
        } else {
            sbx.pending_polls -= 1;
        }
    }
    Json(json!({"id": id, "state": sbx.state})).into_response()
}

async fn stop_sandbox(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut st = state.lock().unwrap();
    match st.sandboxes.get_mut(&id) {
        Some(sbx) => {
            sbx.state = "stopped".into();
            StatusCode::OK.into_response()
        }
        None => not_found(&id),
    }
}

async fn delete_sandbox(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut st = state.lock().unwrap();
    if st.fail_delete {
        return (StatusCode::INTERNAL_SERVER_ERROR, "delete failed").into_response();
    }
    match st.sandboxes.remove(&id) {
        Some(_) => StatusCode::OK.into_response(),
        None => not_found(&id),
    }
}

async fn execute(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let command = body["command"].as_str().unwrap_or_default().to_string();
    let mut st = state.lock().unwrap();
    st.commands.push(command.clone());
    let Some(sbx) = st.sandboxes.get(&id) else {
        return not_found(&id);
    };
    let (exit_code, result) = run(sbx, &command);
    Json(json!({"exitCode": exit_code, "result": result})).into_response()
}

fn run(sbx: &FakeSandbox, command: &str) -> (i64, String) {
    if let Some(text) = command.strip_prefix("echo ") {
        return (0, format!("{text}\n"));
    }
    if let Some(code) = command.strip_prefix("exit ") {
        return (code.trim().parse().unwrap_or(1), String::new());
    }
    if let Some(file) = command.strip_prefix("python3 ") {
        let Some(source) = sbx.files.get(file.trim()) else {
            return (2, format!("python3: can't open file '{file}'\n"));
        };
        return python(&String::from_utf8_lossy(source));
    }
    (127, format!("sh: {command}: not found\n"))
}

fn python(source: &str) -> (i64, String) {
    let mut out = String::new();
    for line in source.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let arg = line
            .strip_prefix("print(")
            .and_then(|rest| rest.strip_suffix(')'));
        let printed = arg.and_then(|arg| {
            if let Some((a, b)) = arg.split_once('+') {
                let a: i64 = a.trim().parse().ok()?;
                let b: i64 = b.trim().parse().ok()?;
                return Some((a + b).to_string());
            }
            arg.strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .map(String::from)
        });
        match printed {
            Some(text) => {
                out.push_str(&text);
                out.push('\n');
            }
            None => {
                out.push_str(&format!(
                    "Traceback (most recent call last):\n  File \"/tmp/exec_code.py\", line 1, in <module>\nNameError: name '{line}' is not defined\n"
                ));
                return (1, out);
            }
        }
    }
    (0, out)
}

async fn create_folder(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let mut st = state.lock().unwrap();
    let Some(sbx) = st.sandboxes.get_mut(&id) else {
        return not_found(&id);
    };
    let Some(path) = q.get("path") else {
        return (StatusCode::BAD_REQUEST, "missing path").into_response();
    };
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        sbx.dirs.insert(current.clone());
    }
    StatusCode::OK.into_response()
}

async fn upload(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
    mut multipart: Multipart,
) -> Response {
    let Some(path) = q.get("path").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing path").into_response();
    };
    let mut content = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            content = field.bytes().await.ok().map(|b| b.to_vec());
        }
    }
    let Some(content) = content else {
        return (StatusCode::BAD_REQUEST, "missing file part").into_response();
    };

    let mut st = state.lock().unwrap();
    let Some(sbx) = st.sandboxes.get_mut(&id) else {
        return not_found(&id);
    };
    let parent = match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => "/".to_string(),
    };
    if !sbx.dirs.contains(&parent) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": format!("no such directory: {parent}")})),
        )
            .into_response();
    }
    sbx.files.insert(path, content);
    StatusCode::OK.into_response()
}
