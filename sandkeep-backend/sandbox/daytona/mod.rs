//! REST client for the Daytona sandbox service.
//!
//! Sandboxes are created by language rather than by image. Every process
//! and file operation goes through the toolbox API under
//! `/toolbox/{id}/toolbox/...`; the toolbox merges stdout and stderr into
//! one `result` string.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{DaytonaConfig, SANDBOX_HOME};

/// Daytona reads this label to pick the sandbox image.
pub const LANGUAGE_LABEL: &str = "code-toolbox-language";

const START_POLL_INTERVAL: Duration = Duration::from_millis(500);
const START_POLL_ATTEMPTS: u32 = 120;

// ── Request / Response types ────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateSandboxRequest {
    pub target: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaytonaSandbox {
    pub id: String,
    #[serde(default)]
    pub state: Option<String>,
}

impl DaytonaSandbox {
    pub fn is_started(&self) -> bool {
        self.state.as_deref() == Some("started")
    }

    fn is_failed(&self) -> bool {
        matches!(self.state.as_deref(), Some("error" | "build_failed"))
    }
}

#[derive(Debug, Clone, Serialize)]
struct ExecuteRequest<'a> {
    command: &'a str,
    cwd: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub exit_code: i64,
    #[serde(default)]
    pub result: String,
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaytonaClient {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
    target: String,
}

impl DaytonaClient {
    pub fn new(config: &DaytonaConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            target: config.target.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.api_url))
            .bearer_auth(&self.api_key)
    }

    fn toolbox(&self, method: reqwest::Method, id: &str, path: &str) -> reqwest::RequestBuilder {
        self.request(method, &format!("/toolbox/{id}/toolbox{path}"))
    }

    pub async fn create_sandbox(
        &self,
        language: &str,
        mut labels: BTreeMap<String, String>,
    ) -> Result<DaytonaSandbox, SandboxError> {
        labels.insert(LANGUAGE_LABEL.to_string(), language.to_string());
        let body = CreateSandboxRequest {
            target: self.target.clone(),
            labels,
            env: BTreeMap::new(),
        };
        tracing::info!(language = %language, target = %self.target, "creating Daytona sandbox");

        let resp = self
            .request(reqwest::Method::POST, "/sandbox")
            .json(&body)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("Daytona create failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Provision(format!("Daytona create returned {status}: {body}")));
        }
        resp.json::<DaytonaSandbox>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse Daytona sandbox: {e}")))
    }

    /// `Ok(None)` when the sandbox does not exist.
    pub async fn get_sandbox(&self, id: &str) -> Result<Option<DaytonaSandbox>, SandboxError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/sandbox/{id}"))
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("Daytona inspect failed: {e}")))?;
        match resp.status().as_u16() {
            200..=299 => resp
                .json::<DaytonaSandbox>()
                .await
                .map(Some)
                .map_err(|e| SandboxError::Serde(format!("failed to parse Daytona sandbox: {e}"))),
            404 => Ok(None),
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(SandboxError::Backend(format!("Daytona inspect returned {status}: {body}")))
            }
        }
    }

    /// Poll until the sandbox reports `started`.
    pub async fn wait_started(&self, id: &str) -> Result<(), SandboxError> {
        for _ in 0..START_POLL_ATTEMPTS {
            match self.get_sandbox(id).await? {
                Some(sbx) if sbx.is_started() => return Ok(()),
                Some(sbx) if sbx.is_failed() => {
                    return Err(SandboxError::Provision(format!(
                        "Daytona sandbox {id} entered state {}",
                        sbx.state.unwrap_or_default()
                    )));
                }
                Some(_) => tokio::time::sleep(START_POLL_INTERVAL).await,
                None => return Err(SandboxError::NotFound(id.to_string())),
            }
        }
        Err(SandboxError::Provision(format!("Daytona sandbox {id} did not start")))
    }

    pub async fn stop_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/sandbox/{id}/stop"))
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("Daytona stop failed: {e}")))?;
        match resp.status().as_u16() {
            200..=299 => Ok(()),
            404 => Err(SandboxError::NotFound(id.to_string())),
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(SandboxError::StopFailed(format!("Daytona stop returned {status}: {body}")))
            }
        }
    }

    pub async fn delete_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/sandbox/{id}"))
            .query(&[("force", "true")])
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("Daytona delete failed: {e}")))?;
        match resp.status().as_u16() {
            200..=299 => Ok(()),
            404 => Err(SandboxError::NotFound(id.to_string())),
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(SandboxError::RemoveFailed(format!("Daytona delete returned {status}: {body}")))
            }
        }
    }

    pub async fn execute(&self, id: &str, command: &str) -> Result<ExecuteResponse, SandboxError> {
        let resp = self
            .toolbox(reqwest::Method::POST, id, "/process/execute")
            .json(&ExecuteRequest {
                command,
                cwd: SANDBOX_HOME,
            })
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("Daytona execute failed: {e}")))?;
        match resp.status().as_u16() {
            200..=299 => resp
                .json::<ExecuteResponse>()
                .await
                .map_err(|e| SandboxError::Serde(format!("failed to parse Daytona execute: {e}"))),
            404 => Err(SandboxError::NotFound(id.to_string())),
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(SandboxError::Exec(format!("Daytona execute returned {status}: {body}")))
            }
        }
    }

    pub async fn create_folder(&self, id: &str, path: &str) -> Result<(), SandboxError> {
        let resp = self
            .toolbox(reqwest::Method::POST, id, "/files/folder")
            .query(&[("path", path), ("mode", "755")])
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("Daytona folder failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Transfer(format!("Daytona folder {path} returned {status}: {body}")));
        }
        Ok(())
    }

    pub async fn upload_file(&self, id: &str, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(content.to_vec()).file_name(file_name),
        );
        let resp = self
            .toolbox(reqwest::Method::POST, id, "/files/upload")
            .query(&[("path", path)])
            .multipart(form)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("Daytona upload failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Transfer(format!("Daytona upload of {path} returned {status}: {body}")));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake;

#[cfg(test)]
mod tests {
    use super::*;
    use fake::FakeDaytona;

    #[tokio::test]
    async fn create_labels_and_waits_for_start() {
        let fake = FakeDaytona::start().await;
        fake.set_start_delay_polls(2);
        let client = DaytonaClient::new(&fake.config());

        let sbx = client
            .create_sandbox("python", BTreeMap::from([("sandkeep.user".to_string(), "u1".to_string())]))
            .await
            .unwrap();
        assert_eq!(fake.label(&sbx.id, LANGUAGE_LABEL).as_deref(), Some("python"));
        assert_eq!(fake.label(&sbx.id, "sandkeep.user").as_deref(), Some("u1"));
        assert_eq!(fake.target_of(&sbx.id).as_deref(), Some("us"));

        client.wait_started(&sbx.id).await.unwrap();
        assert!(client.get_sandbox(&sbx.id).await.unwrap().unwrap().is_started());
    }

    #[tokio::test]
    async fn rejects_bad_token() {
        let fake = FakeDaytona::start().await;
        let mut config = fake.config();
        config.api_key = "wrong".into();
        let err = DaytonaClient::new(&config)
            .create_sandbox("python", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Provision(msg) if msg.contains("401")));
    }

    #[tokio::test]
    async fn execute_and_upload() {
        let fake = FakeDaytona::start().await;
        let client = DaytonaClient::new(&fake.config());
        let id = fake.add_started();

        let res = client.execute(&id, "echo hi").await.unwrap();
        assert_eq!(res.exit_code, 0);
        assert_eq!(res.result, "hi\n");

        client.create_folder(&id, "/home/user/app").await.unwrap();
        client
            .upload_file(&id, "/home/user/app/main.py", b"print('x')")
            .await
            .unwrap();
        assert_eq!(fake.file(&id, "/home/user/app/main.py").as_deref(), Some(&b"print('x')"[..]));
    }

    #[tokio::test]
    async fn stop_and_delete() {
        let fake = FakeDaytona::start().await;
        let client = DaytonaClient::new(&fake.config());
        let id = fake.add_started();

        client.stop_sandbox(&id).await.unwrap();
        assert!(!client.get_sandbox(&id).await.unwrap().unwrap().is_started());
        client.delete_sandbox(&id).await.unwrap();
        assert!(client.get_sandbox(&id).await.unwrap().is_none());
        assert!(matches!(
            client.delete_sandbox(&id).await,
            Err(SandboxError::NotFound(_))
        ));
        assert!(matches!(
            client.stop_sandbox(&id).await,
            Err(SandboxError::NotFound(_))
        ));
    }
}
