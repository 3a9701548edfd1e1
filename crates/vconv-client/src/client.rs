//! Authenticated control-plane client with one retry policy for all call
//! sites.
//!
//! Calls are classified by their path: *progress* ticks are single-attempt
//! and lossy, *state* transitions and everything else retry with
//! exponential backoff. No call site carries its own retry logic.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use vconv_models::{
    ConvertInfo, ConvertParams, DeviceInfo, Encoder, StageProgress, Task, TaskError, TaskResult,
    TaskStatus, UploadInfo,
};

use crate::error::{ClientError, ClientResult};

/// Per-attempt request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Retries after the initial attempt, for state and other calls.
const MAX_RETRIES: u32 = 3;
/// First backoff delay; doubles per attempt.
const BASE_BACKOFF: Duration = Duration::from_secs(1);
/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How a call path is treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Lossy progress tick: one attempt, failure logged and swallowed
    Progress,
    /// Lifecycle transition: retried, each retry logged at warn
    State,
    /// Anything else: retried silently
    Other,
}

impl CallClass {
    /// Classify by the final path segment.
    pub fn of(path: &str) -> Self {
        let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
        match last {
            "download" | "convert" | "upload" => CallClass::Progress,
            "start" | "complete" | "fail" | "downloadComplete" | "convertComplete" => {
                CallClass::State
            }
            _ => CallClass::Other,
        }
    }
}

/// Machine descriptor sent at registration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRegistration {
    pub id: String,
    pub name: String,
    pub device_info: DeviceInfo,
    pub encoder: Encoder,
}

/// Runner record echoed back by `/runner/online`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerRecord {
    pub id: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Task shape as the control plane sends it from `getTask`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTask {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub convert_params: Option<ConvertParams>,
}

impl RemoteTask {
    /// Adapt to the local task shape, filling in default convert params.
    pub fn into_task(self) -> Task {
        let mut task = Task::new(self.id, self.source).with_priority(self.priority);
        task.status = self.status;
        task.convert_params = self.convert_params.unwrap_or_default();
        task
    }
}

/// Object-store credentials from `/runner/minio`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCredentials {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

#[derive(Debug, Deserialize)]
struct TaskEnvelope {
    task: RemoteTask,
}

#[derive(Debug, Deserialize)]
struct RunnerEnvelope {
    runner: RunnerRecord,
}

#[derive(Debug, Deserialize)]
struct SuccessEnvelope {
    #[serde(default)]
    success: bool,
}

/// Control-plane HTTP client.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    http: Client,
    base_url: String,
    token: String,
}

impl ControlPlane {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> ClientResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ClientError::Network)?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Same endpoint, different bearer token (post-registration rotation).
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: token.into(),
        }
    }

    /// Absolute URL for a runner API path.
    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    /// One attempt; maps non-2xx statuses onto typed errors.
    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ClientResult<Value> {
        let mut request = self
            .http
            .request(method, self.url(path))
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json");

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        match status {
            s if s.is_success() => {
                let raw = response.bytes().await?;
                if raw.is_empty() {
                    Ok(Value::Null)
                } else {
                    Ok(serde_json::from_slice(&raw)?)
                }
            }
            StatusCode::FORBIDDEN => Err(ClientError::Forbidden(path.to_string())),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(path.to_string())),
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(ClientError::Status {
                    status: s.as_u16(),
                    body,
                })
            }
        }
    }

    /// Classified request: the single entry point for every endpoint.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ClientResult<Value> {
        let class = CallClass::of(path);

        if class == CallClass::Progress {
            return match self.send_once(method, path, body.as_ref()).await {
                Ok(value) => Ok(value),
                Err(e) => {
                    warn!(path, "Progress update dropped: {}", e);
                    Ok(Value::Null)
                }
            };
        }

        let mut backoff = BASE_BACKOFF;
        let mut attempt = 0u32;

        loop {
            match self.send_once(method.clone(), path, body.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    if class == CallClass::State {
                        warn!(
                            path,
                            attempt, "State call failed, retrying in {:?}: {}", backoff, e
                        );
                    } else {
                        debug!(
                            path,
                            attempt, "Call failed, retrying in {:?}: {}", backoff, e
                        );
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Register (or re-register) this machine.
    pub async fn register(&self, machine: &MachineRegistration) -> ClientResult<RunnerRecord> {
        let body = json!({ "machine": machine });
        let value = self
            .request(Method::POST, "/runner/online", Some(body))
            .await?;
        let envelope: RunnerEnvelope = serde_json::from_value(value)?;
        Ok(envelope.runner)
    }

    /// Liveness plus hardware telemetry.
    pub async fn heartbeat(&self, device_info: &DeviceInfo, encoder: Encoder) -> ClientResult<()> {
        let body = json!({ "deviceInfo": device_info, "encoder": encoder });
        self.request(Method::POST, "/runner/heartbeat", Some(body))
            .await?;
        Ok(())
    }

    /// Fetch the next unbound task, if any.
    pub async fn get_task(&self) -> ClientResult<Option<RemoteTask>> {
        match self.request(Method::GET, "/runner/getTask", None).await {
            Ok(value) => {
                let envelope: TaskEnvelope = serde_json::from_value(value)?;
                Ok(Some(envelope.task))
            }
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically bind a task to this runner. `false` means another runner
    /// won the race.
    pub async fn start_task(&self, task_id: &str) -> ClientResult<bool> {
        let path = format!("/runner/{}/start", task_id);
        let value = self.request(Method::POST, &path, None).await?;
        let envelope: SuccessEnvelope = serde_json::from_value(value).unwrap_or(SuccessEnvelope {
            success: false,
        });
        Ok(envelope.success)
    }

    /// Stage marker posted once the source is fully on disk.
    pub async fn download_complete(&self, task_id: &str, downloaded_path: &str) -> ClientResult<()> {
        let path = format!("/runner/{}/downloadComplete", task_id);
        let body = json!({ "downloadedFilePath": downloaded_path });
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    /// Lossy download progress tick.
    pub async fn report_download(&self, task_id: &str, info: &StageProgress) -> ClientResult<()> {
        let path = format!("/runner/{}/download", task_id);
        let body = json!({ "downloadInfo": info });
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    /// Lossy convert progress tick.
    pub async fn report_convert(&self, task_id: &str, info: &ConvertInfo) -> ClientResult<()> {
        let path = format!("/runner/{}/convert", task_id);
        let body = json!({ "convertInfo": info });
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    /// Lossy upload progress tick.
    pub async fn report_upload(&self, task_id: &str, info: &UploadInfo) -> ClientResult<()> {
        let path = format!("/runner/{}/upload", task_id);
        let body = json!({ "uploadInfo": info });
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    /// Terminal success.
    pub async fn complete(&self, task_id: &str, result: &TaskResult) -> ClientResult<()> {
        let path = format!("/runner/{}/complete", task_id);
        let body = json!({ "result": result });
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    /// Terminal failure.
    pub async fn fail(&self, task_id: &str, error: &TaskError) -> ClientResult<()> {
        let path = format!("/runner/{}/fail", task_id);
        let body = json!({ "error": error });
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    /// Current object-store credentials.
    pub async fn object_store_credentials(&self) -> ClientResult<StoreCredentials> {
        let value = self.request(Method::GET, "/runner/minio", None).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_progress_paths() {
        assert_eq!(CallClass::of("/runner/t1/download"), CallClass::Progress);
        assert_eq!(CallClass::of("/runner/t1/convert"), CallClass::Progress);
        assert_eq!(CallClass::of("/runner/t1/upload"), CallClass::Progress);
    }

    #[test]
    fn test_classifier_state_paths() {
        assert_eq!(CallClass::of("/runner/t1/start"), CallClass::State);
        assert_eq!(CallClass::of("/runner/t1/complete"), CallClass::State);
        assert_eq!(CallClass::of("/runner/t1/fail"), CallClass::State);
        assert_eq!(
            CallClass::of("/runner/t1/downloadComplete"),
            CallClass::State
        );
        assert_eq!(
            CallClass::of("/runner/t1/convertComplete"),
            CallClass::State
        );
    }

    #[test]
    fn test_classifier_other_paths() {
        assert_eq!(CallClass::of("/runner/online"), CallClass::Other);
        assert_eq!(CallClass::of("/runner/heartbeat"), CallClass::Other);
        assert_eq!(CallClass::of("/runner/getTask"), CallClass::Other);
        assert_eq!(CallClass::of("/runner/minio"), CallClass::Other);
    }

    #[test]
    fn test_url_joining_strips_trailing_slash() {
        let client = ControlPlane::new("http://cp.example:4000/", "tok").unwrap();
        assert_eq!(
            client.url("/runner/getTask"),
            "http://cp.example:4000/api/runner/getTask"
        );
    }

    #[test]
    fn test_remote_task_adaptation_defaults() {
        let raw = serde_json::json!({
            "id": "t1",
            "source": "http://src/a.mp4",
            "status": "WAITING",
            "priority": 10
        });
        let remote: RemoteTask = serde_json::from_value(raw).unwrap();
        let task = remote.into_task();

        assert_eq!(task.id, "t1");
        assert_eq!(task.priority, 10);
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.convert_params, ConvertParams::default());
    }

    #[test]
    fn test_store_credentials_wire_shape() {
        let raw = serde_json::json!({
            "endpoint": "minio.internal:9000",
            "accessKey": "ak",
            "secretKey": "sk",
            "bucket": "transcodes"
        });
        let creds: StoreCredentials = serde_json::from_value(raw).unwrap();
        assert_eq!(creds.access_key, "ak");
        assert_eq!(creds.bucket, "transcodes");
    }
}
