//! HTTP client for the specwrightd daemon.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use specwright_core::{Id, QueueItem, Worker};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: specwrightd\n  → or set SPECWRIGHT_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    BadRequest(String),

    #[error("unauthorized: check SPECWRIGHT_AUTH_TOKEN or --token")]
    Unauthorized,
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// A stale worktree as reported by the daemon.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleWorktreeInfo {
    pub spec_id: Id,
    pub worktree_path: String,
    pub idle_days: i64,
    #[serde(default)]
    pub pr_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleWorktreesResponse {
    pub stale_worktrees: Vec<StaleWorktreeInfo>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupReport {
    pub cleaned: Vec<Id>,
    pub stale: Vec<Id>,
    pub errors: Vec<String>,
}

/// Client for the daemon's HTTP API.
#[derive(Debug)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    pub fn new(base_url: impl Into<String>, token: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.error)
            .unwrap_or_else(|_| status.to_string());
        Err(match status.as_u16() {
            401 => ClientError::Unauthorized,
            404 => ClientError::NotFound(message),
            409 => ClientError::Conflict(message),
            400 => ClientError::BadRequest(message),
            code => ClientError::HttpError {
                status: code,
                message,
            },
        })
    }

    /// Start a run-all and return the raw SSE response for streaming.
    pub async fn run_all(&self, spec_id: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.url(&format!("/specs/{spec_id}/run-all")))
            .send()
            .await?;
        self.check(response).await
    }

    pub async fn abort_run_all(&self, spec_id: &str) -> Result<bool> {
        let response = self
            .http
            .post(self.url(&format!("/specs/{spec_id}/run-all/abort")))
            .send()
            .await?;
        let body: serde_json::Value = self.check(response).await?.json().await?;
        Ok(body["aborted"].as_bool().unwrap_or(false))
    }

    pub async fn run_chunk(&self, chunk_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/chunks/{chunk_id}/run")))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn abort_chunk(&self, chunk_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/chunks/{chunk_id}/abort")))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn set_dependencies(&self, chunk_id: &str, dependencies: &[String]) -> Result<()> {
        let response = self
            .http
            .put(self.url(&format!("/chunks/{chunk_id}/dependencies")))
            .json(&serde_json::json!({ "dependencies": dependencies }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn reorder_chunks(&self, spec_id: &str, chunk_ids: &[String]) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/specs/{spec_id}/chunks/reorder")))
            .json(&serde_json::json!({ "chunkIds": chunk_ids }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn start_worker(&self, spec_id: &str) -> Result<Worker> {
        let response = self
            .http
            .post(self.url("/workers"))
            .json(&serde_json::json!({ "specId": spec_id }))
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn pause_worker(&self, worker_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/workers/{worker_id}/pause")))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn resume_worker(&self, worker_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/workers/{worker_id}/resume")))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn stop_worker(&self, worker_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/workers/{worker_id}/stop")))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn enqueue(&self, spec_id: &str, priority: Option<i64>) -> Result<QueueItem> {
        let mut body = serde_json::json!({ "specId": spec_id });
        if let Some(priority) = priority {
            body["priority"] = serde_json::json!(priority);
        }
        let response = self.http.post(self.url("/queue")).json(&body).send().await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn reorder_queue(&self, queue_ids: &[String]) -> Result<()> {
        let response = self
            .http
            .post(self.url("/queue/reorder"))
            .json(&serde_json::json!({ "queueIds": queue_ids }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    /// Subscribe to the worker event stream (snapshot, then deltas).
    pub async fn worker_events(&self) -> Result<reqwest::Response> {
        let response = self.http.get(self.url("/workers/events")).send().await?;
        self.check(response).await
    }

    pub async fn stale_worktrees(&self) -> Result<StaleWorktreesResponse> {
        let response = self.http.get(self.url("/worktrees/stale")).send().await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn cleanup_worktrees(&self, force: bool) -> Result<CleanupReport> {
        let response = self
            .http
            .post(self.url("/worktrees/cleanup"))
            .json(&serde_json::json!({ "force": force }))
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn delete_worktree(&self, spec_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/worktrees/{spec_id}")))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }
}
