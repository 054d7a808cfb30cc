//! HTTP client for the farmd daemon.

use base64::Engine as _;
use farm_core::tool::ToolInvocation;
use farm_core::{JobHandle, JobInfo, JobStatus};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: farmd\n  → or set FARMD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("job directory already in use: {0}")]
    Conflict(String),

    #[error("execution host unreachable: {0}")]
    HostUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check FARMD_TOKEN env var or --token flag")]
    Unauthorized,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure farmd is running\n  → check FARMD_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },

    #[error("job still running after {waited_sec}s: {job_dir}")]
    WaitTimeout { job_dir: String, waited_sec: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::IoError(e.to_string())
    }
}

/// Request payload for POST /jobs.
#[derive(Debug, Default, Serialize)]
pub struct StartJobRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolInvocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<JobInfo>,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_sec: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    output: String,
}

#[derive(Debug, Serialize)]
struct UploadRequest<'a> {
    dir: &'a str,
    filename: &'a str,
    content_b64: String,
}

/// Response from POST /uploads.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub path: String,
    pub bytes: usize,
    pub sha256: String,
}

#[derive(Debug, Deserialize)]
struct ArtifactResponse {
    path: String,
    content_b64: String,
}

/// A downloaded artifact.
#[derive(Debug)]
pub struct Artifact {
    pub path: String,
    pub content: Vec<u8>,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for farmd.
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Check if daemon is healthy by probing /health endpoint.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to answer /health, backing off exponentially.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let timeout_ms = DEFAULT_READY_TIMEOUT_MS;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }
                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );
                    let sleep_ms = backoff_ms.min(timeout_ms.saturating_sub(elapsed));
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Map an error response to a `ClientError`.
    async fn handle_error(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map_or_else(|_| "unknown error".to_string(), |e| e.error);

        match status {
            400 => ClientError::InvalidRequest(message),
            404 => ClientError::NotFound(message),
            409 => ClientError::Conflict(message),
            502 | 504 => ClientError::HostUnavailable(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Launch a job.
    /// POST /jobs
    pub async fn start_job(&self, req: &StartJobRequest) -> Result<JobHandle, ClientError> {
        let url = format!("{}/jobs", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(req)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Poll a job.
    /// GET /jobs/status?job_dir=...
    pub async fn job_status(&self, job_dir: &str) -> Result<JobStatus, ClientError> {
        let url = format!(
            "{}/jobs/status?job_dir={}",
            self.base_url,
            urlencoding::encode(job_dir)
        );
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Self::decode(response).await
    }

    /// Run one command on the execution host.
    /// POST /exec
    pub async fn exec(&self, command: &str, timeout_sec: Option<u64>) -> Result<String, ClientError> {
        let url = format!("{}/exec", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&ExecRequest {
                command,
                timeout_sec,
            })
            .send()
            .await?;
        let body: ExecResponse = Self::decode(response).await?;
        Ok(body.output)
    }

    /// Write a file on the execution host.
    /// POST /uploads
    pub async fn upload(
        &self,
        dir: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<UploadResponse, ClientError> {
        let url = format!("{}/uploads", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&UploadRequest {
                dir,
                filename,
                content_b64: base64::engine::general_purpose::STANDARD.encode(content),
            })
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Download a file from a job's output directory.
    /// GET /artifacts?job_dir=...&name=...
    pub async fn artifact(&self, job_dir: &str, name: &str) -> Result<Artifact, ClientError> {
        let url = format!(
            "{}/artifacts?job_dir={}&name={}",
            self.base_url,
            urlencoding::encode(job_dir),
            urlencoding::encode(name)
        );
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: ArtifactResponse = Self::decode(response).await?;
        let content = base64::engine::general_purpose::STANDARD
            .decode(body.content_b64.as_bytes())
            .map_err(|e| ClientError::InvalidResponse(format!("content_b64: {e}")))?;
        Ok(Artifact {
            path: body.path,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_drops_trailing_slash() {
        let client = Client::new("http://127.0.0.1:7800/", None);
        assert_eq!(client.base_url, "http://127.0.0.1:7800");
    }

    #[test]
    fn token_becomes_bearer_header() {
        let client = Client::new("http://x", Some("abc"));
        let headers = client.headers();
        assert_eq!(headers[AUTHORIZATION], "Bearer abc");

        let anonymous = Client::new("http://x", None);
        assert!(anonymous.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn start_request_omits_unset_fields() {
        let req = StartJobRequest {
            command: Some("true".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"command": "true"}));
    }
}
