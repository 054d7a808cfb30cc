//! HTTP control plane for farmd.
//!
//! Local-only REST API over the launcher, poller and channel. Binary
//! payloads travel base64-encoded inside JSON.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use farm_core::layout::JobLayout;
use farm_core::script::sha256_hex;
use farm_core::tool::ToolInvocation;
use farm_core::{Config, JobHandle, JobId, JobInfo, JobStatus};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::channel::{upload_checked, Channel, ChannelError, RemoteChannel};
use crate::channel::FileTransfer as _;
use crate::launcher::{LaunchError, LaunchRequest, Launcher};
use crate::poller::{PollError, Poller};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub channel: Arc<Channel>,
    pub launcher: Launcher<Channel>,
    pub poller: Poller<Channel>,
    pub config: Config,
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("channel", &self.channel.describe())
            .field("auth", &self.auth_token.is_some())
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(channel: Arc<Channel>, config: Config, auth_token: Option<String>) -> Self {
        Self {
            launcher: Launcher::new(Arc::clone(&channel), &config),
            poller: Poller::new(Arc::clone(&channel), &config),
            channel,
            config,
            auth_token,
        }
    }
}

/// Request body limit for uploads of `max_upload_bytes`: base64 inflates
/// the file by 4/3, plus room for the JSON envelope.
pub fn upload_body_limit(max_upload_bytes: usize) -> usize {
    max_upload_bytes
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_add(64 * 1024)
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = upload_body_limit(state.config.max_upload_bytes);
    Router::new()
        .route("/jobs", post(start_job))
        .route("/jobs/status", get(job_status))
        .route("/exec", post(exec_command))
        .route(
            "/uploads",
            post(upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/artifacts", get(get_artifact))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = create_router(state);

    // Local-only: callers reach the daemon through the loopback interface.
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

fn channel_error(err: &ChannelError) -> ApiError {
    let status = match err {
        ChannelError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ChannelError::Auth(_) | ChannelError::Connection(_) | ChannelError::Transfer(_) => {
            StatusCode::BAD_GATEWAY
        }
    };
    warn!(error = %err, "execution host call failed");
    api_error(status, err.to_string())
}

fn launch_error(err: &LaunchError) -> ApiError {
    match err {
        LaunchError::Channel(e) => channel_error(e),
        LaunchError::JobExists(_) => api_error(StatusCode::CONFLICT, err.to_string()),
        LaunchError::Invalid(_) => api_error(StatusCode::BAD_REQUEST, err.to_string()),
        LaunchError::Script(_) => {
            error!(error = %err, "launch failed");
            api_error(StatusCode::BAD_GATEWAY, err.to_string())
        }
        LaunchError::Metadata(_) => {
            error!(error = %err, "launch failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn poll_error(err: &PollError) -> ApiError {
    match err {
        PollError::Channel(e) => channel_error(e),
        PollError::JobNotFound(_) => api_error(StatusCode::NOT_FOUND, err.to_string()),
        PollError::Invalid(_) => api_error(StatusCode::BAD_REQUEST, err.to_string()),
        PollError::Probe(_) => {
            warn!(error = %err, "probe output unreadable");
            api_error(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Request payload for POST /jobs.
///
/// Exactly one of `command` and `tool` must be set.
#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    #[serde(default)]
    pub job_dir: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub tool: Option<ToolInvocation>,
    #[serde(default)]
    pub info: Option<JobInfo>,
}

/// Query params for GET /jobs/status.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub job_dir: String,
}

/// Request payload for POST /exec.
#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExecResponse {
    pub output: String,
}

/// Request payload for POST /uploads.
#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub dir: String,
    pub filename: String,
    pub content_b64: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub path: String,
    pub bytes: usize,
    pub sha256: String,
}

/// Query params for GET /artifacts.
#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub job_dir: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ArtifactResponse {
    pub name: String,
    pub path: String,
    pub bytes: usize,
    pub content_b64: String,
}

// --- Handlers ---

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "channel": state.channel.describe(),
    }))
}

/// POST /jobs - Launch a job.
async fn start_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let job_id = JobId::new();
    let (command, info) = match (req.command, req.tool) {
        (Some(command), None) => (command, req.info.unwrap_or_default()),
        (None, Some(tool)) => {
            let layout = state.launcher.layout_for(&job_id, req.job_dir.as_deref());
            let command = tool.command(&state.config.tool_bin, &layout.output_dir());
            let info = req
                .info
                .unwrap_or_else(|| tool.info(tool_name(&state.config.tool_bin)));
            (command, info)
        }
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "exactly one of 'command' and 'tool' is required",
            ))
        }
    };

    let request = LaunchRequest {
        job_id,
        job_dir: req.job_dir,
        command,
        info,
    };
    let handle: JobHandle = state
        .launcher
        .start(request)
        .await
        .map_err(|e| launch_error(&e))?;
    Ok((StatusCode::CREATED, Json(handle)))
}

fn tool_name(tool_bin: &str) -> &str {
    tool_bin.rsplit('/').next().unwrap_or(tool_bin)
}

/// GET /jobs/status - Poll a job.
async fn job_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<JobStatus>, ApiError> {
    check_auth(&state, &headers)?;
    let status = state
        .poller
        .status(&query.job_dir)
        .await
        .map_err(|e| poll_error(&e))?;
    Ok(Json(status))
}

/// POST /exec - Run one command on the execution host.
async fn exec_command(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    check_auth(&state, &headers)?;
    if req.command.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "command is empty"));
    }
    let limit = req
        .timeout_sec
        .map_or_else(|| state.config.exec_timeout(), Duration::from_secs);
    let output = state
        .channel
        .execute(&req.command, limit)
        .await
        .map_err(|e| channel_error(&e))?;
    Ok(Json(ExecResponse { output }))
}

/// POST /uploads - Write a file on the execution host.
async fn upload_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<UploadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let content = base64::engine::general_purpose::STANDARD
        .decode(req.content_b64.as_bytes())
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("content_b64: {e}")))?;
    if content.len() > state.config.max_upload_bytes {
        return Err(api_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "file is {} bytes, limit is {}",
                content.len(),
                state.config.max_upload_bytes
            ),
        ));
    }
    if req.dir.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "dir is empty"));
    }
    if !farm_core::layout::is_plain_file_name(&req.filename) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("invalid file name {:?}", req.filename),
        ));
    }

    let path = upload_checked(
        state.channel.as_ref(),
        &req.dir,
        &req.filename,
        &content,
        state.config.verify_uploads,
        state.config.exec_timeout(),
    )
    .await
    .map_err(|e| channel_error(&e))?;
    info!(path = %path, bytes = content.len(), "file uploaded");

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            path,
            bytes: content.len(),
            sha256: sha256_hex(&content),
        }),
    ))
}

/// GET /artifacts - Fetch a file from a job's output directory.
async fn get_artifact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ArtifactQuery>,
) -> Result<Json<ArtifactResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let layout = JobLayout::new(&query.job_dir);
    let name = query.name.strip_prefix("output/").unwrap_or(&query.name);
    let Some(path) = layout.artifact(name) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("artifact name {:?} is outside the output directory", query.name),
        ));
    };
    let content = state
        .channel
        .download(&path, state.config.max_output_bytes)
        .await
        .map_err(|e| channel_error(&e))?;
    Ok(Json(ArtifactResponse {
        name: name.to_string(),
        path,
        bytes: content.len(),
        content_b64: base64::engine::general_purpose::STANDARD.encode(&content),
    }))
}
