//! Job launcher.
//!
//! Starts a command detached on the execution host and returns as soon as
//! the process id is recorded. Three bounded round trips:
//!
//! 1. prepare the job directory (refusing one that already holds a job)
//! 2. upload `meta.json`
//! 3. spawn the wrapped command under `nohup` and record its pid
//!
//! Once `start` returns the job no longer depends on this process or on
//! the connection that launched it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use farm_core::layout::{JobLayout, META_FILE};
use farm_core::script::{self, Prepared, ScriptError};
use farm_core::{Config, JobHandle, JobId, JobInfo, JobMetadata};
use thiserror::Error;
use tracing::{debug, info};

use crate::channel::{upload_checked, ChannelError, FileTransfer, RemoteChannel};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("job directory already holds a launched job: {0}")]
    JobExists(String),
    #[error("launch failed: {0}")]
    Script(#[from] ScriptError),
    #[error("metadata could not be encoded: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("invalid launch request: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, LaunchError>;

/// What to launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub job_id: JobId,
    /// Working directory on the execution host. Defaults to
    /// `<jobs_root>/<job_id>`.
    pub job_dir: Option<String>,
    pub command: String,
    pub info: JobInfo,
}

impl LaunchRequest {
    pub fn new(command: impl Into<String>, info: JobInfo) -> Self {
        Self {
            job_id: JobId::new(),
            job_dir: None,
            command: command.into(),
            info,
        }
    }

    pub fn in_dir(mut self, job_dir: impl Into<String>) -> Self {
        self.job_dir = Some(job_dir.into());
        self
    }
}

#[derive(Debug)]
pub struct Launcher<C> {
    channel: Arc<C>,
    jobs_root: String,
    start_timeout: Duration,
    verify_uploads: bool,
}

impl<C: RemoteChannel + FileTransfer> Launcher<C> {
    pub fn new(channel: Arc<C>, config: &Config) -> Self {
        Self {
            channel,
            jobs_root: config.jobs_root.clone(),
            start_timeout: config.start_timeout(),
            verify_uploads: config.verify_uploads,
        }
    }

    /// Directory layout a request will use.
    pub fn layout_for(&self, job_id: &JobId, job_dir: Option<&str>) -> JobLayout {
        match job_dir {
            Some(dir) => JobLayout::new(dir),
            None => JobLayout::under(&self.jobs_root, job_id.as_ref()),
        }
    }

    /// Launch a job and return its handle.
    pub async fn start(&self, request: LaunchRequest) -> Result<JobHandle> {
        if request.command.trim().is_empty() {
            return Err(LaunchError::Invalid("command is empty".to_string()));
        }
        if request.job_dir.as_deref().is_some_and(|d| d.trim().is_empty()) {
            return Err(LaunchError::Invalid("job_dir is empty".to_string()));
        }

        let started = Instant::now();
        let layout = self.layout_for(&request.job_id, request.job_dir.as_deref());
        let job_dir = layout.dir().to_string();

        let prepare = script::prepare_script(&layout);
        let output = self.channel.execute(&prepare.text, self.start_timeout).await?;
        if script::parse_prepare(&prepare, &output)? == Prepared::AlreadyLaunched {
            return Err(LaunchError::JobExists(job_dir));
        }
        debug!(job_dir = %job_dir, "job directory prepared");

        let metadata = JobMetadata::new(
            request.job_id.clone(),
            &request.info,
            &request.command,
            Utc::now(),
        );
        let encoded = serde_json::to_vec_pretty(&metadata)?;
        upload_checked(
            self.channel.as_ref(),
            layout.dir(),
            META_FILE,
            &encoded,
            self.verify_uploads,
            self.start_timeout,
        )
        .await?;

        let spawn = script::spawn_script(&layout, &request.command);
        let output = self.channel.execute(&spawn.text, self.start_timeout).await?;
        let pid = script::parse_spawn(&spawn, &output)?;

        info!(
            job_id = %request.job_id,
            job_dir = %job_dir,
            pid,
            tool = %request.info.tool,
            design = %request.info.design,
            duration_ms = started.elapsed().as_millis() as u64,
            "job launched"
        );

        Ok(JobHandle {
            job_id: request.job_id,
            job_dir,
        })
    }
}
