//! Status poller.
//!
//! Reads the job directory, classifies the job, and for completed jobs
//! parses stats from the log and lists artifacts. Polling never writes to
//! the execution host.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use farm_core::layout::JobLayout;
use farm_core::script::{self, ScriptError};
use farm_core::stats::{LineTableParser, StatsParser};
use farm_core::status::{status_from_probe, StateLedger};
use farm_core::{Config, JobState, JobStatus};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, RemoteChannel};

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("job directory not found: {0}")]
    JobNotFound(String),
    #[error("unreadable probe output: {0}")]
    Probe(#[from] ScriptError),
    #[error("invalid job directory: {0:?}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, PollError>;

pub struct Poller<C> {
    channel: Arc<C>,
    parser: Box<dyn StatsParser>,
    ledger: StateLedger,
    poll_timeout: Duration,
    log_tail_lines: usize,
    max_log_bytes: usize,
    artifact_patterns: Vec<String>,
}

impl<C> std::fmt::Debug for Poller<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("poll_timeout", &self.poll_timeout)
            .field("log_tail_lines", &self.log_tail_lines)
            .field("artifact_patterns", &self.artifact_patterns)
            .finish_non_exhaustive()
    }
}

impl<C: RemoteChannel> Poller<C> {
    pub fn new(channel: Arc<C>, config: &Config) -> Self {
        Self {
            channel,
            parser: Box::new(LineTableParser::default()),
            ledger: StateLedger::new(),
            poll_timeout: config.poll_timeout(),
            log_tail_lines: config.log_tail_lines,
            max_log_bytes: config.max_log_bytes,
            artifact_patterns: config.artifact_patterns.clone(),
        }
    }

    /// Replace the stats parser.
    pub fn with_parser(mut self, parser: Box<dyn StatsParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Current status of the job in `job_dir`.
    pub async fn status(&self, job_dir: &str) -> Result<JobStatus> {
        if job_dir.trim().is_empty() {
            return Err(PollError::Invalid(job_dir.to_string()));
        }
        let layout = JobLayout::new(job_dir);

        let probe_script = script::probe_script(&layout, self.log_tail_lines);
        let output = self
            .channel
            .execute(&probe_script.text, self.poll_timeout)
            .await?;
        let Some(probe) = script::parse_probe(&probe_script, &output)? else {
            return Err(PollError::JobNotFound(layout.dir().to_string()));
        };
        let pid = probe.pid;
        let first_terminal = self.ledger.get(layout.dir()).is_none();
        let mut status = self
            .ledger
            .observe(status_from_probe(layout.dir(), probe, Utc::now()));

        if status.state == JobState::Completed {
            let harvest_script =
                script::harvest_script(&layout, self.max_log_bytes, &self.artifact_patterns);
            let output = self
                .channel
                .execute(&harvest_script.text, self.poll_timeout)
                .await?;
            let harvest = script::parse_harvest(&harvest_script, &output)?;
            if harvest.log.len() >= self.max_log_bytes {
                warn!(
                    job_dir = %layout.dir(),
                    max_log_bytes = self.max_log_bytes,
                    "log truncated for stats parsing"
                );
            }
            let stats = self.parser.parse(&harvest.log);
            status.artifact_present = Some(!harvest.artifacts.is_empty());
            status.artifacts = harvest.artifacts;
            status.stats = Some(stats);
        }

        if status.state.is_terminal() && first_terminal {
            info!(
                job_dir = %status.job_dir,
                state = %status.state,
                exit_code = ?status.exit_code,
                failure = ?status.failure.map(|f| f.as_str()),
                elapsed_sec = status.elapsed_sec,
                "job finished"
            );
        } else {
            debug!(
                job_dir = %status.job_dir,
                state = %status.state,
                pid = ?pid,
                elapsed_sec = status.elapsed_sec,
                "job polled"
            );
        }
        Ok(status)
    }
}
