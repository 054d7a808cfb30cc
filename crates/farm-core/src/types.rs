//! Core types for remote jobs.
//!
//! A job is one detached invocation of an external tool on the execution
//! host. Everything the poller knows about it lives in the job directory
//! (see [`crate::layout`]); these types are the local view of that state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifier for a job, derived from its creation time.
///
/// Format: `job-YYYYMMDD-HHMMSS-xxxxxxxx`. The suffix comes from a `UUIDv7`
/// so ids created within the same second stay distinct and still sort by
/// creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Build an id for a job created at `created_at`.
    pub fn at(created_at: DateTime<Utc>) -> Self {
        let suffix = Uuid::now_v7().simple().to_string();
        // Last 8 hex chars are random bits in a v7 UUID.
        let suffix = &suffix[suffix.len() - 8..];
        Self(format!("job-{}-{suffix}", created_at.format("%Y%m%d-%H%M%S")))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a job.
///
/// `Running` moves to exactly one of the terminal states and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The job wrote an exit marker with a nonzero status.
    NonZeroExit,
    /// The process disappeared without writing an exit marker.
    ProcessDied,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonZeroExit => "non_zero_exit",
            Self::ProcessDied => "process_died",
        }
    }
}

/// Caller-supplied description of what a job runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Tool name (e.g. `flow`, `yosys`, `magic`).
    pub tool: String,
    /// Design (top module) name.
    pub design: String,
    /// Target clock frequency in MHz.
    #[serde(default)]
    pub frequency_mhz: Option<f64>,
    /// Process design kit identifier.
    #[serde(default)]
    pub pdk: Option<String>,
}

/// Contents of `meta.json`, written once by the launcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: JobId,
    pub tool: String,
    pub design: String,
    #[serde(default)]
    pub frequency_mhz: Option<f64>,
    #[serde(default)]
    pub pdk: Option<String>,
    /// Command as passed to the launcher, before wrapping.
    pub command: String,
    pub started_at: DateTime<Utc>,
    /// State declared at launch time. Always `running`; the live state is
    /// derived from marker files, never written back here.
    pub state: JobState,
}

impl JobMetadata {
    pub fn new(job_id: JobId, info: &JobInfo, command: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            tool: info.tool.clone(),
            design: info.design.clone(),
            frequency_mhz: info.frequency_mhz,
            pdk: info.pdk.clone(),
            command: command.to_string(),
            started_at,
            state: JobState::Running,
        }
    }
}

/// Handle returned by the launcher; enough to poll the job later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub job_dir: String,
}

/// Parsed metrics from a tool log: field name to raw text.
///
/// Sparse by design: a missing field means "unknown".
pub type Stats = BTreeMap<String, String>;

/// Result of polling a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_dir: String,
    pub state: JobState,
    /// Seconds since `started_at` (0 when metadata is unreadable).
    pub elapsed_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Human-readable explanation for `Failed` jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// Last lines of `output.log`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_tail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_present: Option<bool>,
    /// Artifact paths relative to the job directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn job_id_encodes_creation_time() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let id = JobId::at(at);
        assert!(id.0.starts_with("job-20260314-092653-"), "got {id}");
        assert_eq!(id.0.len(), "job-20260314-092653-".len() + 8);
    }

    #[test]
    fn job_ids_are_unique_within_a_second() {
        let at = Utc::now();
        assert_ne!(JobId::at(at), JobId::at(at));
    }

    #[test]
    fn job_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobState::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&JobState::Failed).unwrap(),
            "\"failed\""
        );
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn metadata_declares_running() {
        let info = JobInfo {
            tool: "flow".to_string(),
            design: "counter".to_string(),
            frequency_mhz: Some(100.0),
            pdk: Some("sky130".to_string()),
        };
        let meta = JobMetadata::new(JobId::new(), &info, "flow --top counter", Utc::now());
        assert_eq!(meta.state, JobState::Running);
        assert_eq!(meta.design, "counter");

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["pdk"], "sky130");
    }

    #[test]
    fn status_omits_empty_optionals() {
        let status = JobStatus {
            job_dir: "/tmp/j1".to_string(),
            state: JobState::Running,
            elapsed_sec: 3,
            exit_code: None,
            failure: None,
            diagnostic: None,
            log_tail: None,
            stats: None,
            artifact_present: None,
            artifacts: Vec::new(),
            metadata: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "running");
        assert!(json.get("exit_code").is_none());
        assert!(json.get("artifacts").is_none());
    }
}
