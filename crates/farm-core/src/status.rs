//! Job state machine.
//!
//! State is derived from the job directory on every poll; nothing is
//! stored remotely besides what the job itself writes.
//!
//! | exit marker     | process   | state                    |
//! |-----------------|-----------|--------------------------|
//! | `0`             | any       | completed                |
//! | nonzero         | any       | failed (`non_zero_exit`) |
//! | absent          | alive     | running                  |
//! | absent          | dead      | failed (`process_died`)  |
//! | absent          | unknown   | running                  |
//!
//! "Unknown" covers a missing or unparseable pid file. The launcher
//! writes the pid right after spawning, so a missing pid is a launch still
//! in flight and not a failure.

use crate::types::{FailureKind, JobMetadata, JobState, JobStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Contents of the exit marker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitMarker {
    Absent,
    Code(i32),
    /// Present but not an integer (empty, partially written, garbage).
    Unreadable(String),
}

/// Whether the recorded pid is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Gone, or a zombie.
    Dead,
    /// No usable pid to check.
    Unknown,
}

/// Raw observations from one probe of a job directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub metadata: Option<JobMetadata>,
    pub pid: Option<u32>,
    pub exit_marker: ExitMarker,
    pub liveness: Liveness,
    pub log_tail: String,
}

/// Classification of a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureKind>,
    pub diagnostic: Option<String>,
}

impl Verdict {
    fn running() -> Self {
        Self {
            state: JobState::Running,
            exit_code: None,
            failure: None,
            diagnostic: None,
        }
    }

    fn failed(kind: FailureKind, exit_code: Option<i32>, message: String, log_tail: &str) -> Self {
        Self {
            state: JobState::Failed,
            exit_code,
            failure: Some(kind),
            diagnostic: Some(diagnostic(&message, log_tail)),
        }
    }
}

fn diagnostic(message: &str, log_tail: &str) -> String {
    let tail = log_tail.trim_end();
    if tail.is_empty() {
        format!("{message}\n--- log tail ---\n(log is empty)")
    } else {
        format!("{message}\n--- log tail ---\n{tail}")
    }
}

/// Decide a job's state from one probe.
pub fn classify(probe: &Probe) -> Verdict {
    match &probe.exit_marker {
        ExitMarker::Code(0) => Verdict {
            state: JobState::Completed,
            exit_code: Some(0),
            failure: None,
            diagnostic: None,
        },
        ExitMarker::Code(code) => Verdict::failed(
            FailureKind::NonZeroExit,
            Some(*code),
            format!("job exited with code {code}"),
            &probe.log_tail,
        ),
        ExitMarker::Absent => match probe.liveness {
            Liveness::Dead => Verdict::failed(
                FailureKind::ProcessDied,
                None,
                format!(
                    "process {} is gone and left no exit status (killed or crashed)",
                    probe.pid.map_or_else(|| "?".to_string(), |p| p.to_string())
                ),
                &probe.log_tail,
            ),
            Liveness::Alive | Liveness::Unknown => Verdict::running(),
        },
        // A marker mid-write reads as garbage. Only trust it once the
        // process is gone.
        ExitMarker::Unreadable(raw) => match probe.liveness {
            Liveness::Dead => Verdict::failed(
                FailureKind::ProcessDied,
                None,
                format!("process ended with an unreadable exit status {raw:?}"),
                &probe.log_tail,
            ),
            Liveness::Alive | Liveness::Unknown => Verdict::running(),
        },
    }
}

/// Whole seconds since the job started; 0 without readable metadata.
pub fn elapsed_sec(metadata: Option<&JobMetadata>, now: DateTime<Utc>) -> u64 {
    metadata.map_or(0, |meta| {
        u64::try_from((now - meta.started_at).num_seconds()).unwrap_or(0)
    })
}

/// Build the status returned to callers. Stats and artifacts are filled
/// in by the poller for completed jobs.
pub fn status_from_probe(job_dir: &str, probe: Probe, now: DateTime<Utc>) -> JobStatus {
    let verdict = classify(&probe);
    let log_tail = (!probe.log_tail.is_empty()).then_some(probe.log_tail);
    JobStatus {
        job_dir: job_dir.to_string(),
        state: verdict.state,
        elapsed_sec: elapsed_sec(probe.metadata.as_ref(), now),
        exit_code: verdict.exit_code,
        failure: verdict.failure,
        diagnostic: verdict.diagnostic,
        log_tail,
        stats: None,
        artifact_present: None,
        artifacts: Vec::new(),
        metadata: probe.metadata,
    }
}

/// Terminal outcome remembered for one job directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Terminal {
    state: JobState,
    exit_code: Option<i32>,
    failure: Option<FailureKind>,
}

/// Terminal outcome seen per job directory.
///
/// Once a job has been reported terminal, later polls never report it as
/// running again, even if the directory is tampered with. Only the outcome
/// is kept; logs, stats and metadata are re-read on every poll.
#[derive(Debug, Default)]
pub struct StateLedger {
    terminal: Mutex<HashMap<String, Terminal>>,
}

impl StateLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `status` and return what should be reported.
    ///
    /// The first terminal outcome seen for a directory sticks: a later
    /// observation that disagrees is rewritten to match it.
    pub fn observe(&self, mut status: JobStatus) -> JobStatus {
        let mut terminal = match self.terminal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let observed = Terminal {
            state: status.state,
            exit_code: status.exit_code,
            failure: status.failure,
        };
        match terminal.get(&status.job_dir) {
            Some(pinned) if *pinned != observed => pin(&mut status, *pinned),
            Some(_) => {}
            None => {
                if status.state.is_terminal() {
                    terminal.insert(status.job_dir.clone(), observed);
                }
            }
        }
        status
    }

    /// Recorded terminal state for `job_dir`, if any.
    pub fn get(&self, job_dir: &str) -> Option<JobState> {
        let terminal = match self.terminal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        terminal.get(job_dir).map(|t| t.state)
    }

    pub fn len(&self) -> usize {
        match self.terminal.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn pin(status: &mut JobStatus, pinned: Terminal) {
    status.state = pinned.state;
    status.exit_code = pinned.exit_code;
    status.failure = pinned.failure;
    if pinned.state == JobState::Failed {
        let message = match (pinned.failure, pinned.exit_code) {
            (Some(FailureKind::NonZeroExit), Some(code)) => format!("job exited with code {code}"),
            _ => "process ended without reporting an exit status".to_string(),
        };
        status.diagnostic = Some(diagnostic(
            &message,
            status.log_tail.as_deref().unwrap_or_default(),
        ));
    } else {
        status.diagnostic = None;
    }
    if pinned.state != JobState::Completed {
        status.stats = None;
        status.artifact_present = None;
        status.artifacts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobId, JobInfo};
    use chrono::Duration;

    fn probe(exit_marker: ExitMarker, liveness: Liveness) -> Probe {
        Probe {
            metadata: None,
            pid: Some(4242),
            exit_marker,
            liveness,
            log_tail: "step 1\nstep 2\n".to_string(),
        }
    }

    #[test]
    fn exit_zero_completes_regardless_of_liveness() {
        for liveness in [Liveness::Alive, Liveness::Dead, Liveness::Unknown] {
            let verdict = classify(&probe(ExitMarker::Code(0), liveness));
            assert_eq!(verdict.state, JobState::Completed);
            assert_eq!(verdict.exit_code, Some(0));
            assert!(verdict.diagnostic.is_none());
        }
    }

    #[test]
    fn nonzero_exit_fails_with_code_and_tail() {
        let verdict = classify(&probe(ExitMarker::Code(7), Liveness::Dead));
        assert_eq!(verdict.state, JobState::Failed);
        assert_eq!(verdict.exit_code, Some(7));
        assert_eq!(verdict.failure, Some(FailureKind::NonZeroExit));
        let diagnostic = verdict.diagnostic.unwrap();
        assert!(diagnostic.contains('7'));
        assert!(diagnostic.contains("step 2"));
    }

    #[test]
    fn live_process_without_marker_is_running() {
        let verdict = classify(&probe(ExitMarker::Absent, Liveness::Alive));
        assert_eq!(verdict.state, JobState::Running);
        assert!(verdict.failure.is_none());
    }

    #[test]
    fn dead_process_without_marker_failed() {
        let verdict = classify(&probe(ExitMarker::Absent, Liveness::Dead));
        assert_eq!(verdict.state, JobState::Failed);
        assert_eq!(verdict.exit_code, None);
        assert_eq!(verdict.failure, Some(FailureKind::ProcessDied));
        assert!(verdict.diagnostic.unwrap().contains("4242"));
    }

    #[test]
    fn missing_pid_is_running() {
        let mut p = probe(ExitMarker::Absent, Liveness::Unknown);
        p.pid = None;
        assert_eq!(classify(&p).state, JobState::Running);
    }

    #[test]
    fn unreadable_marker_waits_for_process_exit() {
        let alive = classify(&probe(ExitMarker::Unreadable(String::new()), Liveness::Alive));
        assert_eq!(alive.state, JobState::Running);

        let dead = classify(&probe(ExitMarker::Unreadable("x".to_string()), Liveness::Dead));
        assert_eq!(dead.state, JobState::Failed);
        assert_eq!(dead.failure, Some(FailureKind::ProcessDied));
    }

    #[test]
    fn empty_log_is_called_out() {
        let mut p = probe(ExitMarker::Code(1), Liveness::Dead);
        p.log_tail = String::new();
        assert!(classify(&p).diagnostic.unwrap().contains("(log is empty)"));
    }

    #[test]
    fn elapsed_uses_metadata_start() {
        let now = Utc::now();
        let meta = JobMetadata::new(
            JobId::new(),
            &JobInfo::default(),
            "true",
            now - Duration::seconds(95),
        );
        assert_eq!(elapsed_sec(Some(&meta), now), 95);
        assert_eq!(elapsed_sec(None, now), 0);
    }

    #[test]
    fn elapsed_never_negative() {
        let now = Utc::now();
        let meta = JobMetadata::new(
            JobId::new(),
            &JobInfo::default(),
            "true",
            now + Duration::seconds(30),
        );
        assert_eq!(elapsed_sec(Some(&meta), now), 0);
    }

    #[test]
    fn status_from_probe_drops_empty_tail() {
        let mut p = probe(ExitMarker::Absent, Liveness::Alive);
        p.log_tail = String::new();
        let status = status_from_probe("/tmp/j", p, Utc::now());
        assert_eq!(status.state, JobState::Running);
        assert!(status.log_tail.is_none());
    }

    #[test]
    fn ledger_keeps_terminal_states() {
        let ledger = StateLedger::new();
        let now = Utc::now();

        let running = status_from_probe("/tmp/j", probe(ExitMarker::Absent, Liveness::Alive), now);
        assert_eq!(ledger.observe(running.clone()).state, JobState::Running);
        assert!(ledger.get("/tmp/j").is_none());

        let failed = status_from_probe("/tmp/j", probe(ExitMarker::Code(2), Liveness::Dead), now);
        assert_eq!(ledger.observe(failed).state, JobState::Failed);

        let reported = ledger.observe(running);
        assert_eq!(reported.state, JobState::Failed);
        assert_eq!(reported.exit_code, Some(2));
        assert_eq!(reported.failure, Some(FailureKind::NonZeroExit));
        let diagnostic = reported.diagnostic.unwrap();
        assert!(diagnostic.contains("code 2"));
        assert!(diagnostic.contains("step 2"));
        assert_eq!(ledger.get("/tmp/j"), Some(JobState::Failed));
    }

    #[test]
    fn first_terminal_status_sticks() {
        let ledger = StateLedger::new();
        let now = Utc::now();
        ledger.observe(status_from_probe(
            "/tmp/j",
            probe(ExitMarker::Code(0), Liveness::Dead),
            now,
        ));
        let later = ledger.observe(status_from_probe(
            "/tmp/j",
            probe(ExitMarker::Code(9), Liveness::Dead),
            now + Duration::seconds(10),
        ));
        assert_eq!(later.state, JobState::Completed);
        assert_eq!(later.exit_code, Some(0));
        assert!(later.failure.is_none());
        assert!(later.diagnostic.is_none());
    }

    #[test]
    fn ledger_keeps_one_compact_entry_per_directory() {
        let ledger = StateLedger::new();
        let now = Utc::now();
        assert!(ledger.is_empty());
        for _ in 0..3 {
            let mut done = status_from_probe("/tmp/j", probe(ExitMarker::Code(0), Liveness::Dead), now);
            done.stats = Some([("cells".to_string(), "1".to_string())].into());
            let reported = ledger.observe(done);
            assert_eq!(reported.stats.unwrap()["cells"], "1");
        }
        ledger.observe(status_from_probe("/tmp/r", probe(ExitMarker::Absent, Liveness::Alive), now));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn ledger_tracks_directories_separately() {
        let ledger = StateLedger::new();
        let now = Utc::now();
        ledger.observe(status_from_probe(
            "/tmp/a",
            probe(ExitMarker::Code(0), Liveness::Dead),
            now,
        ));
        let b = ledger.observe(status_from_probe(
            "/tmp/b",
            probe(ExitMarker::Absent, Liveness::Alive),
            now,
        ));
        assert_eq!(b.state, JobState::Running);
    }
}
