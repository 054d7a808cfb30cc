//! Output rendering for farmctl.

use farm_core::{JobHandle, JobState, JobStatus};

use crate::client::UploadResponse;

/// Print confirmation after launching a job.
pub fn print_job_started(handle: &JobHandle) {
    println!("Started job: {}", handle.job_id);
    println!("  Dir:    {}", handle.job_dir);
    println!();
    println!("Poll with: farmctl status {}", handle.job_dir);
}

pub fn print_status(status: &JobStatus) {
    print!("{}", format_status(status));
}

/// Human-readable job status.
pub fn format_status(status: &JobStatus) -> String {
    let mut out = String::new();
    let mut line = |s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    line(format!("Job: {}", status.job_dir));
    if let Some(meta) = &status.metadata {
        line(format!("  Design:  {} ({})", meta.design, meta.tool));
        line(format!(
            "  Started: {}",
            meta.started_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    line(format!("  Status:  {}", format_state(status.state)));
    line(format!("  Elapsed: {}", format_elapsed(status.elapsed_sec)));

    match status.state {
        JobState::Running => {
            line(String::new());
            line(format!(
                "Still running. Poll again with: farmctl status {}",
                status.job_dir
            ));
        }
        JobState::Completed => {
            if let Some(stats) = status.stats.as_ref().filter(|s| !s.is_empty()) {
                line(String::new());
                line("  Stats:".to_string());
                for (field, value) in stats {
                    line(format!("    {field:<12} {value}"));
                }
            }
            line(String::new());
            if status.artifacts.is_empty() {
                line("  Artifacts: none".to_string());
            } else {
                line("  Artifacts:".to_string());
                for artifact in &status.artifacts {
                    line(format!("    {artifact}"));
                }
            }
        }
        JobState::Failed => {
            if let Some(code) = status.exit_code {
                line(format!("  Exit:    {code}"));
            }
            if let Some(kind) = status.failure {
                line(format!("  Reason:  {}", kind.as_str()));
            }
            if let Some(diagnostic) = &status.diagnostic {
                line(String::new());
                line(diagnostic.clone());
            }
        }
    }
    out
}

pub fn print_upload(upload: &UploadResponse) {
    println!("Uploaded {} bytes to {}", upload.bytes, upload.path);
    println!("  sha256: {}", upload.sha256);
}

fn format_state(state: JobState) -> &'static str {
    match state {
        JobState::Running => "RUNNING",
        JobState::Completed => "COMPLETED",
        JobState::Failed => "FAILED",
    }
}

fn format_elapsed(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}
