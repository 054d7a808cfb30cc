//! Remote job directory layout.
//!
//! ```text
//! <job_dir>/
//!   meta.json     metadata, written once by the launcher
//!   pid           detached process id, written once by the launcher
//!   exit_code     exit status, written by the job when it terminates
//!   output.log    combined stdout + stderr of the job
//!   output/       artifacts produced by the tool
//! ```
//!
//! Paths are remote paths, so they are plain `/`-joined strings rather
//! than `PathBuf`s of the local machine.

pub const META_FILE: &str = "meta.json";
pub const PID_FILE: &str = "pid";
pub const EXIT_CODE_FILE: &str = "exit_code";
pub const LOG_FILE: &str = "output.log";
pub const OUTPUT_DIR: &str = "output";

/// Paths inside one job directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    dir: String,
}

impl JobLayout {
    pub fn new(dir: impl Into<String>) -> Self {
        let dir = dir.into();
        let trimmed = dir.trim_end_matches('/');
        let dir = if trimmed.is_empty() && dir.starts_with('/') {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
        Self { dir }
    }

    /// Layout for a new job under `jobs_root`.
    pub fn under(jobs_root: &str, job_id: &str) -> Self {
        Self::new(join(jobs_root, job_id))
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn meta(&self) -> String {
        join(&self.dir, META_FILE)
    }

    pub fn pid(&self) -> String {
        join(&self.dir, PID_FILE)
    }

    pub fn exit_code(&self) -> String {
        join(&self.dir, EXIT_CODE_FILE)
    }

    pub fn log(&self) -> String {
        join(&self.dir, LOG_FILE)
    }

    pub fn output_dir(&self) -> String {
        join(&self.dir, OUTPUT_DIR)
    }

    /// Resolve an artifact name inside `output/`.
    ///
    /// Returns `None` for names that would escape the output directory.
    pub fn artifact(&self, name: &str) -> Option<String> {
        let name = name.trim_start_matches("./");
        if name.is_empty()
            || name.starts_with('/')
            || name.split('/').any(|part| part == ".." || part.is_empty())
        {
            return None;
        }
        Some(join(&self.output_dir(), name))
    }
}

/// Join two remote path segments with a single `/`.
pub fn join(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Whether `name` is a single, ordinary path component.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}
