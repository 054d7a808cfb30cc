//! Shell scripts run on the execution host, and parsers for their output.
//!
//! Every remote step is one POSIX `sh` script executed over a fresh
//! channel. Scripts report back through sentinel lines that carry a
//! per-script nonce, so log content can never be mistaken for protocol
//! output.

use crate::layout::JobLayout;
use crate::status::{ExitMarker, Liveness, Probe};
use crate::types::JobMetadata;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("remote output is missing the end sentinel (truncated or failed script): {0}")]
    Truncated(String),
    #[error("remote step failed: {0}")]
    StepFailed(String),
    #[error("no process id in launcher output: {0}")]
    MissingPid(String),
}

pub type Result<T> = std::result::Result<T, ScriptError>;

/// Quote a value for POSIX `sh` as a single word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A script plus the nonce its sentinels use.
#[derive(Debug, Clone)]
pub struct Script {
    pub text: String,
    nonce: String,
}

impl Script {
    fn new(build: impl FnOnce(&Sentinels) -> String) -> Self {
        let sentinels = Sentinels::new(Uuid::now_v7().simple().to_string());
        let text = build(&sentinels);
        Self {
            text,
            nonce: sentinels.nonce,
        }
    }

    fn sentinels(&self) -> Sentinels {
        Sentinels::new(self.nonce.clone())
    }
}

struct Sentinels {
    nonce: String,
}

impl Sentinels {
    fn new(nonce: String) -> Self {
        Self { nonce }
    }

    fn tag(&self) -> String {
        format!("__FARM_{}__", self.nonce)
    }

    /// `echo` statement emitting `<tag> <word>`.
    fn emit(&self, word: &str) -> String {
        format!("echo '{} {word}'", self.tag())
    }

    /// `echo` statement emitting `<tag> KEY name=$value` (value expanded).
    fn emit_key(&self, name: &str, value_expr: &str) -> String {
        format!("echo \"{} KEY {name}={value_expr}\"", self.tag())
    }
}

/// Sentinel-delimited output of a script.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sections {
    pub words: Vec<String>,
    pub keys: BTreeMap<String, String>,
    pub sections: BTreeMap<String, String>,
    pub ended: bool,
}

impl Sections {
    fn has(&self, word: &str) -> bool {
        self.words.iter().any(|w| w == word)
    }

    fn section(&self, name: &str) -> Option<&str> {
        self.sections.get(name).map(String::as_str)
    }
}

/// Split script output into words, keys and named sections.
///
/// Lines outside any section that are not sentinels (shell noise, login
/// banners) are dropped.
fn split_sections(output: &str, tag: &str) -> Sections {
    fn close<'a>(current: &mut Option<(String, Vec<&'a str>)>, parsed: &mut Sections) {
        if let Some((name, lines)) = current.take() {
            let body = lines.join("\n");
            parsed
                .sections
                .insert(name, body.trim_end_matches(['\n', '\r', ' ']).to_string());
        }
    }

    let mut parsed = Sections::default();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in output.lines() {
        let Some(rest) = line.strip_prefix(tag) else {
            if let Some((_, lines)) = current.as_mut() {
                lines.push(line);
            }
            continue;
        };
        let rest = rest.trim();
        if let Some(name) = rest.strip_prefix("SECTION ") {
            close(&mut current, &mut parsed);
            current = Some((name.trim().to_string(), Vec::new()));
        } else if let Some(kv) = rest.strip_prefix("KEY ") {
            if let Some((k, v)) = kv.split_once('=') {
                parsed.keys.insert(k.trim().to_string(), v.trim().to_string());
            }
        } else if rest == "END" {
            close(&mut current, &mut parsed);
            parsed.ended = true;
        } else {
            close(&mut current, &mut parsed);
            parsed.words.push(rest.to_string());
        }
    }
    close(&mut current, &mut parsed);
    parsed
}

fn preview(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= 400 {
        trimmed.to_string()
    } else {
        let mut cut = 400;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &trimmed[..cut])
    }
}

// --- Launcher scripts ---

/// Outcome of the prepare step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepared {
    Ready,
    /// The directory already holds a launched job.
    AlreadyLaunched,
}

/// Create `<dir>/output`, refusing directories that already hold a pid.
pub fn prepare_script(layout: &JobLayout) -> Script {
    Script::new(|s| {
        [
            format!(
                "mkdir -p {} || {{ {}; exit 1; }}",
                shell_quote(&layout.output_dir()),
                s.emit("MKDIR_FAILED")
            ),
            format!(
                "if [ -e {} ]; then {}; {}; exit 0; fi",
                shell_quote(&layout.pid()),
                s.emit("EXISTS"),
                s.emit("END")
            ),
            s.emit("READY"),
            s.emit("END"),
        ]
        .join("\n")
    })
}

pub fn parse_prepare(script: &Script, output: &str) -> Result<Prepared> {
    let parsed = split_sections(output, &script.sentinels().tag());
    if parsed.has("MKDIR_FAILED") {
        return Err(ScriptError::StepFailed(format!(
            "could not create job directory: {}",
            preview(output)
        )));
    }
    if !parsed.ended {
        return Err(ScriptError::Truncated(preview(output)));
    }
    if parsed.has("EXISTS") {
        Ok(Prepared::AlreadyLaunched)
    } else if parsed.has("READY") {
        Ok(Prepared::Ready)
    } else {
        Err(ScriptError::StepFailed(preview(output)))
    }
}

/// Wrap `command` so it records its own exit status.
///
/// The EXIT trap writes the status to a temp file and renames it into
/// place, so the poller sees either no marker or a complete one.
/// SIGKILL (OOM killer, `kill -9`) skips the trap; the poller's liveness
/// probe covers that case.
pub fn job_wrapper(layout: &JobLayout, command: &str) -> String {
    [
        "rc=1".to_string(),
        format!("marker={}", shell_quote(&layout.exit_code())),
        "trap 'printf \"%s\\n\" \"$rc\" > \"$marker.tmp\" && mv -f \"$marker.tmp\" \"$marker\"' EXIT"
            .to_string(),
        "trap 'rc=143; exit 143' TERM".to_string(),
        "trap 'rc=130; exit 130' INT".to_string(),
        "(".to_string(),
        command.to_string(),
        ")".to_string(),
        "rc=$?".to_string(),
        "exit \"$rc\"".to_string(),
    ]
    .join("\n")
}

/// Start the wrapped command detached and record its pid.
pub fn spawn_script(layout: &JobLayout, command: &str) -> Script {
    let wrapper = job_wrapper(layout, command);
    Script::new(|s| {
        [
            format!(
                "cd {} || {{ {}; exit 1; }}",
                shell_quote(layout.dir()),
                s.emit("CD_FAILED")
            ),
            format!(
                "nohup sh -c {} > {} 2>&1 < /dev/null &",
                shell_quote(&wrapper),
                shell_quote(&layout.log())
            ),
            "job_pid=$!".to_string(),
            format!("printf '%s\\n' \"$job_pid\" > {}", shell_quote(&layout.pid())),
            s.emit_key("pid", "$job_pid"),
            s.emit("END"),
        ]
        .join("\n")
    })
}

pub fn parse_spawn(script: &Script, output: &str) -> Result<u32> {
    let parsed = split_sections(output, &script.sentinels().tag());
    if parsed.has("CD_FAILED") {
        return Err(ScriptError::StepFailed(format!(
            "job directory is not accessible: {}",
            preview(output)
        )));
    }
    if !parsed.ended {
        return Err(ScriptError::Truncated(preview(output)));
    }
    parsed
        .keys
        .get("pid")
        .and_then(|pid| pid.parse::<u32>().ok())
        .filter(|pid| *pid > 0)
        .ok_or_else(|| ScriptError::MissingPid(preview(output)))
}

// --- Poller scripts ---

/// Byte cap on the log tail returned by a probe. A tool that redraws a
/// progress line with `\r` can leave a single "line" of many megabytes.
pub const LOG_TAIL_MAX_BYTES: usize = 64 * 1024;

/// Gather everything the state machine needs in one round trip.
pub fn probe_script(layout: &JobLayout, tail_lines: usize) -> Script {
    let d = shell_quote(layout.dir());
    Script::new(|s| {
        [
            format!("d={d}"),
            format!(
                "if [ ! -d \"$d\" ]; then {}; {}; exit 0; fi",
                s.emit("MISSING"),
                s.emit("END")
            ),
            format!("{}\ncat \"$d/meta.json\" 2>/dev/null\necho", s.emit("SECTION meta")),
            "pid=$(tr -dc '0-9' < \"$d/pid\" 2>/dev/null | head -c 20)".to_string(),
            s.emit_key("pid", "$pid"),
            "if [ -f \"$d/exit_code\" ]; then exit_present=1; else exit_present=0; fi".to_string(),
            s.emit_key("exit_present", "$exit_present"),
            format!(
                "{}\nif [ \"$exit_present\" = 1 ]; then head -c 64 \"$d/exit_code\" 2>/dev/null; echo; fi",
                s.emit("SECTION exit_code")
            ),
            "alive=unknown".to_string(),
            [
                "if [ -n \"$pid\" ]; then",
                "  if kill -0 \"$pid\" 2>/dev/null || [ -d \"/proc/$pid\" ]; then",
                "    alive=yes",
                "    if [ -r \"/proc/$pid/stat\" ] && grep -q ') Z ' \"/proc/$pid/stat\" 2>/dev/null; then alive=no; fi",
                "  else",
                "    alive=no",
                "  fi",
                "fi",
            ]
            .join("\n"),
            s.emit_key("alive", "$alive"),
            format!(
                "{}\ntail -n {tail_lines} \"$d/output.log\" 2>/dev/null | tail -c {LOG_TAIL_MAX_BYTES}\necho",
                s.emit("SECTION log_tail")
            ),
            s.emit("END"),
        ]
        .join("\n")
    })
}

/// Parse probe output. `Ok(None)` means the job directory does not exist.
pub fn parse_probe(script: &Script, output: &str) -> Result<Option<Probe>> {
    let parsed = split_sections(output, &script.sentinels().tag());
    if !parsed.ended {
        return Err(ScriptError::Truncated(preview(output)));
    }
    if parsed.has("MISSING") {
        return Ok(None);
    }

    let meta_raw = parsed.section("meta").unwrap_or_default();
    let metadata = if meta_raw.trim().is_empty() {
        None
    } else {
        serde_json::from_str::<JobMetadata>(meta_raw.trim()).ok()
    };

    let pid = parsed
        .keys
        .get("pid")
        .and_then(|p| p.parse::<u32>().ok())
        .filter(|p| *p > 0);

    let exit_marker = if parsed.keys.get("exit_present").map(String::as_str) == Some("1") {
        let raw = parsed.section("exit_code").unwrap_or_default().trim();
        match raw.parse::<i32>() {
            Ok(code) => ExitMarker::Code(code),
            Err(_) => ExitMarker::Unreadable(raw.to_string()),
        }
    } else {
        ExitMarker::Absent
    };

    let liveness = match parsed.keys.get("alive").map(String::as_str) {
        Some("yes") => Liveness::Alive,
        Some("no") => Liveness::Dead,
        _ => Liveness::Unknown,
    };

    Ok(Some(Probe {
        metadata,
        pid,
        exit_marker,
        liveness,
        log_tail: parsed.section("log_tail").unwrap_or_default().to_string(),
    }))
}

/// What the poller collects once a job has completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Harvest {
    /// Log text, capped to the last `max_log_bytes` bytes.
    pub log: String,
    /// Artifact paths relative to the job directory (`output/...`).
    pub artifacts: Vec<String>,
}

/// Read the log and list artifacts matching `patterns` under `output/`.
pub fn harvest_script(layout: &JobLayout, max_log_bytes: usize, patterns: &[String]) -> Script {
    let d = shell_quote(layout.dir());
    let find = if patterns.is_empty() {
        String::new()
    } else {
        let names = patterns
            .iter()
            .map(|p| format!("-name {}", shell_quote(p)))
            .collect::<Vec<_>>()
            .join(" -o ");
        format!("(cd \"$d\" && find output -type f \\( {names} \\) 2>/dev/null | head -n 1000)")
    };
    Script::new(|s| {
        [
            format!("d={d}"),
            format!(
                "{}\ntail -c {max_log_bytes} \"$d/output.log\" 2>/dev/null\necho",
                s.emit("SECTION log")
            ),
            s.emit("SECTION artifacts"),
            find,
            s.emit("END"),
        ]
        .join("\n")
    })
}

pub fn parse_harvest(script: &Script, output: &str) -> Result<Harvest> {
    let parsed = split_sections(output, &script.sentinels().tag());
    if !parsed.ended {
        return Err(ScriptError::Truncated(preview(output)));
    }
    let mut artifacts: Vec<String> = parsed
        .section("artifacts")
        .unwrap_or_default()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    artifacts.sort();
    Ok(Harvest {
        log: parsed.section("log").unwrap_or_default().to_string(),
        artifacts,
    })
}

// --- Transfer verification ---

/// Hex SHA-256 of `content`, as printed by `sha256sum`.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Compute the SHA-256 of a remote file.
pub fn checksum_script(path: &str) -> Script {
    let p = shell_quote(path);
    Script::new(|s| {
        [
            s.emit("SECTION sum"),
            format!("sha256sum {p} 2>/dev/null || shasum -a 256 {p} 2>/dev/null"),
            s.emit("END"),
        ]
        .join("\n")
    })
}

/// Extract the hex digest; `None` if no tool produced one.
pub fn parse_checksum(script: &Script, output: &str) -> Result<Option<String>> {
    let parsed = split_sections(output, &script.sentinels().tag());
    if !parsed.ended {
        return Err(ScriptError::Truncated(preview(output)));
    }
    Ok(parsed
        .section("sum")
        .and_then(|body| body.split_whitespace().next())
        .filter(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase))
}
