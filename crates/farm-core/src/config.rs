//! Configuration parsing for the job daemon.
//!
//! Same key=value format as `.farm/config`.
//! Precedence: CLI flags > `--config` file > `.farm/config` > env credentials > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("missing required config value: {0}")]
    Missing(&'static str),
    #[error("inconsistent config: {0}")]
    Inconsistent(String),
}

/// How commands reach the execution host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Ssh,
    /// Run on this machine. Single-host setups and tests.
    Local,
}

/// How the SSH host key is checked when no fingerprint is pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Require the key to be listed in `known_hosts`.
    #[default]
    KnownHosts,
    /// Require `host_key_sha256`.
    Pin,
    /// Accept any key. Only for throwaway hosts.
    Accept,
}

impl HostKeyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KnownHosts => "known_hosts",
            Self::Pin => "pin",
            Self::Accept => "accept",
        }
    }
}

/// Canonical `SHA256:<base64, unpadded>` form of a host key fingerprint as
/// printed by `ssh-keygen -lf`. `None` for blank input.
pub fn normalize_host_fingerprint(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let body = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => &trimmed[7..],
        _ => trimmed,
    };
    let body = body.trim().trim_end_matches('=');
    (!body.is_empty()).then(|| format!("SHA256:{body}"))
}

/// Bytes kept free in `max_output_bytes` for sentinels and the log tail.
pub const OUTPUT_HEADROOM_BYTES: usize = 256 * 1024;

/// A credential value that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // Execution host
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub user: String,

    // Credentials, resolved in this order
    pub ssh_key_b64: Option<Secret>,
    pub ssh_key: Option<Secret>,
    pub ssh_key_path: Option<PathBuf>,
    pub ssh_key_passphrase: Option<Secret>,

    // Host key verification
    pub host_key_policy: HostKeyPolicy,
    /// Pinned fingerprint, checked whenever set.
    pub host_key_sha256: Option<String>,
    /// Defaults to `~/.ssh/known_hosts`.
    pub known_hosts_path: Option<PathBuf>,

    // Timeouts
    pub connect_timeout_sec: u64,
    pub exec_timeout_sec: u64,
    pub start_timeout_sec: u64,
    pub poll_timeout_sec: u64,

    // Jobs
    pub jobs_root: String,
    pub tool_bin: String,
    /// Glob patterns (matched by file name) that count as artifacts.
    pub artifact_patterns: Vec<String>,

    // Limits
    pub log_tail_lines: usize,
    pub max_log_bytes: usize,
    pub max_output_bytes: usize,
    /// Largest file accepted by the upload endpoint.
    pub max_upload_bytes: usize,

    /// Compare SHA-256 of uploaded files against the local digest.
    pub verify_uploads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: Transport::Ssh,
            host: String::new(),
            port: 22,
            user: String::new(),
            ssh_key_b64: None,
            ssh_key: None,
            ssh_key_path: None,
            ssh_key_passphrase: None,
            host_key_policy: HostKeyPolicy::KnownHosts,
            host_key_sha256: None,
            known_hosts_path: None,
            connect_timeout_sec: 10,
            exec_timeout_sec: 30,
            start_timeout_sec: 30,
            poll_timeout_sec: 30,
            jobs_root: "/tmp/farm-jobs".to_string(),
            tool_bin: "flow".to_string(),
            artifact_patterns: ["*.gds", "*.gds.gz", "*.oas", "*.def"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            log_tail_lines: 50,
            max_log_bytes: 4 * 1024 * 1024,
            max_output_bytes: 16 * 1024 * 1024,
            max_upload_bytes: 256 * 1024 * 1024,
            verify_uploads: false,
        }
    }
}

/// Environment variables consulted for credentials.
pub const ENV_SSH_KEY_B64: &str = "FARM_SSH_KEY_B64";
pub const ENV_SSH_KEY: &str = "FARM_SSH_KEY";
pub const ENV_SSH_KEY_PATH: &str = "FARM_SSH_KEY_PATH";

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Fill credentials from the environment. Call before loading files so
    /// file values take precedence.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty(ENV_SSH_KEY_B64) {
            self.ssh_key_b64 = Some(Secret::new(v));
        }
        if let Some(v) = non_empty(ENV_SSH_KEY) {
            self.ssh_key = Some(Secret::new(v));
        }
        if let Some(v) = non_empty(ENV_SSH_KEY_PATH) {
            self.ssh_key_path = Some(PathBuf::from(v));
        }
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    pub fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let optional = |value: &str| (!value.is_empty()).then(|| Secret::new(value));
        match key {
            "transport" => {
                self.transport = match value {
                    "ssh" => Transport::Ssh,
                    "local" => Transport::Local,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "transport must be 'ssh' or 'local', got '{value}'"
                        )))
                    }
                }
            }
            "host" => self.host = value.to_string(),
            "port" => self.port = Self::parse_int(key, value)?,
            "user" => self.user = value.to_string(),
            "ssh_key_b64" => self.ssh_key_b64 = optional(value),
            "ssh_key" => self.ssh_key = optional(value),
            "ssh_key_path" => {
                self.ssh_key_path = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "ssh_key_passphrase" => self.ssh_key_passphrase = optional(value),
            "host_key_policy" => {
                self.host_key_policy = match value {
                    "known_hosts" => HostKeyPolicy::KnownHosts,
                    "pin" => HostKeyPolicy::Pin,
                    "accept" => HostKeyPolicy::Accept,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "host_key_policy must be 'known_hosts', 'pin' or 'accept', got '{value}'"
                        )))
                    }
                }
            }
            "host_key_sha256" => self.host_key_sha256 = normalize_host_fingerprint(value),
            "known_hosts_path" => {
                self.known_hosts_path = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "connect_timeout_sec" => self.connect_timeout_sec = Self::parse_int(key, value)?,
            "exec_timeout_sec" => self.exec_timeout_sec = Self::parse_int(key, value)?,
            "start_timeout_sec" => self.start_timeout_sec = Self::parse_int(key, value)?,
            "poll_timeout_sec" => self.poll_timeout_sec = Self::parse_int(key, value)?,
            "jobs_root" => self.jobs_root = value.to_string(),
            "tool_bin" => self.tool_bin = value.to_string(),
            "artifact_patterns" => {
                self.artifact_patterns = value.split_whitespace().map(str::to_string).collect();
            }
            "log_tail_lines" => self.log_tail_lines = Self::parse_int(key, value)?,
            "max_log_bytes" => self.max_log_bytes = Self::parse_int(key, value)?,
            "max_output_bytes" => self.max_output_bytes = Self::parse_int(key, value)?,
            "max_upload_bytes" => self.max_upload_bytes = Self::parse_int(key, value)?,
            "verify_uploads" => self.verify_uploads = Self::parse_bool(key, value)?,
            _ => {
                // Warn but don't fail for unknown keys
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Check that the values needed by the selected transport are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport == Transport::Ssh {
            if self.host.is_empty() {
                return Err(ConfigError::Missing("host"));
            }
            if self.user.is_empty() {
                return Err(ConfigError::Missing("user"));
            }
            if self.host_key_policy == HostKeyPolicy::Pin && self.host_key_sha256.is_none() {
                return Err(ConfigError::Missing("host_key_sha256"));
            }
        }
        // The harvest step returns up to max_log_bytes of log in one reply.
        if self.max_log_bytes.saturating_add(OUTPUT_HEADROOM_BYTES) > self.max_output_bytes {
            return Err(ConfigError::Inconsistent(format!(
                "max_log_bytes ({}) plus {} bytes of headroom must fit in max_output_bytes ({})",
                self.max_log_bytes, OUTPUT_HEADROOM_BYTES, self.max_output_bytes
            )));
        }
        if self.jobs_root.is_empty() {
            return Err(ConfigError::Missing("jobs_root"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_sec)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_sec)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.transport, Transport::Ssh);
        assert_eq!(config.port, 22);
        assert_eq!(config.connect_timeout_sec, 10);
        assert_eq!(config.exec_timeout_sec, 30);
        assert_eq!(config.jobs_root, "/tmp/farm-jobs");
        assert_eq!(config.tool_bin, "flow");
        assert_eq!(
            config.artifact_patterns,
            vec!["*.gds", "*.gds.gz", "*.oas", "*.def"]
        );
        assert_eq!(config.log_tail_lines, 50);
        assert_eq!(config.max_log_bytes, 4 * 1024 * 1024);
        assert!(!config.verify_uploads);
        assert!(config.ssh_key.is_none());
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# execution host
transport=ssh
host="eda-01.lab"
port=2222
user='builder'
start_timeout_sec=45
artifact_patterns=*.gds *.lef
verify_uploads=yes
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.host, "eda-01.lab");
        assert_eq!(config.port, 2222);
        assert_eq!(config.user, "builder");
        assert_eq!(config.start_timeout(), Duration::from_secs(45));
        assert_eq!(config.artifact_patterns, vec!["*.gds", "*.lef"]);
        assert!(config.verify_uploads);
    }

    #[test]
    fn parse_local_transport() {
        let mut config = Config::default();
        config.parse_content("transport=local").unwrap();
        assert_eq!(config.transport, Transport::Local);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_values_fail() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("transport=telnet"),
            Err(ConfigError::InvalidLine(_))
        ));
        assert!(matches!(
            config.parse_content("port=abc"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.parse_content("port=70000"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.parse_content("verify_uploads=maybe"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            config.parse_content("no equals sign"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("color=blue\nhost=h").unwrap();
        assert_eq!(config.host, "h");
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
        assert_eq!(Config::unquote("\""), "\"");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "ON").unwrap());
        assert!(!Config::parse_bool("test", "0").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
    }

    #[test]
    fn env_credentials_sit_below_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_SSH_KEY_B64, "ZW52"),
            (ENV_SSH_KEY_PATH, "/home/u/.ssh/id_ed25519"),
            (ENV_SSH_KEY, "   "),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|name| env.get(name).map(|v| (*v).to_string()));
        assert_eq!(config.ssh_key_b64.as_ref().map(Secret::expose), Some("ZW52"));
        assert!(config.ssh_key.is_none());
        assert_eq!(
            config.ssh_key_path,
            Some(PathBuf::from("/home/u/.ssh/id_ed25519"))
        );

        config.parse_content("ssh_key_b64=ZmlsZQ==").unwrap();
        assert_eq!(
            config.ssh_key_b64.as_ref().map(Secret::expose),
            Some("ZmlsZQ==")
        );
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let mut config = Config::default();
        config.parse_content("ssh_key=-----BEGIN KEY-----").unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("BEGIN KEY"));
        assert!(debug.contains("[redacted]"));
    }

    #[test]
    fn ssh_transport_requires_host_and_user() {
        let mut config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("host"))));
        config.host = "h".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("user"))));
        config.user = "u".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn log_limit_must_fit_in_output_limit() {
        let mut config = Config::default();
        config.transport = Transport::Local;
        config.max_log_bytes = config.max_output_bytes;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Inconsistent(_))
        ));
        config.max_log_bytes = config.max_output_bytes - OUTPUT_HEADROOM_BYTES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn host_fingerprints_are_normalized() {
        let canonical = "SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8";
        assert_eq!(
            normalize_host_fingerprint("sha256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8=").as_deref(),
            Some(canonical)
        );
        assert_eq!(
            normalize_host_fingerprint("  nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8 ").as_deref(),
            Some(canonical)
        );
        assert_eq!(normalize_host_fingerprint("  "), None);
        assert_eq!(normalize_host_fingerprint("SHA256:"), None);
    }

    #[test]
    fn pin_policy_requires_fingerprint() {
        let mut config = Config::default();
        config
            .parse_content("host=h\nuser=u\nhost_key_policy=pin")
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("host_key_sha256"))
        ));
        config
            .parse_content("host_key_sha256=SHA256:abc=")
            .unwrap();
        assert_eq!(config.host_key_sha256.as_deref(), Some("SHA256:abc"));
        assert!(config.validate().is_ok());
        assert!(matches!(
            config.parse_content("host_key_policy=trust"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn from_file_merges_with_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "host=eda\nuser=me\nlog_tail_lines=10\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.host, "eda");
        assert_eq!(config.log_tail_lines, 10);
        assert_eq!(config.exec_timeout_sec, 30);
    }

    #[test]
    fn from_file_reports_missing_file() {
        let result = Config::from_file(Path::new("/nonexistent/farm/config"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }
}
