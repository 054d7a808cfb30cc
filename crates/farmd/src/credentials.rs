//! SSH credential resolution.
//!
//! Sources are tried in order: base64-encoded key, raw key text, key file
//! path. The first one configured wins; nothing configured is an error.

use base64::Engine as _;
use farm_core::config::{Config, Secret};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no ssh key configured (set ssh_key_b64, ssh_key or ssh_key_path)")]
    Missing,
    #[error("ssh_key_b64 is not valid base64: {0}")]
    InvalidBase64(String),
    #[error("decoded ssh key is not valid UTF-8")]
    NotUtf8,
    #[error("ssh key file {path} is not readable: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CredentialError>;

/// Where the private key comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// PEM/OpenSSH key text held in memory.
    Memory(Secret),
    File(PathBuf),
}

/// Resolved login material for one execution host.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub key: KeySource,
    pub passphrase: Option<Secret>,
}

impl Credentials {
    pub fn resolve(config: &Config) -> Result<Self> {
        Ok(Self {
            user: config.user.clone(),
            key: resolve_key(config)?,
            passphrase: config.ssh_key_passphrase.clone(),
        })
    }

    pub fn describe_source(&self) -> String {
        match &self.key {
            KeySource::Memory(_) => "inline key".to_string(),
            KeySource::File(path) => format!("key file {}", path.display()),
        }
    }
}

fn resolve_key(config: &Config) -> Result<KeySource> {
    if let Some(encoded) = &config.ssh_key_b64 {
        let compact: String = encoded
            .expose()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| CredentialError::InvalidBase64(e.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|_| CredentialError::NotUtf8)?;
        return Ok(KeySource::Memory(Secret::new(text)));
    }

    if let Some(raw) = &config.ssh_key {
        return Ok(KeySource::Memory(Secret::new(normalize_key_text(
            raw.expose(),
        ))));
    }

    if let Some(path) = &config.ssh_key_path {
        let path = expand_home(path);
        std::fs::metadata(&path).map_err(|source| CredentialError::Unreadable {
            path: path.clone(),
            source,
        })?;
        return Ok(KeySource::File(path));
    }

    Err(CredentialError::Missing)
}

/// Keys passed through env vars often arrive with literal `\n` escapes.
fn normalize_key_text(raw: &str) -> String {
    let text = if raw.contains('\n') {
        raw.to_string()
    } else {
        raw.replace("\\n", "\n")
    };
    if text.ends_with('\n') {
        text
    } else {
        format!("{text}\n")
    }
}

pub(crate) fn expand_home(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => std::env::var_os("HOME")
            .map_or_else(|| path.to_path_buf(), |home| PathBuf::from(home).join(rest)),
        Err(_) => path.to_path_buf(),
    }
}
