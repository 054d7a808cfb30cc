//! Command execution and file transfer against the execution host.
//!
//! Every call opens its own connection. Nothing is pooled, so a dropped
//! connection only ever fails the call that was using it.

pub mod local;
pub mod ssh;

use std::future::Future;
use std::time::Duration;

use farm_core::config::{Config, Transport};
use farm_core::script::{checksum_script, parse_checksum, sha256_hex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::{CredentialError, Credentials};
pub use local::LocalChannel;
pub use ssh::{SshChannel, SshTarget};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("command did not finish within {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("transfer failed: {0}")]
    Transfer(String),
}

impl From<CredentialError> for ChannelError {
    fn from(err: CredentialError) -> Self {
        Self::Auth(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Runs one shell command on the execution host.
///
/// A nonzero exit status is not an error: callers inspect the returned
/// text instead.
pub trait RemoteChannel: Send + Sync {
    fn execute(&self, command: &str, timeout: Duration)
        -> impl Future<Output = Result<String>> + Send;
}

/// Binary-safe file movement to and from the execution host.
pub trait FileTransfer: Send + Sync {
    /// Write `content` to `dir/filename`, creating `dir` if needed.
    /// Returns the absolute remote path.
    fn upload(
        &self,
        dir: &str,
        filename: &str,
        content: &[u8],
    ) -> impl Future<Output = Result<String>> + Send;

    /// Read a remote file, refusing anything larger than `max_bytes`.
    fn download(&self, path: &str, max_bytes: usize)
        -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// The configured transport.
#[derive(Debug, Clone)]
pub enum Channel {
    Ssh(SshChannel),
    Local(LocalChannel),
}

impl Channel {
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.transport {
            Transport::Local => Ok(Self::Local(LocalChannel::new(config.max_output_bytes))),
            Transport::Ssh => {
                let credentials = Credentials::resolve(config)?;
                Ok(Self::Ssh(SshChannel::new(
                    SshTarget::from_config(config),
                    credentials,
                    config.max_output_bytes,
                )))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Ssh(ssh) => ssh.describe(),
            Self::Local(_) => "local".to_string(),
        }
    }
}

impl RemoteChannel for Channel {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<String> {
        match self {
            Self::Ssh(ssh) => ssh.execute(command, timeout).await,
            Self::Local(local) => local.execute(command, timeout).await,
        }
    }
}

impl FileTransfer for Channel {
    async fn upload(&self, dir: &str, filename: &str, content: &[u8]) -> Result<String> {
        match self {
            Self::Ssh(ssh) => ssh.upload(dir, filename, content).await,
            Self::Local(local) => local.upload(dir, filename, content).await,
        }
    }

    async fn download(&self, path: &str, max_bytes: usize) -> Result<Vec<u8>> {
        match self {
            Self::Ssh(ssh) => ssh.download(path, max_bytes).await,
            Self::Local(local) => local.download(path, max_bytes).await,
        }
    }
}

/// Reject anything but a single ordinary path component.
pub(crate) fn check_file_name(filename: &str) -> Result<()> {
    if farm_core::layout::is_plain_file_name(filename) {
        Ok(())
    } else {
        Err(ChannelError::Transfer(format!(
            "invalid file name {filename:?}: must be a single path component"
        )))
    }
}

/// Upload, then optionally compare the remote SHA-256 with the local one.
pub async fn upload_checked<C>(
    channel: &C,
    dir: &str,
    filename: &str,
    content: &[u8],
    verify: bool,
    timeout: Duration,
) -> Result<String>
where
    C: RemoteChannel + FileTransfer,
{
    let path = channel.upload(dir, filename, content).await?;
    if !verify {
        return Ok(path);
    }

    let expected = sha256_hex(content);
    let script = checksum_script(&path);
    let output = channel.execute(&script.text, timeout).await?;
    match parse_checksum(&script, &output) {
        Ok(Some(actual)) if actual == expected => {
            debug!(path = %path, sha256 = %actual, "upload verified");
            Ok(path)
        }
        Ok(Some(actual)) => Err(ChannelError::Transfer(format!(
            "checksum mismatch for {path}: expected {expected}, remote has {actual}"
        ))),
        Ok(None) => {
            warn!(path = %path, "no sha256 tool on execution host; upload not verified");
            Ok(path)
        }
        Err(e) => Err(ChannelError::Transfer(format!(
            "could not verify {path}: {e}"
        ))),
    }
}

/// Bounded capture buffer shared by the channel implementations.
#[derive(Debug)]
pub(crate) struct Capture {
    buf: Vec<u8>,
    max_bytes: usize,
    dropped: usize,
}

impl Capture {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_bytes.min(8192)),
            max_bytes,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let remaining = self.max_bytes.saturating_sub(self.buf.len());
        let take = chunk.len().min(remaining);
        self.buf.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    pub(crate) fn dropped(&self) -> usize {
        self.dropped
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// stdout followed by stderr, capped at `max_bytes` in total.
pub(crate) fn combine_output(stdout: Vec<u8>, stderr: Vec<u8>, max_bytes: usize) -> String {
    let mut combined = stdout;
    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with(b"\n") {
            combined.push(b'\n');
        }
        combined.extend_from_slice(&stderr);
    }
    if combined.len() > max_bytes {
        warn!(
            bytes = combined.len(),
            max_bytes, "combined output exceeded limit, truncating"
        );
        combined.truncate(max_bytes);
    }
    String::from_utf8_lossy(&combined).into_owned()
}
