//! SSH channel built on libssh2.
//!
//! libssh2 is blocking, so every call runs on the blocking pool with its
//! own session. Exec uses a non-blocking read loop so the deadline is
//! enforced even when the remote command prints nothing.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use farm_core::config::{normalize_host_fingerprint, Config, HostKeyPolicy};
use ssh2::{CheckResult, HashType, KnownHostFileKind, OpenFlags, OpenType, Session, Sftp};
use tracing::{debug, warn};

use super::{check_file_name, combine_output, Capture, ChannelError, FileTransfer, RemoteChannel, Result};
use crate::credentials::{expand_home, Credentials, KeySource};

/// Idle wait between polls of a non-blocking channel.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Time allowed for the channel to close after a timeout.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Network address and timeouts of the execution host.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Socket timeout for SFTP operations.
    pub transfer_timeout: Duration,
    pub host_key: HostKeyCheck,
}

impl SshTarget {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
            transfer_timeout: config.exec_timeout(),
            host_key: HostKeyCheck::from_config(config),
        }
    }
}

/// Host key verification done right after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyCheck {
    /// Expected `SHA256:` fingerprint.
    Pin(String),
    /// OpenSSH `known_hosts` file.
    KnownHosts(PathBuf),
    Accept,
}

impl HostKeyCheck {
    /// A pinned fingerprint wins over the policy.
    pub fn from_config(config: &Config) -> Self {
        if let Some(fingerprint) = &config.host_key_sha256 {
            return Self::Pin(fingerprint.clone());
        }
        match config.host_key_policy {
            HostKeyPolicy::Accept => Self::Accept,
            HostKeyPolicy::KnownHosts | HostKeyPolicy::Pin => Self::KnownHosts(
                config
                    .known_hosts_path
                    .as_deref()
                    .map_or_else(|| expand_home(Path::new("~/.ssh/known_hosts")), expand_home),
            ),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pin(_) => "pinned key",
            Self::KnownHosts(_) => "known_hosts",
            Self::Accept => "any key",
        }
    }
}

/// OpenSSH-style fingerprint of a SHA-256 host key hash.
pub fn host_fingerprint(hash: &[u8]) -> String {
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash)
    )
}

fn check_fingerprint(expected: &str, hash: &[u8]) -> Result<()> {
    let actual = host_fingerprint(hash);
    if normalize_host_fingerprint(expected).as_deref() == Some(actual.as_str()) {
        return Ok(());
    }
    Err(ChannelError::Auth(format!(
        "SSH host key mismatch (expected {expected}, got {actual})"
    )))
}

fn verify_host_key(session: &Session, target: &SshTarget) -> Result<()> {
    match &target.host_key {
        HostKeyCheck::Accept => {
            warn!(host = %target.host, "host key not verified");
            Ok(())
        }
        HostKeyCheck::Pin(expected) => {
            let hash = session
                .host_key_hash(HashType::Sha256)
                .ok_or_else(|| ChannelError::Auth("server presented no host key".to_string()))?;
            check_fingerprint(expected, hash)
        }
        HostKeyCheck::KnownHosts(path) => {
            let (key, _) = session
                .host_key()
                .ok_or_else(|| ChannelError::Auth("server presented no host key".to_string()))?;
            let mut known = session
                .known_hosts()
                .map_err(|e| map_ssh_error("known_hosts", e))?;
            known
                .read_file(path, KnownHostFileKind::OpenSSH)
                .map_err(|e| ChannelError::Auth(format!("cannot read {}: {e}", path.display())))?;
            match known.check_port(&target.host, target.port, key) {
                CheckResult::Match => Ok(()),
                CheckResult::NotFound => Err(ChannelError::Auth(format!(
                    "{} is not listed in {}",
                    target.host,
                    path.display()
                ))),
                CheckResult::Mismatch => Err(ChannelError::Auth(format!(
                    "SSH host key mismatch for {} (see {})",
                    target.host,
                    path.display()
                ))),
                CheckResult::Failure => Err(ChannelError::Auth(format!(
                    "cannot check host key of {}",
                    target.host
                ))),
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    target: SshTarget,
    credentials: Credentials,
    max_output_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct SshChannel {
    inner: Arc<Inner>,
}

impl SshChannel {
    pub fn new(target: SshTarget, credentials: Credentials, max_output_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                target,
                credentials,
                max_output_bytes,
            }),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "ssh {}@{}:{} ({}, {})",
            self.inner.credentials.user,
            self.inner.target.host,
            self.inner.target.port,
            self.inner.credentials.describe_source(),
            self.inner.target.host_key.as_str()
        )
    }

    /// Run `work` with a fresh authenticated session on the blocking pool.
    async fn with_session<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Inner, Session) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let session = connect(&inner)?;
            work(&inner, session)
        })
        .await
        .map_err(|e| ChannelError::Connection(format!("ssh task failed: {e}")))?
    }
}

fn connect(inner: &Inner) -> Result<Session> {
    let target = &inner.target;
    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| ChannelError::Connection(format!("cannot resolve {}: {e}", target.host)))?
        .next()
        .ok_or_else(|| ChannelError::Connection(format!("no address for {}", target.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, target.connect_timeout)
        .map_err(|e| ChannelError::Connection(format!("cannot connect to {addr}: {e}")))?;
    let _ = tcp.set_read_timeout(Some(target.connect_timeout));
    let _ = tcp.set_write_timeout(Some(target.connect_timeout));

    let mut session =
        Session::new().map_err(|e| ChannelError::Connection(format!("cannot create session: {e}")))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(duration_ms(target.connect_timeout));
    session
        .handshake()
        .map_err(|e| map_ssh_error("handshake", e))?;
    verify_host_key(&session, target)?;

    let creds = &inner.credentials;
    let passphrase = creds.passphrase.as_ref().map(|p| p.expose());
    let auth = match &creds.key {
        KeySource::Memory(key) => {
            session.userauth_pubkey_memory(&creds.user, None, key.expose(), passphrase)
        }
        KeySource::File(path) => session.userauth_pubkey_file(&creds.user, None, path, passphrase),
    };
    auth.map_err(|e| ChannelError::Auth(format!("{} as {}: {e}", creds.describe_source(), creds.user)))?;
    if !session.authenticated() {
        return Err(ChannelError::Auth(format!(
            "server rejected key for {}",
            creds.user
        )));
    }
    Ok(session)
}

fn duration_ms(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

fn map_ssh_error(action: &str, err: ssh2::Error) -> ChannelError {
    let io_err: std::io::Error = err.into();
    ChannelError::Connection(format!("{action}: {io_err}"))
}

fn map_transfer_error(action: &str, path: &str, err: ssh2::Error) -> ChannelError {
    ChannelError::Transfer(format!("{action} {path}: {err}"))
}

fn exec_blocking(inner: &Inner, session: &Session, command: &str, limit: Duration) -> Result<String> {
    let started = Instant::now();
    let mut channel = session
        .channel_session()
        .map_err(|e| map_ssh_error("open channel", e))?;
    channel.exec(command).map_err(|e| map_ssh_error("exec", e))?;
    session.set_blocking(false);

    let mut stdout = Capture::new(inner.max_output_bytes);
    let mut stderr = Capture::new(inner.max_output_bytes);
    let mut stderr_stream = channel.stderr();
    let mut buf = [0u8; 8192];
    let mut timed_out = false;

    loop {
        let mut progressed = false;
        match channel.read(&mut buf) {
            Ok(n) if n > 0 => {
                stdout.push(&buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(ChannelError::Connection(format!("stdout read failed: {e}"))),
        }
        match stderr_stream.read(&mut buf) {
            Ok(n) if n > 0 => {
                stderr.push(&buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(ChannelError::Connection(format!("stderr read failed: {e}"))),
        }

        if !progressed && channel.eof() {
            break;
        }
        if started.elapsed() > limit {
            timed_out = true;
            break;
        }
        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    if timed_out {
        warn!(
            timeout_sec = limit.as_secs_f64(),
            host = %inner.target.host,
            "remote command timed out; closing channel"
        );
        let _ = channel.close();
        let deadline = Instant::now() + CLOSE_GRACE;
        while Instant::now() < deadline && !channel.eof() {
            std::thread::sleep(POLL_INTERVAL);
        }
        return Err(ChannelError::Timeout(limit));
    }

    let _ = channel.close();
    for capture in [&stdout, &stderr] {
        if capture.dropped() > 0 {
            warn!(dropped = capture.dropped(), "remote output exceeded limit, truncating");
        }
    }
    let stdout = stdout.into_bytes();
    let stderr = stderr.into_bytes();
    debug!(
        host = %inner.target.host,
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        duration_ms = started.elapsed().as_millis() as u64,
        "remote command finished"
    );
    Ok(combine_output(stdout, stderr, inner.max_output_bytes))
}

/// Create `dir` one component at a time.
fn ensure_remote_dir(sftp: &Sftp, dir: &str) -> Result<()> {
    let mut current = PathBuf::new();
    for part in Path::new(dir).components() {
        current.push(part);
        if current.as_os_str().is_empty() || sftp.stat(&current).is_ok() {
            continue;
        }
        // A concurrent mkdir may win; the stat below settles it.
        let _ = sftp.mkdir(&current, 0o755);
    }
    match sftp.stat(Path::new(dir)) {
        Ok(stat) if stat.is_dir() => Ok(()),
        Ok(_) => Err(ChannelError::Transfer(format!("{dir} exists and is not a directory"))),
        Err(e) => Err(map_transfer_error("cannot create", dir, e)),
    }
}

fn upload_blocking(sftp: &Sftp, dir: &str, filename: &str, content: &[u8]) -> Result<String> {
    ensure_remote_dir(sftp, dir)?;
    let path = farm_core::layout::join(dir, filename);
    let mut file = sftp
        .open_mode(
            Path::new(&path),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o644,
            OpenType::File,
        )
        .map_err(|e| map_transfer_error("cannot open", &path, e))?;
    file.write_all(content)
        .map_err(|e| ChannelError::Transfer(format!("cannot write {path}: {e}")))?;
    drop(file);
    let absolute = sftp
        .realpath(Path::new(&path))
        .map_err(|e| map_transfer_error("cannot resolve", &path, e))?;
    Ok(absolute.to_string_lossy().into_owned())
}

fn download_blocking(sftp: &Sftp, path: &str, max_bytes: usize) -> Result<Vec<u8>> {
    let stat = sftp
        .stat(Path::new(path))
        .map_err(|e| map_transfer_error("cannot stat", path, e))?;
    if !stat.is_file() {
        return Err(ChannelError::Transfer(format!("{path} is not a regular file")));
    }
    if let Some(size) = stat.size {
        if size > max_bytes as u64 {
            return Err(ChannelError::Transfer(format!(
                "{path} is {size} bytes, limit is {max_bytes}"
            )));
        }
    }
    let file = sftp
        .open(Path::new(path))
        .map_err(|e| map_transfer_error("cannot open", path, e))?;
    let mut content = Vec::new();
    file.take(max_bytes as u64 + 1)
        .read_to_end(&mut content)
        .map_err(|e| ChannelError::Transfer(format!("cannot read {path}: {e}")))?;
    if content.len() > max_bytes {
        return Err(ChannelError::Transfer(format!(
            "{path} grew past the {max_bytes} byte limit"
        )));
    }
    Ok(content)
}

impl RemoteChannel for SshChannel {
    async fn execute(&self, command: &str, limit: Duration) -> Result<String> {
        let command = command.to_string();
        self.with_session(move |inner, session| exec_blocking(inner, &session, &command, limit))
            .await
    }
}

impl FileTransfer for SshChannel {
    async fn upload(&self, dir: &str, filename: &str, content: &[u8]) -> Result<String> {
        check_file_name(filename)?;
        let dir = dir.to_string();
        let filename = filename.to_string();
        let content = content.to_vec();
        self.with_session(move |inner, session| {
            session.set_timeout(duration_ms(inner.target.transfer_timeout));
            let sftp = session
                .sftp()
                .map_err(|e| ChannelError::Transfer(format!("sftp unavailable: {e}")))?;
            let path = upload_blocking(&sftp, &dir, &filename, &content)?;
            debug!(path = %path, bytes = content.len(), "uploaded file");
            Ok(path)
        })
        .await
    }

    async fn download(&self, path: &str, max_bytes: usize) -> Result<Vec<u8>> {
        let path = path.to_string();
        self.with_session(move |inner, session| {
            session.set_timeout(duration_ms(inner.target.transfer_timeout));
            let sftp = session
                .sftp()
                .map_err(|e| ChannelError::Transfer(format!("sftp unavailable: {e}")))?;
            download_blocking(&sftp, &path, max_bytes)
        })
        .await
    }
}
