//! Channel that runs commands on this machine through `sh -c`.
//!
//! Used when the daemon and the tools share a host, and by the tests.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{check_file_name, combine_output, Capture, ChannelError, FileTransfer, RemoteChannel, Result};

/// Upper bound on waiting for pipes after the shell has exited.
///
/// A detached grandchild that forgot to redirect its output would keep the
/// pipe open forever.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LocalChannel {
    max_output_bytes: usize,
}

impl LocalChannel {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, max_bytes: usize) -> std::io::Result<Vec<u8>> {
    let mut capture = Capture::new(max_bytes);
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        capture.push(&chunk[..n]);
    }
    if capture.dropped() > 0 {
        warn!(max_bytes, dropped = capture.dropped(), "output exceeded limit, truncating");
    }
    Ok(capture.into_bytes())
}

async fn collect(task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>, stream: &str) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}

fn io_transfer_error(action: &str, path: &Path, err: &std::io::Error) -> ChannelError {
    ChannelError::Transfer(format!("{action} {}: {err}", path.display()))
}

impl RemoteChannel for LocalChannel {
    async fn execute(&self, command: &str, limit: Duration) -> Result<String> {
        let started = Instant::now();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChannelError::Connection(format!("failed to spawn sh: {e}")))?;

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_bounded(out, self.max_output_bytes)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_bounded(err, self.max_output_bytes)));

        tokio::select! {
            result = child.wait() => {
                result.map_err(|e| ChannelError::Connection(format!("failed to wait for sh: {e}")))?;
            }
            () = tokio::time::sleep(limit) => {
                warn!(timeout_sec = limit.as_secs_f64(), "local command timed out; killing");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill timed-out command");
                }
                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    task.abort();
                }
                return Err(ChannelError::Timeout(limit));
            }
        }

        let stdout = collect(stdout_task, "stdout").await;
        let stderr = collect(stderr_task, "stderr").await;
        debug!(
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "local command finished"
        );
        Ok(combine_output(stdout, stderr, self.max_output_bytes))
    }
}

impl FileTransfer for LocalChannel {
    async fn upload(&self, dir: &str, filename: &str, content: &[u8]) -> Result<String> {
        check_file_name(filename)?;
        let dir = Path::new(dir);
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| io_transfer_error("cannot create", dir, &e))?;
        let path = dir.join(filename);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_transfer_error("cannot write", &path, &e))?;
        let absolute = tokio::fs::canonicalize(&path)
            .await
            .map_err(|e| io_transfer_error("cannot resolve", &path, &e))?;
        debug!(path = %absolute.display(), bytes = content.len(), "uploaded file");
        Ok(absolute.to_string_lossy().into_owned())
    }

    async fn download(&self, path: &str, max_bytes: usize) -> Result<Vec<u8>> {
        let path = Path::new(path);
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| io_transfer_error("cannot stat", path, &e))?;
        if !meta.is_file() {
            return Err(ChannelError::Transfer(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        if meta.len() > max_bytes as u64 {
            return Err(ChannelError::Transfer(format!(
                "{} is {} bytes, limit is {max_bytes}",
                path.display(),
                meta.len()
            )));
        }
        tokio::fs::read(path)
            .await
            .map_err(|e| io_transfer_error("cannot read", path, &e))
    }
}
