//! Commands and file retrieval inside a debug container

use crate::cluster::{exec_capture, ClusterClient, ExecOutput, ExitStatus, StreamOptions};
use crate::error::{DebugError, Result};
use crate::humanize::format_size;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};

/// Minimum interval between copy progress reports
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Copies interrupted by a stream error or a failed integrity check are retried
const COPY_ATTEMPTS: u32 = 3;

const COPY_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Runs shell commands in a remote container and fetches files from it
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `script` with a shell; non-zero exits are errors
    async fn run(&self, script: &str) -> Result<ExecOutput>;

    /// Copy a remote file to `local_path`, returning the number of bytes written
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<u64>;
}

/// [`RemoteShell`] over exec streams into one container
#[derive(Debug, Clone)]
pub struct ContainerShell {
    cluster: ClusterClient,
    pod: String,
    container: String,
}

impl ContainerShell {
    pub fn new(cluster: ClusterClient, pod: String, container: String) -> Self {
        Self {
            cluster,
            pod,
            container,
        }
    }

    fn command(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }
}

#[async_trait]
impl RemoteShell for ContainerShell {
    async fn run(&self, script: &str) -> Result<ExecOutput> {
        debug!(container = %self.container, script = %script, "Running remote command");
        exec_capture(&*self.cluster, &self.pod, &self.container, Self::command(script))
            .await?
            .into_result()
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let mut attempt = 1;
        loop {
            match self.copy_once(remote_path, local_path).await {
                Err(e @ (DebugError::Transport(_) | DebugError::IntegrityMismatch { .. }))
                    if attempt < COPY_ATTEMPTS =>
                {
                    warn!("Copy attempt {} of {} failed: {}", attempt, COPY_ATTEMPTS, e);
                    attempt += 1;
                    tokio::time::sleep(COPY_RETRY_DELAY).await;
                }
                result => return result,
            }
        }
    }
}

impl ContainerShell {
    async fn copy_once(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let quoted = shell_quote(remote_path);
        let size = parse_size(&self.run(&format!("stat -c %s {}", quoted)).await?.stdout)?;
        let checksum = parse_checksum(&self.run(&format!("sha256sum {}", quoted)).await?.stdout)?;

        info!("Copying {} ({}) to {}", remote_path, format_size(size), local_path.display());

        if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = std::fs::File::create(local_path)?;

        let mut streams = self
            .cluster
            .exec(
                &self.pod,
                &self.container,
                Self::command(&format!("gzip -c {}", quoted)),
                StreamOptions::default(),
            )
            .await?;
        let stdout = streams
            .stdout
            .take()
            .ok_or_else(|| DebugError::Transport("remote copy has no output stream".to_string()))?;
        let mut stderr = streams.stderr.take();

        let reader = SyncIoBridge::new(stdout);
        let copy = tokio::task::spawn_blocking(move || {
            let mut decoder = GzDecoder::new(reader);
            let mut writer = ProgressWriter::new(file, size);
            io::copy(&mut decoder, &mut writer)?;
            writer.finish()
        });
        let drain_stderr = async {
            let mut buf = Vec::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let (copied, remote_stderr) = tokio::join!(copy, drain_stderr);
        let status = streams.status.await;
        streams.finished.await?;

        if let ExitStatus::Code(code) = ExitStatus::from_status(status.as_ref()) {
            return Err(DebugError::RemoteExit {
                code,
                stderr: remote_stderr,
            });
        }

        let copied = copied
            .map_err(|e| DebugError::Transport(format!("copy task failed: {}", e)))?
            .map_err(|e| DebugError::Transport(format!("failed to copy {}: {}", remote_path, e)))?;

        verify(local_path, &copied, size, &checksum)?;
        info!("Copied {} to {}", format_size(copied.bytes), local_path.display());
        Ok(copied.bytes)
    }
}

fn verify(local_path: &Path, copied: &Copied, size: u64, checksum: &str) -> Result<()> {
    if copied.bytes != size {
        return Err(DebugError::IntegrityMismatch {
            path: local_path.display().to_string(),
            reason: format!("expected {} bytes, received {}", size, copied.bytes),
        });
    }
    if copied.sha256 != checksum {
        return Err(DebugError::IntegrityMismatch {
            path: local_path.display().to_string(),
            reason: format!("sha256 {} does not match remote {}", copied.sha256, checksum),
        });
    }
    Ok(())
}

fn parse_size(stdout: &str) -> Result<u64> {
    stdout
        .trim()
        .parse()
        .map_err(|_| DebugError::Remote(format!("unexpected file size output: '{}'", stdout.trim())))
}

fn parse_checksum(stdout: &str) -> Result<String> {
    stdout
        .split_whitespace()
        .next()
        .filter(|sum| sum.len() == 64 && sum.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| DebugError::Remote(format!("unexpected checksum output: '{}'", stdout.trim())))
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Local path for `file_name` in `dir`, or just the name if `dir` is empty
pub fn local_path(dir: &Path, file_name: &Path) -> PathBuf {
    if file_name.is_absolute() || dir.as_os_str().is_empty() {
        file_name.to_path_buf()
    } else {
        dir.join(file_name)
    }
}

struct Copied {
    bytes: u64,
    sha256: String,
}

/// Hashes and counts bytes on their way to disk, logging progress
struct ProgressWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
    total: u64,
    last_report: Instant,
}

impl<W: Write> ProgressWriter<W> {
    fn new(inner: W, total: u64) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
            total,
            last_report: Instant::now(),
        }
    }

    fn percent(&self) -> u64 {
        if self.total == 0 {
            100
        } else {
            (self.written.saturating_mul(100) / self.total).min(100)
        }
    }

    fn finish(mut self) -> io::Result<Copied> {
        self.inner.flush()?;
        info!("Copy progress: {}% ({})", self.percent(), format_size(self.written));
        Ok(Copied {
            bytes: self.written,
            sha256: hex::encode(self.hasher.finalize()),
        })
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;

        if self.last_report.elapsed() >= PROGRESS_INTERVAL {
            self.last_report = Instant::now();
            info!("Copy progress: {}% ({})", self.percent(), format_size(self.written));
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
