//! CPU profile collection with `dotnet-trace`

use crate::bounded::BoundedOperation;
use crate::cluster::ClusterClient;
use crate::config::DebugConfig;
use crate::container::{DebugContainerManager, DebugContainerSpec};
use crate::error::{DebugError, Result};
use crate::humanize::{format_duration, format_size};
use crate::process_info::{probe_process, ProcessInfo};
use crate::remote::{local_path, shell_quote, RemoteShell};
use crate::resolver::pod_name_of;
use crate::session::cancellable;
use chrono::Local;
use k8s_openapi::api::core::v1::Pod;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Longest trace we allow
pub const MAX_PROFILE_DURATION: Duration = Duration::from_secs(3600);

/// Grace period on top of the trace duration before the trace counts as hung
const TRACE_GRACE: Duration = Duration::from_secs(120);

/// Trace output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileFormat {
    #[default]
    NetTrace,
    Speedscope,
    Chromium,
}

impl ProfileFormat {
    /// Name `dotnet-trace --format` expects
    pub fn trace_arg(&self) -> &'static str {
        match self {
            ProfileFormat::NetTrace => "NetTrace",
            ProfileFormat::Speedscope => "Speedscope",
            ProfileFormat::Chromium => "Chromium",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ProfileFormat::NetTrace => "nettrace",
            ProfileFormat::Speedscope => "speedscope.json",
            ProfileFormat::Chromium => "trace.json",
        }
    }
}

impl FromStr for ProfileFormat {
    type Err = DebugError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nettrace" => Ok(ProfileFormat::NetTrace),
            "speedscope" => Ok(ProfileFormat::Speedscope),
            "chromium" => Ok(ProfileFormat::Chromium),
            _ => Err(DebugError::InvalidArgument(format!(
                "invalid format '{}': must be one of 'nettrace', 'speedscope' or 'chromium'",
                s
            ))),
        }
    }
}

/// Parameters of one CPU profile
#[derive(Debug, Clone)]
pub struct CpuProfileRequest {
    pub format: ProfileFormat,
    pub duration: Duration,
    pub output_path: Option<PathBuf>,
    /// Passed through to `dotnet-trace collect`
    pub extra_args: Vec<String>,
}

impl Default for CpuProfileRequest {
    fn default() -> Self {
        Self {
            format: ProfileFormat::default(),
            duration: Duration::from_secs(30),
            output_path: None,
            extra_args: Vec::new(),
        }
    }
}

impl CpuProfileRequest {
    /// Check the duration and pick the output path
    pub fn validate(&self) -> Result<PathBuf> {
        if self.duration < Duration::from_secs(1) {
            return Err(DebugError::InvalidArgument(
                "duration must be at least 1 second".to_string(),
            ));
        }
        if self.duration > MAX_PROFILE_DURATION {
            return Err(DebugError::InvalidArgument(
                "duration must not exceed 3600 seconds (1 hour)".to_string(),
            ));
        }

        let extension = self.format.extension();
        match &self.output_path {
            None => Ok(PathBuf::from(format!(
                "profile-{}.{}",
                Local::now().format("%Y%m%d-%H%M%S"),
                extension
            ))),
            Some(path) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        DebugError::InvalidArgument(format!(
                            "output path '{}' does not name a file",
                            path.display()
                        ))
                    })?;
                if !name.ends_with(&format!(".{}", extension)) {
                    warn!(
                        "Output file '{}' doesn't have the expected extension '.{}' for format {}",
                        name,
                        extension,
                        self.format.trace_arg()
                    );
                }
                Ok(path.clone())
            }
        }
    }
}

/// `hh:mm:ss` as accepted by `dotnet-trace --duration`
pub fn trace_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Outcome of a successful CPU profile
#[derive(Debug, Clone)]
pub struct CpuProfileReport {
    pub output_path: PathBuf,
    pub process: ProcessInfo,
    pub bytes: u64,
}

/// Collects CPU profiles from game server pods
pub struct CpuProfileWorkflow {
    config: DebugConfig,
    manager: DebugContainerManager,
    output_dir: PathBuf,
}

impl CpuProfileWorkflow {
    pub fn new(config: DebugConfig) -> Self {
        Self {
            manager: DebugContainerManager::new(&config),
            config,
            output_dir: PathBuf::new(),
        }
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub async fn collect(
        &self,
        cluster: &ClusterClient,
        pod: &Pod,
        request: &CpuProfileRequest,
        cancel: &CancellationToken,
    ) -> Result<CpuProfileReport> {
        let output_path = local_path(&self.output_dir, &request.validate()?);

        let spec = DebugContainerSpec::keepalive(pod_name_of(pod), &self.config);
        let mut session = self.manager.create(cluster, &spec, cancel).await?;

        let shell = session.shell();
        let result = self.run_steps(&shell, request, &output_path, cancel).await;
        session.cleanup().await;

        let report = result?;
        info!("CPU profile written to {}", report.output_path.display());
        Ok(report)
    }

    async fn run_steps<S: RemoteShell>(
        &self,
        shell: &S,
        request: &CpuProfileRequest,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<CpuProfileReport> {
        let process = cancellable(cancel, probe_process(shell, &self.config.server_process_pattern)).await?;

        let file_name = output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DebugError::InvalidArgument("output path does not name a file".to_string()))?;
        let remote_path = format!("/tmp/{}", file_name);

        let mut command = format!(
            "dotnet-trace collect -p {} --format {} --duration {} -o {}",
            process.pid,
            request.format.trace_arg(),
            trace_duration(request.duration),
            shell_quote(&remote_path)
        );
        for arg in &request.extra_args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        let command = process.run_as(&command);

        info!(
            "Collecting {} CPU profile for {}...",
            request.format.trace_arg(),
            format_duration(request.duration)
        );
        let operation = BoundedOperation::new("dotnet-trace")
            .soft_timeout(request.duration + Duration::from_secs(5))
            .hard_timeout(request.duration + TRACE_GRACE);
        let trace = async {
            operation
                .run(shell.run(&command), || {
                    info!("Trace is taking longer than requested, waiting for it to finish...")
                })
                .await
                .map_err(DebugError::from)
                .map(|_| ())
        };
        cancellable(cancel, trace).await?;

        let copied = cancellable(cancel, shell.download(&remote_path, output_path)).await;
        if let Err(e) = shell.run(&format!("rm -f {}", shell_quote(&remote_path))).await {
            warn!("Failed to remove remote file {}: {}", remote_path, e);
        }
        let bytes = copied?;
        info!("Downloaded CPU profile ({})", format_size(bytes));

        Ok(CpuProfileReport {
            output_path: output_path.to_path_buf(),
            process,
            bytes,
        })
    }
}
