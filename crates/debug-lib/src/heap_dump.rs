//! Heap dump collection
//!
//! Dumps the managed heap of the game server process with `dotnet-gcdump` or
//! `dotnet-dump` from a keep-alive debug container, then copies the artifact
//! to the local machine. The server is frozen for the duration of the dump,
//! so its health probe is forced healthy around the dump and always reset
//! afterwards.

use crate::bounded::BoundedOperation;
use crate::cluster::ClusterClient;
use crate::config::DebugConfig;
use crate::container::{DebugContainerManager, DebugContainerSpec};
use crate::error::{DebugError, Result};
use crate::humanize::{format_duration, format_size, megabytes_per_second};
use crate::interaction::InteractionCapability;
use crate::probe::{HttpProbeOverride, ProbeMode, ProbeOverride};
use crate::process_info::{probe_process, ProcessInfo};
use crate::remote::{local_path, shell_quote, RemoteShell};
use crate::resolver::pod_name_of;
use crate::session::cancellable;
use chrono::Local;
use k8s_openapi::api::core::v1::Pod;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which dump tool to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpMode {
    /// Managed heap graph via `dotnet-gcdump`
    #[default]
    GcDump,
    /// Full process dump via `dotnet-dump`
    Dump,
}

impl DumpMode {
    pub fn tool(&self) -> &'static str {
        match self {
            DumpMode::GcDump => "dotnet-gcdump",
            DumpMode::Dump => "dotnet-dump",
        }
    }

    /// Extension the output file must carry, if any
    pub fn required_extension(&self) -> Option<&'static str> {
        match self {
            DumpMode::GcDump => Some("gcdump"),
            DumpMode::Dump => None,
        }
    }

    fn default_extension(&self) -> &'static str {
        match self {
            DumpMode::GcDump => "gcdump",
            DumpMode::Dump => "dump",
        }
    }
}

impl FromStr for DumpMode {
    type Err = DebugError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gcdump" => Ok(DumpMode::GcDump),
            "dump" => Ok(DumpMode::Dump),
            other => Err(DebugError::InvalidArgument(format!(
                "invalid collection mode '{}': must be either 'gcdump' or 'dump'",
                other
            ))),
        }
    }
}

/// Parameters of one heap dump
#[derive(Debug, Clone, Default)]
pub struct HeapDumpRequest {
    pub mode: DumpMode,
    /// Local output file; generated from the current time when unset
    pub output_path: Option<PathBuf>,
    /// Proceed without asking the operator
    pub skip_confirmation: bool,
}

impl HeapDumpRequest {
    /// Validate the output path and fill in the default name
    pub fn resolve_output_path(&self) -> Result<PathBuf> {
        match &self.output_path {
            None => Ok(PathBuf::from(format!(
                "dump-{}.{}",
                Local::now().format("%Y%m%d-%H%M%S"),
                self.mode.default_extension()
            ))),
            Some(path) => {
                if let Some(required) = self.mode.required_extension() {
                    let actual = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                    if actual != required {
                        return Err(DebugError::InvalidArgument(format!(
                            "invalid extension for output file '{}': expected '.{}' for {}",
                            path.display(),
                            required,
                            self.mode.tool()
                        )));
                    }
                }
                if path.file_name().is_none() {
                    return Err(DebugError::InvalidArgument(format!(
                        "output path '{}' does not name a file",
                        path.display()
                    )));
                }
                Ok(path.clone())
            }
        }
    }
}

/// Outcome of a successful heap dump
#[derive(Debug, Clone)]
pub struct HeapDumpReport {
    pub output_path: PathBuf,
    pub process: ProcessInfo,
    pub estimated: Duration,
    pub elapsed: Duration,
    pub bytes: u64,
}

/// Runs heap dumps against game server pods
pub struct HeapDumpWorkflow {
    config: DebugConfig,
    manager: DebugContainerManager,
    interaction: Arc<dyn InteractionCapability>,
    output_dir: PathBuf,
}

impl HeapDumpWorkflow {
    pub fn new(config: DebugConfig, interaction: Arc<dyn InteractionCapability>) -> Self {
        Self {
            manager: DebugContainerManager::new(&config),
            config,
            interaction,
            output_dir: PathBuf::new(),
        }
    }

    /// Resolve relative output paths against `dir` instead of the working directory
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Collect a heap dump from `pod` and copy it to the local output path
    pub async fn collect(
        &self,
        cluster: &ClusterClient,
        pod: &Pod,
        request: &HeapDumpRequest,
        cancel: &CancellationToken,
    ) -> Result<HeapDumpReport> {
        let output_path = local_path(&self.output_dir, &request.resolve_output_path()?);

        let spec = DebugContainerSpec::keepalive(pod_name_of(pod), &self.config);
        let mut session = self.manager.create(cluster, &spec, cancel).await?;

        let shell = session.shell();
        let (soft, hard) = self.config.probe_timeouts();
        let probe = HttpProbeOverride::new(shell.clone(), self.config.probe_admin_port, soft, hard);

        let result = self
            .run_steps(&shell, &probe, request, &output_path, cancel)
            .await;
        session.cleanup().await;

        let report = result?;
        info!("Successfully wrote {}", report.output_path.display());
        Ok(report)
    }

    /// Probe, confirm, dump, reset the probe and copy the artifact out
    async fn run_steps<S, P>(
        &self,
        shell: &S,
        probe: &P,
        request: &HeapDumpRequest,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<HeapDumpReport>
    where
        S: RemoteShell,
        P: ProbeOverride,
    {
        let process = cancellable(cancel, probe_process(shell, &self.config.server_process_pattern)).await?;
        let estimated = process.estimated_dump_duration(self.config.heap_dump_secs_per_gb);
        info!("Game server process heap size is {:.2} GB", process.memory_gb);
        info!("Estimated time to complete the operation is {}", format_duration(estimated));

        self.confirm(request)?;

        let file_name = output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DebugError::InvalidArgument("output path does not name a file".to_string()))?;
        let remote_path = format!("/tmp/{}", file_name);
        let command = process.run_as(&format!(
            "{} collect -p {} -o {}",
            request.mode.tool(),
            process.pid,
            shell_quote(&remote_path)
        ));

        let started = Instant::now();
        let dumped = match probe.set_mode(ProbeMode::Success).await {
            Ok(()) => {
                info!("Collecting heap dump with {}...", request.mode.tool());
                self.dump(shell, &command, estimated, cancel).await
            }
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        if let Err(e) = probe.set_mode(ProbeMode::Passthrough).await {
            warn!("Failed to reset health probe override: {}", e);
        }
        dumped?;

        info!("Heap dump took {}", format_duration(elapsed));

        let copied = cancellable(cancel, shell.download(&remote_path, output_path)).await;
        if let Err(e) = shell.run(&format!("rm -f {}", shell_quote(&remote_path))).await {
            warn!("Failed to remove remote file {}: {}", remote_path, e);
        }
        let bytes = copied?;

        info!(
            "Dumped {} in {} ({:.1} MB/s)",
            format_size(bytes),
            format_duration(elapsed),
            megabytes_per_second(bytes, elapsed)
        );

        Ok(HeapDumpReport {
            output_path: output_path.to_path_buf(),
            process,
            estimated,
            elapsed,
            bytes,
        })
    }

    async fn dump<S: RemoteShell>(
        &self,
        shell: &S,
        command: &str,
        estimated: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let operation = BoundedOperation::new("heap dump")
            .soft_timeout(estimated.max(Duration::from_secs(1)))
            .hard_timeout(self.config.heap_dump_timeout(estimated));

        let run = async {
            operation
                .run(shell.run(command), || {
                    info!("Heap dump is taking longer than estimated, still waiting...")
                })
                .await
                .map(|_| ())
                .map_err(DebugError::from)
        };
        cancellable(cancel, run).await
    }

    fn confirm(&self, request: &HeapDumpRequest) -> Result<()> {
        if request.skip_confirmation {
            return Ok(());
        }

        warn!("This operation may take a long time and will completely freeze the server process for the duration!");
        if !self.interaction.is_interactive() {
            return Err(DebugError::InvalidArgument(
                "confirmation required: pass --yes to collect a heap dump non-interactively".to_string(),
            ));
        }
        if !self.interaction.confirm("Are you sure you want to continue?")? {
            return Err(DebugError::Cancelled(
                "heap dump collection cancelled by operator".to_string(),
            ));
        }
        Ok(())
    }
}
