//! Debug session commands

use anyhow::Result;
use chrono::Utc;
use clap::ValueEnum;
use colored::Colorize;
use debug_lib::cluster::ClusterClient;
use debug_lib::humanize::{format_duration, format_size};
use debug_lib::resolver::pod_description;
use debug_lib::session::cancellable;
use debug_lib::{
    CpuProfileRequest, CpuProfileWorkflow, DumpMode, EnvironmentResolver, GameServer,
    HeapDumpRequest, HeapDumpWorkflow, IoStreams, KubeEnvironmentResolver, PodResolver,
    ProfileFormat, ShellSession, TargetRef,
};
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tabled::Tabled;

use super::Context;
use crate::output::{
    color_phase, format_age, print_header, print_json, print_success, print_table, print_warning,
    OutputFormat,
};

/// Heap dump type as given on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum HeapDumpMode {
    /// Managed heap snapshot (dotnet-gcdump)
    Gcdump,
    /// Full process dump (dotnet-dump)
    Dump,
}

impl From<HeapDumpMode> for DumpMode {
    fn from(mode: HeapDumpMode) -> Self {
        match mode {
            HeapDumpMode::Gcdump => DumpMode::GcDump,
            HeapDumpMode::Dump => DumpMode::Dump,
        }
    }
}

/// CPU trace format as given on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TraceFormat {
    Nettrace,
    Speedscope,
    Chromium,
}

impl From<TraceFormat> for ProfileFormat {
    fn from(format: TraceFormat) -> Self {
        match format {
            TraceFormat::Nettrace => ProfileFormat::NetTrace,
            TraceFormat::Speedscope => ProfileFormat::Speedscope,
            TraceFormat::Chromium => ProfileFormat::Chromium,
        }
    }
}

/// Row for pods table
#[derive(Tabled, Serialize)]
struct PodRow {
    #[tabled(rename = "Shard Set")]
    shard_set: String,
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Pod")]
    pod: String,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Age")]
    age: String,
}

async fn resolve_game_server(ctx: &Context, environment: &str) -> Result<GameServer> {
    let target = TargetRef::new(environment)?;
    let resolver = KubeEnvironmentResolver::new(ctx.config.clone(), ctx.kubeconfig.clone());
    Ok(cancellable(&ctx.cancel, resolver.game_server(&target)).await?)
}

async fn resolve_pod(ctx: &Context, environment: &str, pod: Option<&str>) -> Result<(ClusterClient, Pod)> {
    let game_server = resolve_game_server(ctx, environment).await?;
    let resolver = PodResolver::new(ctx.interaction.clone());
    Ok(cancellable(&ctx.cancel, resolver.resolve(&game_server, pod)).await?)
}

/// Open an interactive shell next to the game server
pub async fn open_shell(ctx: &Context, environment: &str, pod: Option<&str>) -> Result<()> {
    let (cluster, pod) = resolve_pod(ctx, environment, pod).await?;

    ShellSession::new(ctx.config.clone())
        .open(&cluster, &pod, IoStreams::stdio(), &ctx.cancel)
        .await?;
    Ok(())
}

/// Collect a heap dump and copy it to the local machine
pub async fn collect_heap_dump(
    ctx: &Context,
    environment: &str,
    pod: Option<&str>,
    output: Option<PathBuf>,
    mode: HeapDumpMode,
    yes: bool,
) -> Result<()> {
    let request = HeapDumpRequest {
        mode: mode.into(),
        output_path: output,
        skip_confirmation: yes,
    };
    // Reject a bad output name before touching the cluster
    request.resolve_output_path()?;

    let (cluster, pod) = resolve_pod(ctx, environment, pod).await?;
    let report = HeapDumpWorkflow::new(ctx.config.clone(), ctx.interaction.clone())
        .collect(&cluster, &pod, &request, &ctx.cancel)
        .await?;

    match ctx.format {
        OutputFormat::Json => print_json(&json!({
            "output_path": report.output_path,
            "bytes": report.bytes,
            "pid": report.process.pid,
            "memory_gb": report.process.memory_gb,
            "estimated_secs": report.estimated.as_secs(),
            "elapsed_secs": report.elapsed.as_secs_f64(),
        })),
        OutputFormat::Table => {
            print_success(&format!("Heap dump written to {}", report.output_path.display()));
            println!("Size:       {}", format_size(report.bytes));
            println!("Heap:       {:.2} GB", report.process.memory_gb);
            println!(
                "Duration:   {} (estimated {})",
                format_duration(report.elapsed),
                format_duration(report.estimated)
            );
        }
    }
    Ok(())
}

/// Collect a CPU profile and copy it to the local machine
pub async fn collect_cpu_profile(
    ctx: &Context,
    environment: &str,
    pod: Option<&str>,
    output: Option<PathBuf>,
    format: TraceFormat,
    duration_secs: u64,
    extra_args: Vec<String>,
) -> Result<()> {
    let request = CpuProfileRequest {
        format: format.into(),
        duration: Duration::from_secs(duration_secs),
        output_path: output,
        extra_args,
    };
    request.validate()?;

    let (cluster, pod) = resolve_pod(ctx, environment, pod).await?;
    let report = CpuProfileWorkflow::new(ctx.config.clone())
        .collect(&cluster, &pod, &request, &ctx.cancel)
        .await?;

    match ctx.format {
        OutputFormat::Json => print_json(&json!({
            "output_path": report.output_path,
            "bytes": report.bytes,
            "pid": report.process.pid,
            "format": request.format.trace_arg(),
            "duration_secs": request.duration.as_secs(),
        })),
        OutputFormat::Table => {
            print_success(&format!("CPU profile written to {}", report.output_path.display()));
            println!("Size:       {}", format_size(report.bytes));
            println!("Format:     {}", request.format.trace_arg());
            println!("Duration:   {}", format_duration(request.duration));
        }
    }
    Ok(())
}

/// List every shard set of an environment with its pods
pub async fn list_pods(ctx: &Context, environment: &str) -> Result<()> {
    let game_server = resolve_game_server(ctx, environment).await?;
    let shard_sets = cancellable(&ctx.cancel, game_server.all_shard_sets_with_pods()).await?;

    let colorize = matches!(ctx.format, OutputFormat::Table);
    let mut rows = Vec::new();
    for entry in &shard_sets {
        for pod in &entry.pods {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            let age = pod
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| format_age(Utc::now() - t.0))
                .unwrap_or_else(|| "-".to_string());

            rows.push(PodRow {
                shard_set: entry.shard_set.name.clone(),
                cluster: entry.shard_set.cluster.name().to_string(),
                pod: pod.metadata.name.clone().unwrap_or_default(),
                phase: if colorize { color_phase(&phase) } else { phase },
                status: pod_description(pod),
                age,
            });
        }
    }

    if colorize {
        print_header(&format!("Game Server {}", environment.cyan()));
        if shard_sets.is_empty() {
            print_warning("No shard sets found in this environment");
            return Ok(());
        }
    }
    print_table(&rows, ctx.format);
    if colorize && !rows.is_empty() {
        println!("\nTotal: {} pods in {} shard sets", rows.len(), shard_sets.len());
    }
    Ok(())
}
