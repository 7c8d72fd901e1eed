//! Game server debug CLI
//!
//! Opens shells, collects heap dumps and CPU profiles from live game server
//! pods through short-lived debug containers.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use commands::{debug, doctor, Context};
use debug_lib::{DebugConfig, DebugError, ErrorKind, InteractionCapability, NonInteractive, TerminalPrompt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Game server debug tool
#[derive(Parser)]
#[command(name = "gsd")]
#[command(author, version, about = "Debug live game server pods", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ~/.config/gsd/config.toml)
    #[arg(long, env = "GSD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Log format
    #[arg(long, default_value = "text")]
    pub log_format: LogFormat,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    /// Never prompt; fail instead when a choice or confirmation is needed
    #[arg(long)]
    pub non_interactive: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Debug game server pods
    #[command(subcommand)]
    Debug(DebugCommands),

    /// Check that local tooling responds
    Doctor,
}

#[derive(Subcommand)]
pub enum DebugCommands {
    /// Open a shell in a debug container next to the game server
    #[command(alias = "sh")]
    Shell {
        /// Environment id
        environment: String,

        /// Target pod (asked for when several are running)
        pod: Option<String>,
    },

    /// Collect a heap dump from the game server process
    CollectHeapDump {
        /// Environment id
        environment: String,

        /// Target pod (asked for when several are running)
        pod: Option<String>,

        /// Output file (defaults to dump-<timestamp>.<ext>)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Dump type
        #[arg(long, value_enum, default_value = "gcdump")]
        mode: debug::HeapDumpMode,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },

    /// Collect a CPU profile from the game server process
    CollectCpuProfile {
        /// Environment id
        environment: String,

        /// Target pod (asked for when several are running)
        pod: Option<String>,

        /// Output file (defaults to profile-<timestamp>.<ext>)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Trace format
        #[arg(long, value_enum, default_value = "nettrace")]
        format: debug::TraceFormat,

        /// Trace duration in seconds
        #[arg(long, default_value_t = 30)]
        duration: u64,

        /// Extra arguments passed to dotnet-trace
        #[arg(last = true)]
        extra_args: Vec<String>,
    },

    /// List shard sets and their pods
    Pods {
        /// Environment id
        environment: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            output::print_error(&format!("{:#}", err));
            if let Some(suggestion) = err.downcast_ref::<DebugError>().and_then(|e| e.suggestion()) {
                output::print_info(suggestion);
            }
            exit_code(&err)
        }
    };

    // Abandoned bounded calls may still hold threads; don't wait for them
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => DebugConfig::load_from(Some(path))?,
        None => DebugConfig::load()?,
    };

    let interaction: Arc<dyn InteractionCapability> = if cli.non_interactive {
        Arc::new(NonInteractive)
    } else {
        Arc::from(TerminalPrompt::detect())
    };

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let ctx = Context {
        config,
        kubeconfig: cli.kubeconfig,
        interaction,
        cancel,
        format: cli.format,
    };

    match cli.command {
        Commands::Debug(debug_cmd) => match debug_cmd {
            DebugCommands::Shell { environment, pod } => {
                debug::open_shell(&ctx, &environment, pod.as_deref()).await?;
            }
            DebugCommands::CollectHeapDump {
                environment,
                pod,
                output,
                mode,
                yes,
            } => {
                debug::collect_heap_dump(&ctx, &environment, pod.as_deref(), output, mode, yes).await?;
            }
            DebugCommands::CollectCpuProfile {
                environment,
                pod,
                output,
                format,
                duration,
                extra_args,
            } => {
                debug::collect_cpu_profile(
                    &ctx,
                    &environment,
                    pod.as_deref(),
                    output,
                    format,
                    duration,
                    extra_args,
                )
                .await?;
            }
            DebugCommands::Pods { environment } => {
                debug::list_pods(&ctx, &environment).await?;
            }
        },
        Commands::Doctor => {
            doctor::run(&ctx).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, format: LogFormat) {
    let default_filter = if verbose {
        "info,debug_lib=debug,gsd=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(verbose)
                    .without_time(),
            )
            .init(),
    }
}

/// Fire `cancel` on the first interrupt or termination signal
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_interrupt().await;
        warn!("Interrupted, cleaning up...");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_interrupt() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut terminate), Ok(mut hangup)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Process exit code for a failed command
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<DebugError>() {
        Some(DebugError::RemoteExit { code, .. }) if *code != 0 => *code,
        Some(e) => match e.kind() {
            ErrorKind::Usage => 2,
            ErrorKind::Cancelled => 130,
            _ => 1,
        },
        None => 1,
    }
}
