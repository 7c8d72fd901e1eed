//! Local container daemon checks
//!
//! The daemon CLI is known to hang indefinitely when the daemon is wedged,
//! so every call goes through [`BoundedOperation`].

use crate::bounded::{BoundedError, BoundedOperation};
use crate::config::DebugConfig;
use crate::error::{DebugError, Result};
use serde::{Deserialize, Serialize};
use std::process::{Command, Stdio};
use tracing::{debug, info};

const DAEMON_SUGGESTION: &str = "Make sure Docker Desktop is running, or start the docker daemon";

/// Version details of one side of the daemon connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ComponentVersion {
    pub version: String,
    pub api_version: String,
    pub git_commit: String,
    pub go_version: String,
    pub os: String,
    pub arch: String,
}

/// Output of `<daemon> version --format json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DaemonVersion {
    #[serde(default)]
    pub client: ComponentVersion,
    /// Missing when the daemon is unreachable
    #[serde(default)]
    pub server: Option<ComponentVersion>,
}

/// Check that the daemon answers `info` in time
pub async fn check_available(config: &DebugConfig) -> Result<()> {
    run_daemon(config, &["info"]).await?;
    debug!(daemon = %config.daemon_binary, "Daemon is available");
    Ok(())
}

/// Query client and server versions
pub async fn version(config: &DebugConfig) -> Result<DaemonVersion> {
    let stdout = run_daemon(config, &["version", "--format", "json"]).await?;
    parse_version(&stdout)
}

pub fn parse_version(json: &[u8]) -> Result<DaemonVersion> {
    serde_json::from_slice(json)
        .map_err(|e| DebugError::Remote(format!("unexpected daemon version output: {}", e)))
}

async fn run_daemon(config: &DebugConfig, args: &[&str]) -> Result<Vec<u8>> {
    let binary = config.daemon_binary.clone();
    let owned: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let (soft, hard) = config.daemon_timeouts();

    let operation = BoundedOperation::new(format!("{} {}", binary, args.join(" ")))
        .soft_timeout(soft)
        .hard_timeout(hard);

    let waiting_on = binary.clone();
    let result = operation
        .run_blocking(move || run_command(&binary, &owned), || {
            info!("Waiting for {} daemon to respond...", waiting_on)
        })
        .await;

    match result {
        Ok(stdout) => Ok(stdout),
        Err(BoundedError::Failed(message)) => Err(DebugError::DaemonUnavailable {
            message: format!("{} is not responding: {}", config.daemon_binary, message),
            suggestion: DAEMON_SUGGESTION.to_string(),
        }),
        Err(BoundedError::TimedOut { operation, after }) => Err(DebugError::TimedOut { operation, after }),
        Err(BoundedError::Lost { operation }) => Err(DebugError::Remote(format!(
            "{} exited without reporting a result",
            operation
        ))),
    }
}

fn run_command(binary: &str, args: &[String]) -> std::result::Result<Vec<u8>, String> {
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| format!("failed to run {}: {}", binary, e))?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(stderr.trim().to_string())
    }
}
