//! Game server process inspection from inside a debug container

use crate::error::{DebugError, Result};
use crate::remote::{shell_quote, RemoteShell};
use std::time::Duration;
use tracing::debug;

/// The running server process as seen from the debug container
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub username: String,
    /// Resident memory in GB
    pub memory_gb: f64,
}

impl ProcessInfo {
    /// Estimated heap dump duration, rounded to whole seconds
    pub fn estimated_dump_duration(&self, secs_per_gb: f64) -> Duration {
        Duration::from_secs((self.memory_gb * secs_per_gb).round().max(0.0) as u64)
    }

    /// Wrap `command` so it runs as the process owner
    pub fn run_as(&self, command: &str) -> String {
        if self.username == "root" {
            command.to_string()
        } else {
            format!("su {} -c {}", self.username, shell_quote(command))
        }
    }
}

/// Find the server process and read its owner and resident memory
pub async fn probe_process(shell: &dyn RemoteShell, pattern: &str) -> Result<ProcessInfo> {
    let pid_output = shell
        .run(&format!("pgrep -o -f {}", shell_quote(pattern)))
        .await
        .map_err(|e| match e {
            DebugError::RemoteExit { .. } => {
                DebugError::Remote(format!("no process matching '{}' found", pattern))
            }
            other => other,
        })?;
    let pid = parse_pid(&pid_output.stdout)?;
    debug!(pid, "Found game server process");

    let user_output = shell.run(&format!("ps -o user= -p {}", pid)).await?;
    let username = user_output.stdout.trim().to_string();
    validate_username(&username)?;
    debug!(user = %username, "Game server process owner");

    let status = shell.run(&format!("cat /proc/{}/status", pid)).await?;
    let rss_kb = parse_vm_rss_kb(&status.stdout).ok_or_else(|| {
        DebugError::Remote(format!("failed to read resident memory of process {}", pid))
    })?;

    Ok(ProcessInfo {
        pid,
        username,
        memory_gb: rss_kb as f64 / (1024.0 * 1024.0),
    })
}

fn parse_pid(stdout: &str) -> Result<u32> {
    let text = stdout.trim();
    if text.is_empty() {
        return Err(DebugError::Remote(
            "unable to resolve game server PID: empty response".to_string(),
        ));
    }
    match text.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(DebugError::Remote(format!(
            "invalid PID '{}', expected a positive integer",
            text
        ))),
    }
}

/// Check a username against Unix conventions before it is put on a command line
pub fn validate_username(username: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(DebugError::Remote(format!(
            "invalid process owner '{}': {}",
            username, reason
        )))
    };

    let mut chars = username.chars();
    let Some(first) = chars.next() else {
        return invalid("empty");
    };
    if username.len() > 32 {
        return invalid("longer than 32 characters");
    }
    if !(first.is_ascii_alphabetic() || first == '_') {
        return invalid("must start with a letter or underscore");
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return invalid("only letters, digits, underscores and hyphens are allowed");
    }
    Ok(())
}

/// Extract `VmRSS` in kB from `/proc/<pid>/status`
fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some("VmRSS:"), Some(value), Some("kB"), None) => value.parse().ok().filter(|v| *v > 0),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeShell;

    const STATUS: &str = "Name:\tServer\nVmPeak:\t 9000000 kB\nVmRSS:\t 4404019 kB\nThreads:\t42\n";

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("1234\n").unwrap(), 1234);
        assert!(parse_pid("").is_err());
        assert!(parse_pid("0").is_err());
        assert!(parse_pid("12 34").is_err());
    }

    #[test]
    fn test_validate_username() {
        assert!(validate_username("root").is_ok());
        assert!(validate_username("_app-user1").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("1user").is_err());
        assert!(validate_username("app;rm").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_parse_vm_rss() {
        assert_eq!(parse_vm_rss_kb(STATUS), Some(4404019));
        assert_eq!(parse_vm_rss_kb("VmSize:\t100 kB\n"), None);
        assert_eq!(parse_vm_rss_kb("VmRSS:\t0 kB\n"), None);
    }

    #[test]
    fn test_estimate_rounds_to_seconds() {
        let info = ProcessInfo {
            pid: 1,
            username: "root".to_string(),
            memory_gb: 4.2,
        };
        assert_eq!(info.estimated_dump_duration(10.0), Duration::from_secs(42));
    }

    #[test]
    fn test_run_as() {
        let mut info = ProcessInfo {
            pid: 1,
            username: "root".to_string(),
            memory_gb: 1.0,
        };
        assert_eq!(info.run_as("dotnet-gcdump collect -p 1"), "dotnet-gcdump collect -p 1");

        info.username = "app".to_string();
        assert_eq!(
            info.run_as("dotnet-gcdump collect -p 1"),
            "su app -c 'dotnet-gcdump collect -p 1'"
        );
    }

    #[tokio::test]
    async fn test_probe_process() {
        let shell = FakeShell::new()
            .respond("pgrep", "1234\n")
            .respond("ps -o user=", "app\n")
            .respond("/proc/1234/status", STATUS);

        let info = probe_process(&shell, "Server").await.unwrap();
        assert_eq!(info.pid, 1234);
        assert_eq!(info.username, "app");
        assert_eq!(info.estimated_dump_duration(10.0), Duration::from_secs(42));
    }

    #[tokio::test]
    async fn test_probe_process_not_running() {
        let shell = FakeShell::new().fail("pgrep", 1);
        let err = probe_process(&shell, "Server").await.unwrap_err();
        assert!(err.to_string().contains("no process matching 'Server'"));
    }
}
