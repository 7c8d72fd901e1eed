//! Health probe override on the game server's admin endpoint
//!
//! While a heap dump freezes the server, its liveness probe would fail and
//! the pod would be restarted. The server exposes an override that forces
//! probe responses to succeed until it is set back to pass-through.

use crate::bounded::BoundedOperation;
use crate::error::{DebugError, Result};
use crate::remote::RemoteShell;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Health probe behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Always report healthy
    Success,
    /// Report the server's real health
    Passthrough,
}

impl ProbeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeMode::Success => "Success",
            ProbeMode::Passthrough => "Passthrough",
        }
    }
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Toggles the target's health probe override
#[async_trait]
pub trait ProbeOverride: Send + Sync {
    async fn set_mode(&self, mode: ProbeMode) -> Result<()>;
}

/// Probe override through `curl` against the admin port, from inside the debug container
pub struct HttpProbeOverride<S> {
    shell: S,
    port: u16,
    operation: BoundedOperation,
}

impl<S: RemoteShell> HttpProbeOverride<S> {
    pub fn new(shell: S, port: u16, soft_timeout: Duration, hard_timeout: Duration) -> Self {
        Self {
            shell,
            port,
            operation: BoundedOperation::new("health probe override")
                .soft_timeout(soft_timeout)
                .hard_timeout(hard_timeout),
        }
    }

    fn command(&self, mode: ProbeMode) -> String {
        format!(
            "curl -fsS 'localhost:{}/setOverride/healthz?mode={}'",
            self.port, mode
        )
    }
}

#[async_trait]
impl<S: RemoteShell> ProbeOverride for HttpProbeOverride<S> {
    async fn set_mode(&self, mode: ProbeMode) -> Result<()> {
        info!("Setting health probe override to {}", mode);
        self.operation
            .run(self.shell.run(&self.command(mode)), || {
                info!("Waiting for the server admin endpoint to respond...")
            })
            .await
            .map(|_| ())
            .map_err(|e| match DebugError::from(e) {
                DebugError::TimedOut { operation, after } => DebugError::TimedOut { operation, after },
                other => DebugError::Remote(format!(
                    "failed to set health probe override to {}: {}",
                    mode, other
                )),
            })
    }
}
