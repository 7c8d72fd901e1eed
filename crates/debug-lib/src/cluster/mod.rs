//! Cluster access
//!
//! [`ClusterAccess`] is the narrow surface the debug workflows need from a
//! Kubernetes cluster: pod lookups, ephemeral container provisioning and
//! multiplexed exec/attach streams. [`KubeCluster`] implements it over
//! kube-rs; tests substitute an in-memory fake.

mod k8s;
mod status;

pub use k8s::KubeCluster;
pub use status::ExitStatus;

use crate::error::{DebugError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{EphemeralContainer, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

pub use kube::api::TerminalSize;

/// Boxed remote or local byte source
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed remote or local byte sink
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Channel flags for an exec/attach stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Forward local input to the remote process
    pub stdin: bool,
    /// Allocate a terminal; stderr is merged into stdout
    pub tty: bool,
}

/// One multiplexed stream to a container process
///
/// Each channel is present only if it was requested. `status` resolves with
/// the remote process status once it exits; `finished` resolves when the
/// underlying connection has shut down.
pub struct RemoteStreams {
    pub stdin: Option<BoxedWriter>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub resize: Option<futures::channel::mpsc::Sender<TerminalSize>>,
    pub status: BoxFuture<'static, Option<Status>>,
    pub finished: BoxFuture<'static, Result<()>>,
}

/// Reported when a stream ends before the remote process status arrived
pub const NO_EXIT_STATUS: &str = "stream closed without exit status";

/// Captured result of a non-interactive remote command
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitStatus,
}

impl ExecOutput {
    /// Turn a non-zero exit or a failed stream into an error
    pub fn into_result(self) -> Result<Self> {
        match self.exit {
            ExitStatus::Success => Ok(self),
            ExitStatus::Code(code) => Err(DebugError::RemoteExit {
                code,
                stderr: self.stderr,
            }),
            ExitStatus::Failure(message) => Err(DebugError::Transport(message)),
            ExitStatus::Unknown => Err(DebugError::Transport(NO_EXIT_STATUS.to_string())),
        }
    }
}

/// State of an ephemeral container as reported in pod status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EphemeralPhase {
    /// No status reported yet
    Missing,
    Waiting { reason: String, message: String },
    Running,
    Terminated { exit_code: i32, message: String },
}

/// Find the reported state of the named ephemeral container
pub fn ephemeral_phase(pod: &Pod, container: &str) -> EphemeralPhase {
    let status = pod
        .status
        .as_ref()
        .and_then(|s| s.ephemeral_container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|s| s.name == container));

    let Some(state) = status.and_then(|s| s.state.as_ref()) else {
        return EphemeralPhase::Missing;
    };

    if state.running.is_some() {
        EphemeralPhase::Running
    } else if let Some(terminated) = &state.terminated {
        EphemeralPhase::Terminated {
            exit_code: terminated.exit_code,
            message: terminated.message.clone().unwrap_or_default(),
        }
    } else if let Some(waiting) = &state.waiting {
        EphemeralPhase::Waiting {
            reason: waiting.reason.clone().unwrap_or_default(),
            message: waiting.message.clone().unwrap_or_default(),
        }
    } else {
        EphemeralPhase::Missing
    }
}

/// Access to one physical cluster backing an environment
#[async_trait]
pub trait ClusterAccess: Send + Sync {
    /// Human readable cluster label (kube context)
    fn name(&self) -> &str;

    /// Namespace the game server lives in
    fn namespace(&self) -> &str;

    /// Fetch a pod snapshot
    async fn get_pod(&self, name: &str) -> Result<Pod>;

    /// List the names of shard sets (StatefulSets) in this cluster, in listing order
    async fn list_shard_sets(&self) -> Result<Vec<String>>;

    /// List the pods owned by a shard set, in listing order
    async fn list_shard_set_pods(&self, shard_set: &str) -> Result<Vec<Pod>>;

    /// Append an ephemeral container to a running pod
    async fn add_ephemeral_container(&self, pod: &str, container: EphemeralContainer) -> Result<()>;

    /// Wait until the ephemeral container reports Running.
    ///
    /// Implementations may wait indefinitely; callers bound this call.
    async fn wait_ephemeral_running(&self, pod: &str, container: &str) -> Result<()>;

    /// Start a command in a container and stream its I/O
    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        options: StreamOptions,
    ) -> Result<RemoteStreams>;

    /// Attach to a container's main process
    async fn attach(&self, pod: &str, container: &str, options: StreamOptions) -> Result<RemoteStreams>;
}

/// Shared handle to a cluster, borrowed by sessions for their lifetime
#[derive(Clone)]
pub struct ClusterClient {
    access: Arc<dyn ClusterAccess>,
}

impl ClusterClient {
    pub fn new(access: impl ClusterAccess + 'static) -> Self {
        Self {
            access: Arc::new(access),
        }
    }

    pub fn from_arc(access: Arc<dyn ClusterAccess>) -> Self {
        Self { access }
    }
}

impl Deref for ClusterClient {
    type Target = dyn ClusterAccess;

    fn deref(&self) -> &Self::Target {
        self.access.as_ref()
    }
}

impl fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterClient")
            .field("name", &self.access.name())
            .field("namespace", &self.access.namespace())
            .finish()
    }
}

/// Run a command to completion and capture its output
pub async fn exec_capture(
    cluster: &dyn ClusterAccess,
    pod: &str,
    container: &str,
    command: Vec<String>,
) -> Result<ExecOutput> {
    let mut streams = cluster
        .exec(pod, container, command, StreamOptions::default())
        .await?;

    let (stdout, stderr) = tokio::try_join!(
        read_to_string(streams.stdout.take()),
        read_to_string(streams.stderr.take())
    )?;
    let status = streams.status.await;
    streams.finished.await?;

    Ok(ExecOutput {
        stdout,
        stderr,
        exit: ExitStatus::from_status(status.as_ref()),
    })
}

async fn read_to_string(reader: Option<BoxedReader>) -> Result<String> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| DebugError::Transport(format!("failed to read remote output: {}", e)))?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        ContainerStatus, PodStatus,
    };

    fn pod_with_ephemeral(name: &str, state: ContainerState) -> Pod {
        Pod {
            status: Some(PodStatus {
                ephemeral_container_statuses: Some(vec![ContainerStatus {
                    name: name.to_string(),
                    state: Some(state),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_ephemeral_phase_missing() {
        assert_eq!(ephemeral_phase(&Pod::default(), "debugger-1"), EphemeralPhase::Missing);

        let pod = pod_with_ephemeral(
            "debugger-other",
            ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            },
        );
        assert_eq!(ephemeral_phase(&pod, "debugger-1"), EphemeralPhase::Missing);
    }

    #[test]
    fn test_ephemeral_phase_transitions() {
        let waiting = pod_with_ephemeral(
            "debugger-1",
            ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("ContainerCreating".to_string()),
                    message: None,
                }),
                ..Default::default()
            },
        );
        assert_eq!(
            ephemeral_phase(&waiting, "debugger-1"),
            EphemeralPhase::Waiting {
                reason: "ContainerCreating".to_string(),
                message: String::new()
            }
        );

        let running = pod_with_ephemeral(
            "debugger-1",
            ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            },
        );
        assert_eq!(ephemeral_phase(&running, "debugger-1"), EphemeralPhase::Running);

        let terminated = pod_with_ephemeral(
            "debugger-1",
            ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: 127,
                    message: Some("not found".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        assert_eq!(
            ephemeral_phase(&terminated, "debugger-1"),
            EphemeralPhase::Terminated {
                exit_code: 127,
                message: "not found".to_string()
            }
        );
    }

    #[test]
    fn test_exec_output_into_result() {
        let ok = ExecOutput {
            stdout: "1234\n".to_string(),
            stderr: String::new(),
            exit: ExitStatus::Success,
        };
        assert!(ok.into_result().is_ok());

        let failed = ExecOutput {
            stdout: String::new(),
            stderr: "no such process".to_string(),
            exit: ExitStatus::Code(1),
        };
        match failed.into_result() {
            Err(DebugError::RemoteExit { code, stderr }) => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "no such process");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let broken = ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit: ExitStatus::Failure("container not found".to_string()),
        };
        assert!(matches!(broken.into_result(), Err(DebugError::Transport(_))));
    }

    #[test]
    fn test_exec_without_status_is_not_success() {
        let dropped = ExecOutput {
            stdout: "partial".to_string(),
            stderr: String::new(),
            exit: ExitStatus::Unknown,
        };
        match dropped.into_result() {
            Err(DebugError::Transport(message)) => assert_eq!(message, NO_EXIT_STATUS),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
