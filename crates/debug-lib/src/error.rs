//! Error types for debug sessions
//!
//! Every failure carries an [`ErrorKind`] so callers can tell "the remote
//! tool said no" apart from "the remote tool never answered" or "we lost
//! the connection".

use std::time::Duration;

/// Result type alias for debug operations.
pub type Result<T> = std::result::Result<T, DebugError>;

/// Coarse classification of a [`DebugError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No pod, or named pod missing.
    Resolution,
    /// Bad arguments detected before any remote work, or a pod choice that
    /// has to be made on the command line.
    Usage,
    /// Debug container rejected, failed, or never reached Running.
    Provisioning,
    /// Stream setup or mid-session I/O failure.
    Transport,
    /// The remote process exited with a non-zero code.
    RemoteProcess,
    /// A bounded operation never answered within its hard deadline.
    Timeout,
    /// The operator interrupted or declined the operation.
    Cancelled,
    /// Anything else reported by the cluster, the local system or a remote tool.
    Operational,
}

/// Errors that can occur while resolving, provisioning or driving a debug session.
#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    // =========================================================================
    // Resolution Errors
    // =========================================================================
    /// No shard set or pod exists anywhere in the environment.
    #[error("no game server pods found in environment '{environment}'")]
    NothingToTarget { environment: String },

    /// Several candidates exist but no interactive selection is possible.
    #[error("multiple game server pods running ({}): specify the target pod explicitly", candidates.join(", "))]
    AmbiguousTarget { candidates: Vec<String> },

    /// Explicitly named pod is not part of any shard set.
    #[error("game server pod '{pod}' not found")]
    PodNotFound { pod: String },

    // =========================================================================
    // Usage Errors
    // =========================================================================
    /// Invalid argument detected before any remote call.
    #[error("{0}")]
    InvalidArgument(String),

    // =========================================================================
    // Provisioning Errors
    // =========================================================================
    /// Target container to share namespaces with does not exist in the pod.
    #[error("target container '{container}' not found in pod '{pod}'")]
    TargetContainerMissing { pod: String, container: String },

    /// Cluster refused the ephemeral container.
    #[error("failed to create debug container '{container}': {reason}")]
    ContainerRejected { container: String, reason: String },

    /// Debug container terminated before it became usable.
    #[error("debug container '{container}' terminated with exit code {exit_code}: {message}")]
    ContainerTerminated {
        container: String,
        exit_code: i32,
        message: String,
    },

    /// Debug container did not reach Running in time.
    #[error("debug container '{container}' not running after {timeout:?}")]
    ContainerStartTimeout { container: String, timeout: Duration },

    /// Pod was deleted while waiting on its debug container.
    #[error("pod '{0}' was deleted")]
    PodDeleted(String),

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Stream setup or I/O failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Remote process exited with a non-zero code.
    #[error("remote command exited with code {code}")]
    RemoteExit { code: i32, stderr: String },

    /// Bounded operation did not complete within its hard deadline.
    #[error("{operation} timed out after {after:?}")]
    TimedOut { operation: String, after: Duration },

    /// Operation interrupted or declined by the operator.
    #[error("{0}")]
    Cancelled(String),

    // =========================================================================
    // Operational Errors
    // =========================================================================
    /// A remote tool produced output we could not use.
    #[error("{0}")]
    Remote(String),

    /// Local daemon did not respond or refused.
    #[error("{message}")]
    DaemonUnavailable { message: String, suggestion: String },

    /// Downloaded artifact does not match the remote file.
    #[error("integrity check failed for '{path}': {reason}")]
    IntegrityMismatch { path: String, reason: String },

    /// Kubernetes API error.
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig could not be loaded.
    #[error("failed to load kubeconfig: {0}")]
    KubeConfig(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DebugError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NothingToTarget { .. } | Self::PodNotFound { .. } => ErrorKind::Resolution,
            Self::InvalidArgument(_) | Self::AmbiguousTarget { .. } => ErrorKind::Usage,
            Self::TargetContainerMissing { .. }
            | Self::ContainerRejected { .. }
            | Self::ContainerTerminated { .. }
            | Self::ContainerStartTimeout { .. }
            | Self::PodDeleted(_) => ErrorKind::Provisioning,
            Self::Transport(_) => ErrorKind::Transport,
            Self::RemoteExit { .. } => ErrorKind::RemoteProcess,
            Self::TimedOut { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Remote(_)
            | Self::DaemonUnavailable { .. }
            | Self::IntegrityMismatch { .. }
            | Self::Kube(_)
            | Self::KubeConfig(_)
            | Self::Config(_)
            | Self::Io(_) => ErrorKind::Operational,
        }
    }

    /// Actionable hint for the operator, when there is one.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::AmbiguousTarget { .. } => Some("Pass the pod name as the POD argument"),
            Self::DaemonUnavailable { suggestion, .. } => Some(suggestion),
            Self::TimedOut { .. } => {
                Some("The tool may be starting up or unresponsive; try again or restart it")
            }
            Self::ContainerStartTimeout { .. } => {
                Some("The diagnostics image may still be pulling; try again shortly")
            }
            _ => None,
        }
    }

    /// Returns true for a missing pod, whether reported by us or as a 404 from the cluster API.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::PodNotFound { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_kinds_are_distinct() {
        let nothing = DebugError::NothingToTarget {
            environment: "tough-falcons".to_string(),
        };
        let ambiguous = DebugError::AmbiguousTarget {
            candidates: vec!["all-0".to_string(), "all-1".to_string()],
        };

        assert_eq!(nothing.kind(), ErrorKind::Resolution);
        assert_eq!(ambiguous.kind(), ErrorKind::Usage);
        assert_ne!(nothing.kind(), ambiguous.kind());
        assert!(ambiguous.to_string().contains("all-0, all-1"));
    }

    #[test]
    fn test_remote_exit_is_not_transport() {
        let remote = DebugError::RemoteExit {
            code: 3,
            stderr: String::new(),
        };
        let transport = DebugError::Transport("connection reset".to_string());

        assert_eq!(remote.kind(), ErrorKind::RemoteProcess);
        assert_eq!(transport.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_timeout_kind() {
        let err = DebugError::TimedOut {
            operation: "docker info".to_string(),
            after: Duration::from_secs(10),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "docker info timed out after 10s");
    }

    #[test]
    fn test_suggestion() {
        let err = DebugError::AmbiguousTarget { candidates: vec![] };
        assert!(err.suggestion().is_some());

        let err = DebugError::Io(std::io::Error::other("boom"));
        assert!(err.suggestion().is_none());
        assert_eq!(err.kind(), ErrorKind::Operational);
    }
}
