//! Interactive debug shell sessions

use crate::cluster::ClusterClient;
use crate::config::DebugConfig;
use crate::container::{DebugContainerManager, DebugContainerSpec};
use crate::error::{DebugError, Result};
use crate::resolver::pod_name_of;
use crate::transport::{self, IoStreams};
use k8s_openapi::api::core::v1::Pod;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run `fut` unless `cancel` fires first
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DebugError::Cancelled("operation interrupted".to_string())),
        result = fut => result,
    }
}

/// Opens a shell in a fresh debug container next to the game server
pub struct ShellSession {
    config: DebugConfig,
    manager: DebugContainerManager,
}

impl ShellSession {
    pub fn new(config: DebugConfig) -> Self {
        Self {
            manager: DebugContainerManager::new(&config),
            config,
        }
    }

    /// Create the container, attach local I/O until the shell exits, then tear it down
    pub async fn open(
        &self,
        cluster: &ClusterClient,
        pod: &Pod,
        io: IoStreams,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = DebugContainerSpec::interactive(pod_name_of(pod), &self.config);
        let mut session = self.manager.create(cluster, &spec, cancel).await?;

        info!(
            "Attached to debug container {} in pod {}; exit the shell to end the session",
            session.container_name(),
            session.pod_name()
        );
        if io.is_terminal() {
            info!("If you don't see a command prompt, try pressing enter.");
        }

        let result = transport::attach(
            cluster,
            session.pod_name(),
            session.container_name(),
            io,
            spec.attach_stdin,
            spec.allocate_tty,
            cancel,
        )
        .await;

        session.cleanup().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellable_passes_result_through() {
        let cancel = CancellationToken::new();
        let value = cancellable(&cancel, async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = cancellable(&cancel, async { Ok::<_, DebugError>(5) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellable_interrupts_pending_work() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result: Result<()> = cancellable(&cancel, std::future::pending()).await;
        assert!(matches!(result, Err(DebugError::Cancelled(_))));
    }
}
