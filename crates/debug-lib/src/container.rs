//! Ephemeral debug containers
//!
//! A debug container is attached to a running game server pod and shares the
//! process namespace of its server container, so tools inside it can see and
//! trace the server process.
//!
//! Ephemeral containers cannot be removed from a pod once added. Teardown
//! therefore terminates the container's main process, whose PID the wrapper
//! command records at startup.

use crate::cluster::{exec_capture, ClusterClient};
use crate::config::DebugConfig;
use crate::error::{DebugError, Result};
use crate::remote::ContainerShell;
use crate::session::cancellable;
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{Capabilities, EnvVar, EphemeralContainer, SecurityContext};
use rand::RngCore;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the wrapper command records the main process PID
const PID_FILE: &str = "/tmp/.debug-session.pid";

/// What to run in a debug container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugContainerSpec {
    /// Pod to attach to
    pub target_pod: String,
    /// Container whose process namespace is shared
    pub base_container: String,
    pub image: String,
    pub command: Vec<String>,
    pub attach_stdin: bool,
    pub allocate_tty: bool,
}

impl DebugContainerSpec {
    /// Container running an interactive shell on a terminal
    pub fn interactive(target_pod: &str, config: &DebugConfig) -> Self {
        Self {
            target_pod: target_pod.to_string(),
            base_container: config.server_container.clone(),
            image: config.diagnostics_image.clone(),
            command: config.shell_command.clone(),
            attach_stdin: true,
            allocate_tty: true,
        }
    }

    /// Container that idles for at most `keepalive_secs` so commands can be exec'd into it
    pub fn keepalive(target_pod: &str, config: &DebugConfig) -> Self {
        Self {
            target_pod: target_pod.to_string(),
            base_container: config.server_container.clone(),
            image: config.diagnostics_image.clone(),
            command: vec!["sleep".to_string(), config.keepalive_secs.to_string()],
            attach_stdin: false,
            allocate_tty: false,
        }
    }

    fn to_ephemeral(&self, name: &str) -> EphemeralContainer {
        EphemeralContainer {
            name: name.to_string(),
            image: Some(self.image.clone()),
            image_pull_policy: Some("Always".to_string()),
            command: Some(wrap_command(&self.command)),
            stdin: Some(self.attach_stdin),
            stdin_once: Some(self.attach_stdin),
            tty: Some(self.allocate_tty),
            target_container_name: Some(self.base_container.clone()),
            env: Some(vec![EnvVar {
                name: "TERM".to_string(),
                value: Some("xterm-256color".to_string()),
                value_from: None,
            }]),
            security_context: Some(SecurityContext {
                capabilities: Some(Capabilities {
                    add: Some(vec!["SYS_PTRACE".to_string()]),
                    drop: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Record the shell PID, then exec the real command in its place
fn wrap_command(command: &[String]) -> Vec<String> {
    let mut wrapped = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("echo $$ > {} && exec \"$@\"", PID_FILE),
        "debug-session".to_string(),
    ];
    wrapped.extend(command.iter().cloned());
    wrapped
}

/// Generate a fresh `debugger-<16 hex>` container name
pub fn debug_container_name() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("debugger-{}", hex::encode(bytes))
}

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Idempotent teardown of a debug container.
///
/// Runs at most once no matter how often [`Cleanup::run`] is called. If it was
/// never run, dropping it spawns the teardown on the current runtime, which
/// only completes if the runtime keeps running.
pub struct Cleanup {
    label: String,
    action: Option<CleanupAction>,
}

impl Cleanup {
    /// Cleanup with nothing to do
    pub fn noop() -> Self {
        Self {
            label: String::new(),
            action: None,
        }
    }

    pub fn new<F, Fut>(label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            label: label.into(),
            action: Some(Box::new(move || action().boxed())),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.action.is_some()
    }

    pub async fn run(&mut self) {
        if let Some(action) = self.action.take() {
            action().await;
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        let Some(action) = self.action.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    "Debug container {} was not cleaned up and may be left running; \
                     trying to stop it in the background",
                    self.label
                );
                handle.spawn(action());
            }
            Err(_) => {
                warn!(
                    "Debug container {} may be left running until its command ends",
                    self.label
                );
            }
        }
    }
}

/// A running debug container
pub struct DebugSession {
    container_name: String,
    pod_name: String,
    cluster: ClusterClient,
    cleanup: Cleanup,
}

impl DebugSession {
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    pub fn cluster(&self) -> &ClusterClient {
        &self.cluster
    }

    /// Shell for running commands inside the debug container
    pub fn shell(&self) -> ContainerShell {
        ContainerShell::new(
            self.cluster.clone(),
            self.pod_name.clone(),
            self.container_name.clone(),
        )
    }

    /// Tear the container down; safe to call repeatedly
    pub async fn cleanup(&mut self) {
        self.cleanup.run().await;
    }
}

/// Creates debug containers and hands back their teardown
#[derive(Debug, Clone)]
pub struct DebugContainerManager {
    ready_timeout: Duration,
    cleanup_timeout: Duration,
}

impl DebugContainerManager {
    pub fn new(config: &DebugConfig) -> Self {
        Self {
            ready_timeout: config.container_ready_timeout(),
            cleanup_timeout: config.cleanup_timeout(),
        }
    }

    /// Create a debug container and wait until it is running.
    ///
    /// On any failure or cancellation after the container was added, its
    /// teardown has already run by the time the error is returned.
    pub async fn create(
        &self,
        cluster: &ClusterClient,
        spec: &DebugContainerSpec,
        cancel: &CancellationToken,
    ) -> Result<DebugSession> {
        let name = debug_container_name();

        let pod = cancellable(cancel, cluster.get_pod(&spec.target_pod)).await?;
        let has_base = pod
            .spec
            .as_ref()
            .map(|s| s.containers.iter().any(|c| c.name == spec.base_container))
            .unwrap_or(false);
        if !has_base {
            return Err(DebugError::TargetContainerMissing {
                pod: spec.target_pod.clone(),
                container: spec.base_container.clone(),
            });
        }

        info!("Creating debug container {} in pod {}", name, spec.target_pod);
        cluster
            .add_ephemeral_container(&spec.target_pod, spec.to_ephemeral(&name))
            .await?;

        let mut cleanup = self.teardown(cluster, &spec.target_pod, &name);

        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DebugError::Cancelled(format!(
                "interrupted while starting debug container {}",
                name
            ))),
            waited = tokio::time::timeout(
                self.ready_timeout,
                cluster.wait_ephemeral_running(&spec.target_pod, &name),
            ) => match waited {
                Ok(result) => result,
                Err(_) => Err(DebugError::ContainerStartTimeout {
                    container: name.clone(),
                    timeout: self.ready_timeout,
                }),
            },
        };

        if let Err(e) = ready {
            cleanup.run().await;
            return Err(e);
        }

        debug!(container = %name, "Debug container running");
        Ok(DebugSession {
            container_name: name,
            pod_name: spec.target_pod.clone(),
            cluster: cluster.clone(),
            cleanup,
        })
    }

    fn teardown(&self, cluster: &ClusterClient, pod: &str, container: &str) -> Cleanup {
        let cluster = cluster.clone();
        let pod = pod.to_string();
        let container = container.to_string();
        let timeout = self.cleanup_timeout;

        Cleanup::new(container.clone(), move || async move {
            let command = vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("kill $(cat {})", PID_FILE),
            ];
            match tokio::time::timeout(timeout, exec_capture(&*cluster, &pod, &container, command)).await {
                Ok(Ok(output)) if output.exit.is_success() => {
                    debug!(container = %container, "Debug container terminated");
                }
                Ok(Ok(output)) => {
                    warn!(
                        "Failed to terminate debug container {} ({:?}): {}",
                        container,
                        output.exit,
                        output.stderr.trim()
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        "Failed to terminate debug container {}: {}; it may still start and keep running",
                        container, e
                    );
                }
                Err(_) => {
                    warn!(
                        "Timed out terminating debug container {} after {:?}",
                        container, timeout
                    );
                }
            }
        })
    }
}

/// Create a debug container, run `body` against it, then always tear it down
pub async fn run_scoped<T, F, Fut>(
    manager: &DebugContainerManager,
    cluster: &ClusterClient,
    spec: &DebugContainerSpec,
    cancel: &CancellationToken,
    body: F,
) -> Result<T>
where
    F: FnOnce(&DebugSession) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut session = manager.create(cluster, spec, cancel).await?;
    let result = body(&session).await;
    session.cleanup().await;
    result
}
