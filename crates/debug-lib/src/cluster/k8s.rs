//! kube-rs backed cluster access

use super::{
    ephemeral_phase, BoxedReader, BoxedWriter, ClusterAccess, EphemeralPhase, RemoteStreams,
    StreamOptions,
};
use crate::error::{DebugError, Result};
use async_trait::async_trait;
use futures::{future, FutureExt, StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{EphemeralContainer, Pod};
use kube::api::{AttachParams, AttachedProcess, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Api, Client, Config};
use std::path::Path;
use tracing::{debug, info};

/// One cluster context plus the namespace the game server lives in
pub struct KubeCluster {
    name: String,
    namespace: String,
    label_selector: String,
    client: Client,
}

impl KubeCluster {
    pub fn new(
        client: Client,
        name: impl Into<String>,
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            label_selector: label_selector.into(),
            client,
        }
    }

    /// Connect using a kubeconfig file and context.
    ///
    /// With neither given, the usual inference applies (`KUBECONFIG`,
    /// `~/.kube/config`, then in-cluster service account).
    pub async fn connect(
        kubeconfig: Option<&Path>,
        context: Option<&str>,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Self> {
        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };

        let config = match (kubeconfig, context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| DebugError::KubeConfig(format!("{}: {}", path.display(), e)))?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| DebugError::KubeConfig(e.to_string()))?
            }
            (None, Some(_)) => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| DebugError::KubeConfig(e.to_string()))?,
            (None, None) => Config::infer()
                .await
                .map_err(|e| DebugError::KubeConfig(e.to_string()))?,
        };

        let name = context
            .map(str::to_string)
            .unwrap_or_else(|| config.cluster_url.host().unwrap_or("default").to_string());
        let client = Client::try_from(config)?;

        debug!(cluster = %name, namespace = %namespace, "Connected to cluster");
        Ok(Self::new(client, name, namespace, label_selector))
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn stateful_sets(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterAccess for KubeCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_pod(&self, name: &str) -> Result<Pod> {
        match self.pods().get(name).await {
            Ok(pod) => Ok(pod),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(DebugError::PodNotFound {
                pod: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_shard_sets(&self) -> Result<Vec<String>> {
        let params = ListParams::default().labels(&self.label_selector);
        let sets = self.stateful_sets().list(&params).await?;
        Ok(sets
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect())
    }

    async fn list_shard_set_pods(&self, shard_set: &str) -> Result<Vec<Pod>> {
        let set = self.stateful_sets().get(shard_set).await?;
        let Some(uid) = set.metadata.uid else {
            return Ok(Vec::new());
        };

        let params = ListParams::default().labels(&self.label_selector);
        let pods = self.pods().list(&params).await?;
        Ok(pods
            .items
            .into_iter()
            .filter(|pod| owned_by(pod, &uid))
            .collect())
    }

    async fn add_ephemeral_container(&self, pod: &str, container: EphemeralContainer) -> Result<()> {
        let name = container.name.clone();
        let patch = serde_json::json!({
            "spec": {
                "ephemeralContainers": [container]
            }
        });

        self.pods()
            .patch_subresource(
                "ephemeralcontainers",
                pod,
                &PatchParams::default(),
                &Patch::Strategic(&patch),
            )
            .await
            .map_err(|e| DebugError::ContainerRejected {
                container: name,
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn wait_ephemeral_running(&self, pod: &str, container: &str) -> Result<()> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", pod));
        let mut events = watcher(self.pods(), config).boxed();

        while let Some(event) = events
            .try_next()
            .await
            .map_err(|e| DebugError::Transport(format!("pod watch failed: {}", e)))?
        {
            let snapshots = match event {
                Event::Applied(pod) => vec![pod],
                Event::Restarted(pods) => pods,
                Event::Deleted(_) => return Err(DebugError::PodDeleted(pod.to_string())),
            };

            for snapshot in &snapshots {
                match ephemeral_phase(snapshot, container) {
                    EphemeralPhase::Running => return Ok(()),
                    EphemeralPhase::Terminated { exit_code, message } => {
                        return Err(DebugError::ContainerTerminated {
                            container: container.to_string(),
                            exit_code,
                            message,
                        });
                    }
                    EphemeralPhase::Waiting { reason, message } => {
                        info!("Debug container {}: {} {}", container, reason, message);
                    }
                    EphemeralPhase::Missing => {}
                }
            }
        }

        Err(DebugError::Transport(format!("watch on pod '{}' ended", pod)))
    }

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        options: StreamOptions,
    ) -> Result<RemoteStreams> {
        debug!(pod = %pod, container = %container, command = ?command, "Starting remote command");
        let process = self
            .pods()
            .exec(pod, command, &attach_params(container, options))
            .await
            .map_err(|e| DebugError::Transport(format!("failed to start remote command: {}", e)))?;

        Ok(into_remote_streams(process))
    }

    async fn attach(&self, pod: &str, container: &str, options: StreamOptions) -> Result<RemoteStreams> {
        debug!(pod = %pod, container = %container, "Attaching to container");
        let process = self
            .pods()
            .attach(pod, &attach_params(container, options))
            .await
            .map_err(|e| DebugError::Transport(format!("failed to attach: {}", e)))?;

        Ok(into_remote_streams(process))
    }
}

fn owned_by(pod: &Pod, uid: &str) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.kind == "StatefulSet" && r.uid == uid))
        .unwrap_or(false)
}

/// A terminal merges stderr into stdout, so both cannot be requested.
fn attach_params(container: &str, options: StreamOptions) -> AttachParams {
    AttachParams::default()
        .container(container)
        .stdin(options.stdin)
        .stdout(true)
        .stderr(!options.tty)
        .tty(options.tty)
}

fn into_remote_streams(mut process: AttachedProcess) -> RemoteStreams {
    let stdin = process.stdin().map(|w| Box::new(w) as BoxedWriter);
    let stdout = process.stdout().map(|r| Box::new(r) as BoxedReader);
    let stderr = process.stderr().map(|r| Box::new(r) as BoxedReader);
    let resize = process.terminal_size();
    let status = match process.take_status() {
        Some(status) => status.boxed(),
        None => future::ready(None).boxed(),
    };
    let finished = async move {
        process
            .join()
            .await
            .map_err(|e| DebugError::Transport(e.to_string()))
    }
    .boxed();

    RemoteStreams {
        stdin,
        stdout,
        stderr,
        resize,
        status,
        finished,
    }
}
