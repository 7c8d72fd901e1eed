//! Game server environments
//!
//! An environment is one logical game server deployment. It may span several
//! clusters; each of its shard sets (StatefulSets) lives in exactly one of them.

use crate::cluster::{ClusterClient, KubeCluster};
use crate::config::DebugConfig;
use crate::error::{DebugError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::path::PathBuf;
use tracing::debug;

/// Identifies the environment to debug
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub environment: String,
}

impl TargetRef {
    pub fn new(environment: impl Into<String>) -> Result<Self> {
        let environment = environment.into();
        if environment.trim().is_empty() {
            return Err(DebugError::InvalidArgument(
                "environment must not be empty".to_string(),
            ));
        }
        Ok(Self { environment })
    }
}

/// A named group of identical game server pods and the cluster that hosts it
#[derive(Debug, Clone)]
pub struct ShardSet {
    pub name: String,
    pub cluster: ClusterClient,
}

/// A shard set with its pods at the time of listing
#[derive(Debug, Clone)]
pub struct ShardSetWithPods {
    pub shard_set: ShardSet,
    pub pods: Vec<Pod>,
}

/// All shard sets of an environment, in a stable order
#[derive(Debug, Clone)]
pub struct GameServer {
    environment: String,
    shard_sets: Vec<ShardSet>,
}

impl GameServer {
    pub fn new(environment: impl Into<String>, shard_sets: Vec<ShardSet>) -> Self {
        Self {
            environment: environment.into(),
            shard_sets,
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn shard_sets(&self) -> &[ShardSet] {
        &self.shard_sets
    }

    /// List every shard set with its pods, preserving shard set order
    pub async fn all_shard_sets_with_pods(&self) -> Result<Vec<ShardSetWithPods>> {
        let mut result = Vec::with_capacity(self.shard_sets.len());
        for shard_set in &self.shard_sets {
            let pods = shard_set
                .cluster
                .list_shard_set_pods(&shard_set.name)
                .await?;
            debug!(shard_set = %shard_set.name, pods = pods.len(), "Listed shard set pods");
            result.push(ShardSetWithPods {
                shard_set: shard_set.clone(),
                pods,
            });
        }
        Ok(result)
    }

    /// Find a pod by name and the cluster that hosts it.
    ///
    /// Pods are named `<shard-set>-<index>`, so the owning shard set is tried
    /// first without touching any other cluster.
    pub async fn find_pod(&self, pod_name: &str) -> Result<(ClusterClient, Pod)> {
        if let Some(shard_set) = self.shard_set_for_pod(pod_name) {
            return match shard_set.cluster.get_pod(pod_name).await {
                Ok(pod) => Ok((shard_set.cluster.clone(), pod)),
                Err(e) if e.is_not_found() => Err(DebugError::PodNotFound {
                    pod: pod_name.to_string(),
                }),
                Err(e) => Err(e),
            };
        }

        for shard_set in &self.shard_sets {
            let pods = shard_set
                .cluster
                .list_shard_set_pods(&shard_set.name)
                .await?;
            if let Some(pod) = pods
                .into_iter()
                .find(|p| p.metadata.name.as_deref() == Some(pod_name))
            {
                return Ok((shard_set.cluster.clone(), pod));
            }
        }

        Err(DebugError::PodNotFound {
            pod: pod_name.to_string(),
        })
    }

    fn shard_set_for_pod(&self, pod_name: &str) -> Option<&ShardSet> {
        let (prefix, index) = pod_name.rsplit_once('-')?;
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        self.shard_sets.iter().find(|s| s.name == prefix)
    }
}

/// Looks up the game server deployment behind an environment id
#[async_trait]
pub trait EnvironmentResolver: Send + Sync {
    async fn game_server(&self, target: &TargetRef) -> Result<GameServer>;
}

/// Resolves environments from configuration and kube contexts.
///
/// An environment without configuration maps to the namespace of the same
/// name in the current kube context.
pub struct KubeEnvironmentResolver {
    config: DebugConfig,
    kubeconfig: Option<PathBuf>,
}

impl KubeEnvironmentResolver {
    pub fn new(config: DebugConfig, kubeconfig: Option<PathBuf>) -> Self {
        Self { config, kubeconfig }
    }
}

#[async_trait]
impl EnvironmentResolver for KubeEnvironmentResolver {
    async fn game_server(&self, target: &TargetRef) -> Result<GameServer> {
        let env = self.config.environment(&target.environment);
        let namespace = env
            .and_then(|e| e.namespace.clone())
            .unwrap_or_else(|| target.environment.clone());

        let contexts: Vec<Option<&str>> = match env {
            Some(e) if !e.contexts.is_empty() => e.contexts.iter().map(|c| Some(c.as_str())).collect(),
            _ => vec![None],
        };
        let explicit = env.map(|e| e.shard_sets.as_slice()).unwrap_or_default();

        let mut shard_sets = Vec::new();
        for context in contexts {
            let cluster = KubeCluster::connect(
                self.kubeconfig.as_deref(),
                context,
                &namespace,
                &self.config.pod_label_selector,
            )
            .await?;
            let client = ClusterClient::new(cluster);

            let mut names = client.list_shard_sets().await?;
            if !explicit.is_empty() {
                names.retain(|n| explicit.contains(n));
            }

            shard_sets.extend(names.into_iter().map(|name| ShardSet {
                name,
                cluster: client.clone(),
            }));
        }

        debug!(
            environment = %target.environment,
            namespace = %namespace,
            shard_sets = shard_sets.len(),
            "Resolved environment"
        );
        Ok(GameServer::new(target.environment.clone(), shard_sets))
    }
}
