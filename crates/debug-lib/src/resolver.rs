//! Target pod resolution
//!
//! Picks the one pod a debug operation runs against:
//!
//! - an explicit pod name is looked up directly, without listing other shard sets
//! - a single running pod is used without asking
//! - several pods need an interactive choice, shard set first, then pod

use crate::cluster::ClusterClient;
use crate::environment::{GameServer, ShardSetWithPods};
use crate::error::{DebugError, Result};
use crate::interaction::{Choice, InteractionCapability};
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tracing::{debug, info};

/// Resolves an environment plus optional pod name to exactly one pod
pub struct PodResolver {
    interaction: Arc<dyn InteractionCapability>,
}

impl PodResolver {
    pub fn new(interaction: Arc<dyn InteractionCapability>) -> Self {
        Self { interaction }
    }

    /// Resolve the target pod and the cluster client that reaches it
    pub async fn resolve(
        &self,
        game_server: &GameServer,
        pod_name: Option<&str>,
    ) -> Result<(ClusterClient, Pod)> {
        if let Some(name) = pod_name.filter(|n| !n.is_empty()) {
            debug!(pod = %name, "Looking up explicitly named pod");
            return game_server.find_pod(name).await;
        }

        let populated: Vec<ShardSetWithPods> = game_server
            .all_shard_sets_with_pods()
            .await?
            .into_iter()
            .filter(|s| !s.pods.is_empty())
            .collect();

        let total: usize = populated.iter().map(|s| s.pods.len()).sum();
        if total == 0 {
            return Err(DebugError::NothingToTarget {
                environment: game_server.environment().to_string(),
            });
        }

        if total == 1 {
            let only = &populated[0];
            let pod = only.pods[0].clone();
            info!("Using the only running pod {}", pod_name_of(&pod));
            return Ok((only.shard_set.cluster.clone(), pod));
        }

        if !self.interaction.is_interactive() {
            return Err(DebugError::AmbiguousTarget {
                candidates: populated
                    .iter()
                    .flat_map(|s| s.pods.iter().map(|p| pod_name_of(p).to_string()))
                    .collect(),
            });
        }

        self.choose(populated)
    }

    fn choose(&self, mut populated: Vec<ShardSetWithPods>) -> Result<(ClusterClient, Pod)> {
        let shard_choices: Vec<Choice> = populated
            .iter()
            .map(|s| {
                Choice::new(
                    s.shard_set.name.clone(),
                    format!("{} pods, cluster {}", s.pods.len(), s.shard_set.cluster.name()),
                )
            })
            .collect();
        let shard_index = self
            .interaction
            .choose("Select shard set", &shard_choices)?;
        if shard_index >= populated.len() {
            return Err(DebugError::InvalidArgument(format!(
                "invalid shard set selection {}",
                shard_index
            )));
        }
        let selected = populated.swap_remove(shard_index);

        let pod_choices: Vec<Choice> = selected
            .pods
            .iter()
            .map(|p| Choice::new(pod_name_of(p), pod_description(p)))
            .collect();
        let pod_index = self.interaction.choose("Select pod", &pod_choices)?;
        let pod = selected.pods.into_iter().nth(pod_index).ok_or_else(|| {
            DebugError::InvalidArgument(format!("invalid pod selection {}", pod_index))
        })?;

        Ok((selected.shard_set.cluster, pod))
    }
}

pub(crate) fn pod_name_of(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("<unnamed>")
}

/// Short status line for a pod: phase, readiness and restart count
pub fn pod_description(pod: &Pod) -> String {
    let Some(status) = pod.status.as_ref() else {
        return "Unknown".to_string();
    };

    let phase = status.phase.as_deref().unwrap_or("Unknown");
    let statuses = status.container_statuses.as_deref().unwrap_or_default();
    let ready = statuses.iter().filter(|s| s.ready).count();
    let restarts: i32 = statuses.iter().map(|s| s.restart_count).sum();

    let mut description = format!("{} {}/{} ready", phase, ready, statuses.len());
    if restarts > 0 {
        description.push_str(&format!(", {} restarts", restarts));
    }
    description
}
