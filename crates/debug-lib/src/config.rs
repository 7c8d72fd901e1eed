//! Debug tool configuration
//!
//! Built from defaults, an optional TOML file and `GSD_*` environment
//! variables, in that order of precedence. The resulting [`DebugConfig`] is
//! handed explicitly to every component that needs it.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for one named environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Kubernetes namespace holding the game server
    pub namespace: Option<String>,
    /// Kube contexts of every cluster backing this environment (empty: current context)
    #[serde(default)]
    pub contexts: Vec<String>,
    /// Explicit shard set (StatefulSet) names; discovered by label selector when empty
    #[serde(default)]
    pub shard_sets: Vec<String>,
}

/// Debug tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Image used for ephemeral debug containers
    #[serde(default = "default_diagnostics_image")]
    pub diagnostics_image: String,

    /// Container whose namespaces the debug container shares
    #[serde(default = "default_server_container")]
    pub server_container: String,

    /// Label selector matching game server pods and shard sets
    #[serde(default = "default_pod_label_selector")]
    pub pod_label_selector: String,

    /// `pgrep -f` pattern identifying the server process
    #[serde(default = "default_server_process_pattern")]
    pub server_process_pattern: String,

    /// Port of the server's admin endpoint serving health probe overrides
    #[serde(default = "default_probe_admin_port")]
    pub probe_admin_port: u16,

    /// Command run as the interactive debug shell
    #[serde(default = "default_shell_command")]
    pub shell_command: Vec<String>,

    /// Heap dump duration estimate in seconds per GB of resident memory
    #[serde(default = "default_heap_dump_secs_per_gb")]
    pub heap_dump_secs_per_gb: f64,

    /// Heap dumps are abandoned after this multiple of the estimate
    #[serde(default = "default_heap_dump_timeout_factor")]
    pub heap_dump_timeout_factor: f64,

    /// Lower bound on the heap dump hard timeout
    #[serde(default = "default_heap_dump_min_timeout_secs")]
    pub heap_dump_min_timeout_secs: u64,

    /// Maximum lifetime of keep-alive debug containers in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// How long to wait for a debug container to reach Running
    #[serde(default = "default_container_ready_timeout_secs")]
    pub container_ready_timeout_secs: u64,

    /// Bound on debug container teardown
    #[serde(default = "default_cleanup_timeout_secs")]
    pub cleanup_timeout_secs: u64,

    /// Soft timeout for health probe toggles
    #[serde(default = "default_soft_timeout_ms")]
    pub probe_soft_timeout_ms: u64,

    /// Hard timeout for health probe toggles
    #[serde(default = "default_hard_timeout_ms")]
    pub probe_hard_timeout_ms: u64,

    /// Local container daemon binary
    #[serde(default = "default_daemon_binary")]
    pub daemon_binary: String,

    /// Soft timeout for local daemon checks
    #[serde(default = "default_soft_timeout_ms")]
    pub daemon_soft_timeout_ms: u64,

    /// Hard timeout for local daemon checks
    #[serde(default = "default_hard_timeout_ms")]
    pub daemon_hard_timeout_ms: u64,

    /// Named environments
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

fn default_diagnostics_image() -> String {
    "metaplay/diagnostics:latest".to_string()
}

fn default_server_container() -> String {
    "shard-server".to_string()
}

fn default_pod_label_selector() -> String {
    "app=metaplay-server".to_string()
}

fn default_server_process_pattern() -> String {
    "Server".to_string()
}

fn default_probe_admin_port() -> u16 {
    8585
}

fn default_shell_command() -> Vec<String> {
    vec![
        "/bin/bash".to_string(),
        "--rcfile".to_string(),
        "/entrypoint.sh".to_string(),
    ]
}

fn default_heap_dump_secs_per_gb() -> f64 {
    10.0
}

fn default_heap_dump_timeout_factor() -> f64 {
    5.0
}

fn default_heap_dump_min_timeout_secs() -> u64 {
    300
}

fn default_keepalive_secs() -> u64 {
    3600
}

fn default_container_ready_timeout_secs() -> u64 {
    60
}

fn default_cleanup_timeout_secs() -> u64 {
    30
}

fn default_soft_timeout_ms() -> u64 {
    1_000
}

fn default_hard_timeout_ms() -> u64 {
    10_000
}

fn default_daemon_binary() -> String {
    "docker".to_string()
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            diagnostics_image: default_diagnostics_image(),
            server_container: default_server_container(),
            pod_label_selector: default_pod_label_selector(),
            server_process_pattern: default_server_process_pattern(),
            probe_admin_port: default_probe_admin_port(),
            shell_command: default_shell_command(),
            heap_dump_secs_per_gb: default_heap_dump_secs_per_gb(),
            heap_dump_timeout_factor: default_heap_dump_timeout_factor(),
            heap_dump_min_timeout_secs: default_heap_dump_min_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            container_ready_timeout_secs: default_container_ready_timeout_secs(),
            cleanup_timeout_secs: default_cleanup_timeout_secs(),
            probe_soft_timeout_ms: default_soft_timeout_ms(),
            probe_hard_timeout_ms: default_hard_timeout_ms(),
            daemon_binary: default_daemon_binary(),
            daemon_soft_timeout_ms: default_soft_timeout_ms(),
            daemon_hard_timeout_ms: default_hard_timeout_ms(),
            environments: BTreeMap::new(),
        }
    }
}

impl DebugConfig {
    /// Load configuration from the default file location and environment
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path().as_deref())
    }

    /// Load configuration from an explicit file (optional) and environment
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("GSD").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Get the default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("gsd").join("config.toml"))
    }

    /// Settings for environment `id`.
    ///
    /// Keys read from files and the environment are lowercased on load, so the
    /// lookup falls back to the lowercased id.
    pub fn environment(&self, id: &str) -> Option<&EnvironmentConfig> {
        self.environments
            .get(id)
            .or_else(|| self.environments.get(&id.to_lowercase()))
    }

    pub fn container_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.container_ready_timeout_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    /// Hard bound for a heap dump estimated to take `estimate`.
    ///
    /// Never shorter than the configured minimum, never longer than the
    /// keep-alive container lives.
    pub fn heap_dump_timeout(&self, estimate: Duration) -> Duration {
        let scaled = estimate.mul_f64(self.heap_dump_timeout_factor.max(1.0));
        scaled
            .max(Duration::from_secs(self.heap_dump_min_timeout_secs))
            .min(Duration::from_secs(self.keepalive_secs))
    }

    pub fn probe_timeouts(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.probe_soft_timeout_ms),
            Duration::from_millis(self.probe_hard_timeout_ms),
        )
    }

    pub fn daemon_timeouts(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.daemon_soft_timeout_ms),
            Duration::from_millis(self.daemon_hard_timeout_ms),
        )
    }
}
