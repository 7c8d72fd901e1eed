//! Remote debug sessions for game server pods
//!
//! This crate provides the core functionality for:
//! - Resolving an environment and optional pod name to one game server pod
//! - Provisioning ephemeral debug containers next to the server process
//! - Interactive shells over multiplexed exec/attach streams
//! - Heap dump and CPU profile collection with artifact retrieval
//! - Bounding calls into tools that are known to hang

pub mod bounded;
pub mod cluster;
pub mod config;
pub mod container;
pub mod cpu_profile;
pub mod docker;
pub mod environment;
pub mod error;
pub mod heap_dump;
pub mod humanize;
pub mod interaction;
pub mod probe;
pub mod process_info;
pub mod remote;
pub mod resolver;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bounded::{BoundedError, BoundedOperation};
pub use cluster::{ClusterAccess, ClusterClient, KubeCluster};
pub use config::DebugConfig;
pub use container::{DebugContainerManager, DebugContainerSpec, DebugSession};
pub use cpu_profile::{CpuProfileReport, CpuProfileRequest, CpuProfileWorkflow, ProfileFormat};
pub use environment::{EnvironmentResolver, GameServer, KubeEnvironmentResolver, TargetRef};
pub use error::{DebugError, ErrorKind, Result};
pub use heap_dump::{DumpMode, HeapDumpReport, HeapDumpRequest, HeapDumpWorkflow};
pub use interaction::{InteractionCapability, NonInteractive, TerminalPrompt};
pub use resolver::PodResolver;
pub use session::ShellSession;
pub use transport::IoStreams;
