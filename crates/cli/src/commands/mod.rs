//! CLI command implementations

pub mod debug;
pub mod doctor;

use crate::output::OutputFormat;
use debug_lib::{DebugConfig, InteractionCapability};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a command needs, built once from the command line
pub struct Context {
    pub config: DebugConfig,
    pub kubeconfig: Option<PathBuf>,
    pub interaction: Arc<dyn InteractionCapability>,
    /// Fired on interrupt; every remote step observes it
    pub cancel: CancellationToken,
    pub format: OutputFormat,
}
