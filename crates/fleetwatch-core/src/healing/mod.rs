//! Self-healing pipeline.
//!
//! Stages hand artifacts to each other through file queues under
//! `<state>/healing/`:
//!
//! ```text
//! evidence ─► Coordinator ─► failures ─► Analysis ─┬─► analyses ─► FixGenerator ─► patches
//!                                                  └─► review (low confidence, terminal)
//! patches ─► BranchValidator ─► validated ─► CommitAgent ─► merged ─► Orchestrator ─► re-test
//! ```
//!
//! An artifact that cannot move forward confidently (low confidence, no
//! patchable location, failed validation, conflicting merge) is rejected
//! with a reason and goes no further. Stage errors never become merges.

pub mod analysis;
pub mod artifacts;
pub mod commit;
pub mod coordinator;
pub mod fix;
pub mod orchestrator;
pub mod queue;
pub mod validate;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::evidence::EvidenceError;
use crate::git::GitError;
use crate::workflow::{DiscoveryConfig, DiscoveryError};

pub use analysis::{classify, AnalysisStage, Diagnosis, Inventory};
pub use artifacts::{
    Analysis, FailureTicket, FileEdit, MergedBatch, Patch, RootCause, ValidationResult,
};
pub use commit::CommitAgent;
pub use coordinator::Coordinator;
pub use fix::FixGenerator;
pub use orchestrator::{CycleReport, HealingOrchestrator, RetestStage};
pub use queue::{ArtifactQueue, Claimed, QueueState};
pub use validate::{BranchValidator, CommandProbe, ProbeOutcome, WorkflowProbe};

/// Queue names under `<state>/healing/`.
pub mod queues {
    pub const FAILURES: &str = "failures";
    pub const ANALYSES: &str = "analyses";
    pub const REVIEW: &str = "review";
    pub const PATCHES: &str = "patches";
    pub const VALIDATED: &str = "validated";
    pub const MERGED: &str = "merged";
}

#[derive(Debug, thiserror::Error)]
pub enum HealingError {
    #[error("Queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("Cannot apply edit to '{path}': {message}")]
    Patch { path: PathBuf, message: String },

    #[error("Probe failed to run: {0}")]
    Probe(String),

    #[error("Invalid healing config '{path}': {message}")]
    Config { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(String),
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_batch_size() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

/// Healing pipeline settings (YAML). Relative paths are resolved against
/// the repository root by the stages that use them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    /// Analyses below this confidence go to human review
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Validated patches merged per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Where the analysis stage looks for current selectors and routes
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Files the fix generator may edit
    #[serde(default)]
    pub patch_targets: Vec<PathBuf>,

    /// Command run inside a validation worktree; exit 0 passes. The
    /// workflow id is in `FLEET_WORKFLOW_ID`.
    #[serde(default)]
    pub probe_command: Vec<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            batch_size: default_batch_size(),
            discovery: DiscoveryConfig::default(),
            patch_targets: Vec::new(),
            probe_command: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl HealingConfig {
    pub fn from_file(path: &Path) -> Result<Self, HealingError> {
        let content = std::fs::read_to_string(path).map_err(|e| HealingError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&content).map_err(|e| HealingError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Discovery settings with source paths anchored at `repo_root`.
    pub fn discovery_for(&self, repo_root: &Path) -> DiscoveryConfig {
        let mut discovery = self.discovery.clone();
        for source in [&mut discovery.ui_source, &mut discovery.routes_source] {
            if let Some(p) = source.as_mut() {
                if p.is_relative() {
                    *p = repo_root.join(&p);
                }
            }
        }
        discovery
    }
}

/// One stage of the pipeline. `run_once` drains whatever is pending and
/// reports how many artifacts it handled.
#[async_trait]
pub trait HealingStage: Send {
    fn name(&self) -> &'static str;

    async fn run_once(&mut self) -> Result<usize, HealingError>;
}

/// Run a stage on its own until cancelled, e.g. as a fleet process.
pub async fn run_stage(
    stage: &mut dyn HealingStage,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), HealingError> {
    tracing::info!("[Heal:{}] Started", stage.name());
    loop {
        let handled = stage.run_once().await?;
        if handled > 0 {
            tracing::info!("[Heal:{}] Handled {} artifact(s)", stage.name(), handled);
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                tracing::info!("[Heal:{}] Stopped", stage.name());
                return Ok(());
            }
        }
    }
}
