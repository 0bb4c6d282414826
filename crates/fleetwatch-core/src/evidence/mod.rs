//! Evidence — the durable trace of one workflow execution attempt.
//!
//! A record is built in memory by [`EvidenceRecorder`] while the workflow
//! runs and written exactly once, atomically, by [`EvidenceStore::persist`].
//! Files are named by [`EvidenceKey`] (`<workflow-id>--<timestamp>.json`) and
//! are never overwritten; corrections are new records.

mod key;
mod recorder;
mod store;

pub use key::EvidenceKey;
pub use recorder::EvidenceRecorder;
pub use store::EvidenceStore;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowCategory;

/// Terminal outcome of an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceOutcome {
    Passed,
    Failed,
    /// Stopped by a termination request after the in-flight step finished
    Interrupted,
    /// Not executed because a dependency had not passed
    Skipped,
}

impl EvidenceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceOutcome::Passed => "passed",
            EvidenceOutcome::Failed => "failed",
            EvidenceOutcome::Interrupted => "interrupted",
            EvidenceOutcome::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for EvidenceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory finding from a response validator. Never decides pass/fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub rule: String,
    pub passed: bool,
    pub detail: String,
}

/// Result of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvidence {
    /// 1-based position in the workflow
    pub index: usize,
    pub action: String,
    /// Selector or `METHOD path` the step touched
    pub target: String,
    pub success: bool,
    /// Raw response (HTTP body or script result)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationFinding>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub workflow_id: String,
    /// Unique per execution attempt
    pub attempt_id: String,
    /// Worker that produced the record
    pub agent: String,
    pub category: WorkflowCategory,
    #[serde(default)]
    pub critical_path: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    pub outcome: EvidenceOutcome,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepEvidence>,
    /// Screenshot captured on a UI step failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<PathBuf>,
}

impl EvidenceRecord {
    pub fn key(&self) -> EvidenceKey {
        EvidenceKey::new(&self.workflow_id, self.started_at)
    }

    /// The first failed step, if any.
    pub fn failed_step(&self) -> Option<&StepEvidence> {
        self.steps.iter().find(|s| !s.success)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed evidence file '{path}': {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Evidence record already exists: {0}")]
    AlreadyExists(String),
}
