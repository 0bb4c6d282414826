//! Artifacts handed between healing stages.
//!
//! Evidence → [`FailureTicket`] → [`Analysis`] → [`Patch`] →
//! [`ValidationResult`] → [`MergedBatch`]

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::HealingError;
use crate::evidence::{EvidenceRecord, StepEvidence};
use crate::workflow::WorkflowCategory;

/// A failed evidence record queued for analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureTicket {
    /// Evidence file stem; unique per failed attempt
    pub id: String,
    pub workflow_id: String,
    pub agent: String,
    pub category: WorkflowCategory,
    pub evidence: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub detected_at: DateTime<Utc>,
}

impl FailureTicket {
    pub fn from_record(id: &str, evidence: &Path, record: &EvidenceRecord) -> Self {
        Self {
            id: id.to_string(),
            workflow_id: record.workflow_id.clone(),
            agent: record.agent.clone(),
            category: record.category,
            evidence: evidence.to_path_buf(),
            failed_step: record.failed_step().cloned(),
            error: record.error.clone(),
            detected_at: Utc::now(),
        }
    }

    /// Error text of the failed step, else of the record.
    pub fn error_text(&self) -> &str {
        self.failed_step
            .as_ref()
            .and_then(|s| s.error.as_deref())
            .or(self.error.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RootCause {
    /// A selector the workflow uses no longer exists in the markup
    SelectorDrift {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replacement: Option<String>,
    },
    /// An endpoint the workflow calls no longer exists in the route table
    EndpointDrift {
        method: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replacement: Option<String>,
    },
    ServerError { status: u16 },
    Timeout,
    TargetDown,
    UnsupportedAction { action: String },
    Unknown,
}

impl RootCause {
    pub fn label(&self) -> &'static str {
        match self {
            RootCause::SelectorDrift { .. } => "selector-drift",
            RootCause::EndpointDrift { .. } => "endpoint-drift",
            RootCause::ServerError { .. } => "server-error",
            RootCause::Timeout => "timeout",
            RootCause::TargetDown => "target-down",
            RootCause::UnsupportedAction { .. } => "unsupported-action",
            RootCause::Unknown => "unknown",
        }
    }

    /// The stale token and its replacement, when the cause is a drift
    /// with a located replacement.
    pub fn rename(&self) -> Option<(String, String)> {
        match self {
            RootCause::SelectorDrift {
                selector,
                replacement: Some(new),
            } => Some((selector_token(selector), selector_token(new))),
            RootCause::EndpointDrift {
                path,
                replacement: Some(new),
                ..
            } => Some((path.clone(), new.clone())),
            _ => None,
        }
    }
}

/// The bare id of `#id` / `[id="id"]`, otherwise the selector itself.
fn selector_token(selector: &str) -> String {
    if let Some(id) = selector.strip_prefix('#') {
        return id.to_string();
    }
    selector
        .strip_prefix("[id=\"")
        .and_then(|s| s.strip_suffix("\"]"))
        .unwrap_or(selector)
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Same id as the ticket it explains
    pub id: String,
    pub ticket: FailureTicket,
    pub cause: RootCause,
    pub hypothesis: String,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub needs_review: bool,
    pub analyzed_at: DateTime<Utc>,
}

/// Replace `search` with `replace` in one file. `search` must occur exactly
/// once so the edit cannot land in the wrong place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    /// Relative to the repository root
    pub path: PathBuf,
    pub search: String,
    pub replace: String,
}

impl FileEdit {
    pub fn apply_to(&self, content: &str) -> Result<String, HealingError> {
        let matches = content.matches(&self.search).count();
        if matches != 1 {
            return Err(HealingError::Patch {
                path: self.path.clone(),
                message: format!("search text matched {} times, expected exactly once", matches),
            });
        }
        Ok(content.replacen(&self.search, &self.replace, 1))
    }

    /// Apply in place under `root`.
    pub fn apply(&self, root: &Path) -> Result<(), HealingError> {
        let path = root.join(&self.path);
        let content = std::fs::read_to_string(&path).map_err(|e| HealingError::Patch {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        let updated = self.apply_to(&content)?;
        std::fs::write(&path, updated).map_err(|e| HealingError::Patch {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    pub fn preview(&self) -> String {
        let mut out = format!("--- a/{0}\n+++ b/{0}\n", self.path.display());
        for line in self.search.lines() {
            out.push_str(&format!("-{}\n", line));
        }
        for line in self.replace.lines() {
            out.push_str(&format!("+{}\n", line));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    pub analysis_id: String,
    pub workflow_id: String,
    pub description: String,
    pub edits: Vec<FileEdit>,
    /// Unified-style preview of every edit
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

impl Patch {
    pub fn branch_name(&self) -> String {
        format!("heal/{}", self.id)
    }

    pub fn files(&self) -> Vec<&Path> {
        self.edits.iter().map(|e| e.path.as_path()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub id: String,
    pub patch: Patch,
    /// Isolated branch the patch was committed and probed on
    pub branch: String,
    pub commit: String,
    pub passed: bool,
    pub detail: String,
    pub validated_at: DateTime<Utc>,
}

/// A batch of validated patches merged into the main line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedBatch {
    pub id: String,
    pub branch: String,
    pub patches: Vec<String>,
    pub head: String,
    pub merged_at: DateTime<Utc>,
}
