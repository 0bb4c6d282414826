use std::path::PathBuf;

use chrono::{DateTime, Utc};

use super::{EvidenceOutcome, EvidenceRecord, StepEvidence};
use crate::workflow::WorkflowDefinition;

/// Builds an [`EvidenceRecord`] in memory while a workflow executes.
///
/// Nothing touches disk until the finished record is handed to the store,
/// so an attempt killed mid-flight leaves no file behind.
#[derive(Debug)]
pub struct EvidenceRecorder {
    workflow_id: String,
    agent: String,
    category: crate::workflow::WorkflowCategory,
    critical_path: bool,
    attempt_id: String,
    started_at: DateTime<Utc>,
    failed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    interrupted: bool,
    steps: Vec<StepEvidence>,
    screenshot: Option<PathBuf>,
}

impl EvidenceRecorder {
    pub fn start(workflow: &WorkflowDefinition, agent: &str) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            agent: agent.to_string(),
            category: workflow.category,
            critical_path: workflow.critical_path,
            attempt_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            failed_at: None,
            error: None,
            interrupted: false,
            steps: Vec::new(),
            screenshot: None,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn steps(&self) -> &[StepEvidence] {
        &self.steps
    }

    /// Append a step result. The first failing step records the failure
    /// time and error for the whole attempt.
    pub fn push_step(&mut self, step: StepEvidence) {
        if !step.success && self.failed_at.is_none() {
            self.failed_at = Some(Utc::now());
            if self.error.is_none() {
                self.error = Some(format!(
                    "step {} ({}) failed: {}",
                    step.index,
                    step.action,
                    step.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
        self.steps.push(step);
    }

    /// Record a failure that happened outside any step.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.failed_at.is_none() {
            self.failed_at = Some(Utc::now());
        }
        self.error = Some(error.into());
    }

    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    pub fn attach_screenshot(&mut self, path: PathBuf) {
        self.screenshot = Some(path);
    }

    pub fn finish(mut self) -> EvidenceRecord {
        let outcome = if self.failed_at.is_some() || self.error.is_some() {
            EvidenceOutcome::Failed
        } else if self.interrupted {
            EvidenceOutcome::Interrupted
        } else {
            EvidenceOutcome::Passed
        };
        let error = match (outcome, self.error.take()) {
            (EvidenceOutcome::Interrupted, None) => {
                Some("interrupted by termination request".to_string())
            }
            (_, error) => error,
        };
        self.build(outcome, error)
    }

    /// A record for a workflow that was never executed.
    pub fn skipped(workflow: &WorkflowDefinition, agent: &str, reason: &str) -> EvidenceRecord {
        Self::start(workflow, agent).build(EvidenceOutcome::Skipped, Some(reason.to_string()))
    }

    fn build(self, outcome: EvidenceOutcome, error: Option<String>) -> EvidenceRecord {
        let ended_at = Utc::now();
        let duration_ms = (ended_at - self.started_at).num_milliseconds().max(0) as u64;
        EvidenceRecord {
            workflow_id: self.workflow_id,
            attempt_id: self.attempt_id,
            agent: self.agent,
            category: self.category,
            critical_path: self.critical_path,
            started_at: self.started_at,
            ended_at,
            failed_at: self.failed_at,
            outcome,
            passed: outcome == EvidenceOutcome::Passed,
            duration_ms,
            error,
            steps: self.steps,
            screenshot: self.screenshot,
        }
    }
}
