//! Orchestrator — runs the stages in pipeline order and closes the loop by
//! re-testing after every merged batch. The re-test writes fresh evidence,
//! which the coordinator picks up on the next cycle.
//!
//! [`RetestStage`] is the loop-closing step on its own, so a fleet that runs
//! one stage per process still consumes the merged queue.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::analysis::AnalysisStage;
use super::artifacts::MergedBatch;
use super::commit::CommitAgent;
use super::coordinator::Coordinator;
use super::fix::FixGenerator;
use super::queue::ArtifactQueue;
use super::validate::{BranchValidator, WorkflowProbe};
use super::{queues, HealingConfig, HealingError, HealingStage};
use crate::config::FleetPaths;
use crate::git::GitRepo;
use crate::sentinel::SuiteRunner;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Artifacts handled per stage, in pipeline order
    pub stages: Vec<(&'static str, usize)>,
    pub retests: usize,
}

impl CycleReport {
    pub fn handled(&self) -> usize {
        self.stages.iter().map(|(_, n)| n).sum()
    }
}

/// Consumes merged batches and re-runs the test suite once per batch.
pub struct RetestStage {
    merged: ArtifactQueue<MergedBatch>,
    runner: Box<dyn SuiteRunner>,
}

impl RetestStage {
    pub fn new(paths: &FleetPaths, runner: Box<dyn SuiteRunner>) -> Self {
        Self {
            merged: ArtifactQueue::new(&paths.healing_dir(), queues::MERGED),
            runner,
        }
    }
}

#[async_trait]
impl HealingStage for RetestStage {
    fn name(&self) -> &'static str {
        "retest"
    }

    async fn run_once(&mut self) -> Result<usize, HealingError> {
        let mut handled = 0;
        report.retests = self.retest.run_once().await?;
        Ok(report)
    }

    /// Cycle until cancelled.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), HealingError> {
        loop {
            let report = self.run_cycle().await?;
            if report.handled() > 0 || report.retests > 0 {
                tracing::info!(
                    "[Heal:orchestrator] Cycle: {:?}, {} re-test(s)",
                    report.stages,
                    report.retests
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceRecorder, EvidenceStore, StepEvidence};
    use crate::git::tests::init_repo;
    use crate::healing::{Analysis, ProbeOutcome, QueueState};
    use crate::sentinel::{SentinelError, SuiteOutcome};
    use crate::workflow::{DiscoveryConfig, WorkflowCategory, WorkflowDefinition, WorkflowStep};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FileProbe;

    #[async_trait]
    impl WorkflowProbe for FileProbe {
        async fn probe(&self, worktree: &Path, _workflow_id: &str) -> Result<ProbeOutcome, HealingError> {
            let js = std::fs::read_to_string(worktree.join("frontend/app.js")).unwrap_or_default();
            Ok(ProbeOutcome {
                passed: js.contains("#calculate-btn"),
                detail: String::new(),
            })
        }
    }

    struct CountingRunner(Arc<AtomicUsize>);

    #[async_trait]
    impl SuiteRunner for CountingRunner {
        async fn run_suite(&self) -> Result<SuiteOutcome, SentinelError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(SuiteOutcome::default())
        }
    }

    fn ui_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "ui-calculate".to_string(),
            description: String::new(),
            category: WorkflowCategory::Ui,
            critical_path: true,
            expected_duration_ms: None,
            dependencies: vec![],
            steps: vec![WorkflowStep::ui("click", "#calculate-button", None, "total shown")],
        }
    }

    fn failed_click(selector: &str) -> StepEvidence {
        StepEvidence {
            index: 1,
            action: "click".to_string(),
            target: selector.to_string(),
            success: false,
            response: None,
            error: Some(format!("selector not found: {}", selector)),
            validation: vec![],
            duration_ms: 3,
        }
    }

    #[tokio::test]
    async fn test_selector_drift_is_healed_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let Some(repo) = init_repo(dir.path()) else { return };
        std::fs::create_dir_all(dir.path().join("frontend")).unwrap();
        std::fs::write(
            dir.path().join("frontend/index.html"),
            "<button id=\"calculate-btn\">Calculate</button>\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("frontend/app.js"),
            "document.querySelector('#calculate-button').addEventListener('click', run);\n",
        )
        .unwrap();
        repo.commit_all("frontend").unwrap();

        let state = tempfile::tempdir().unwrap();
        let paths = FleetPaths::new(state.path());
        let mut recorder = EvidenceRecorder::start(&ui_workflow(), "ui-agent");
        recorder.push_step(failed_click("#calculate-button"));
        EvidenceStore::new(paths.evidence_dir())
            .persist(&recorder.finish())
            .await
            .unwrap();

        let config = HealingConfig {
            discovery: DiscoveryConfig {
                ui_source: Some(PathBuf::from("frontend/index.html")),
                ..DiscoveryConfig::default()
            },
            patch_targets: vec![PathBuf::from("frontend/app.js")],
            ..HealingConfig::default()
        };
        let retests = Arc::new(AtomicUsize::new(0));
        let mut orchestrator = HealingOrchestrator::standard(
            &paths,
            repo.clone(),
            &config,
            FileProbe,
            Box::new(CountingRunner(retests.clone())),
        );

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.retests, 1);
        assert_eq!(retests.load(Ordering::SeqCst), 1);

        let js = std::fs::read_to_string(dir.path().join("frontend/app.js")).unwrap();
        assert!(js.contains("'#calculate-btn'"));
        assert!(repo.is_clean().unwrap());

        // Nothing new on the next cycle.
        let again = orchestrator.run_cycle().await.unwrap();
        assert_eq!(again.handled(), 0);
        assert_eq!(again.retests, 0);
    }

    #[tokio::test]
    async fn test_retest_stage_drains_merged_queue() {
        let state = tempfile::tempdir().unwrap();
        let paths = FleetPaths::new(state.path());
        let merged: ArtifactQueue<MergedBatch> = ArtifactQueue::new(&paths.healing_dir(), queues::MERGED);
        for id in ["batch-1", "batch-2"] {
            let batch = MergedBatch {
                id: id.to_string(),
                branch: "main".to_string(),
                patches: vec![],
                head: "abc123".to_string(),
                merged_at: chrono::Utc::now(),
            };
            merged.enqueue(id, &batch).await.unwrap();
        }

        let runs = Arc::new(AtomicUsize::new(0));
        let mut stage = RetestStage::new(&paths, Box::new(CountingRunner(runs.clone())));
        assert_eq!(stage.name(), "retest");
        assert_eq!(stage.run_once().await.unwrap(), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(merged.count(QueueState::Pending), 0);
        assert_eq!(merged.count(QueueState::Done), 2);

        assert_eq!(stage.run_once().await.unwrap(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unexplained_failure_stops_at_review() {
        let state = tempfile::tempdir().unwrap();
        let paths = FleetPaths::new(state.path());
        let mut recorder = EvidenceRecorder::start(&ui_workflow(), "ui-agent");
        let mut step = failed_click("#calculate-button");
        step.error = Some("total mismatch: expected 1200, got 0".to_string());
        recorder.push_step(step);
        EvidenceStore::new(paths.evidence_dir())
            .persist(&recorder.finish())
            .await
            .unwrap();

        let stages: Vec<Box<dyn HealingStage>> = vec![
            Box::new(Coordinator::new(&paths)),
            Box::new(AnalysisStage::new(&paths, DiscoveryConfig::default(), 0.7)),
            Box::new(FixGenerator::new(&paths, state.path(), vec![])),
        ];
        let retests = Arc::new(AtomicUsize::new(0));
        let mut orchestrator =
            HealingOrchestrator::new(stages, &paths, Box::new(CountingRunner(retests.clone())));
        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.stages[0], ("coordinator", 1));
        assert_eq!(report.stages[2], ("fix-generator", 0));

        let review: ArtifactQueue<Analysis> = ArtifactQueue::new(&paths.healing_dir(), queues::REVIEW);
        let flagged = review.list(QueueState::Pending).unwrap();
        assert_eq!(flagged.len(), 1);
        assert!(flagged[0].needs_review);
        let patches: ArtifactQueue<crate::healing::Patch> =
            ArtifactQueue::new(&paths.healing_dir(), queues::PATCHES);
        assert_eq!(patches.count(QueueState::Pending), 0);
        assert_eq!(retests.load(Ordering::SeqCst), 0);
    }
}
