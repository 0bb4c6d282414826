//! Worker runtime — the lifecycle every worker shares.
//!
//! ```text
//! created ─► initializing ─► monitoring ─► idle
//!                 │               │
//!                 └──► crashed ◄──┘
//! ```
//!
//! [`AgentRuntime`] loads the workflows the worker owns, runs them one at a
//! time in load order and persists one evidence record per attempt. An
//! [`Agent`] supplies only the step interpreter and its resources.
//!
//! Isolation rules:
//! - a failing step ends its workflow (later steps are not run);
//! - a failing workflow never stops the remaining workflows;
//! - a failing `initialize` is fatal to the worker.

pub mod browser;
pub mod cdp;
pub mod http;
pub mod status;
pub mod validators;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::config::FleetPaths;
use crate::evidence::{EvidenceOutcome, EvidenceRecorder, EvidenceStore, StepEvidence};
use crate::workflow::{load_agent_workflows, WorkflowDefinition, WorkflowStep};

pub use browser::{BrowserAgent, BrowserConfig, UiAction};
pub use http::HttpAgent;
pub use status::{
    read_all_statuses, FileStatusChannel, MemoryStatusChannel, StatusChannel, WorkerLayer,
    WorkerState, WorkerStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("[{agent}] initialization failed: {message}")]
    Init { agent: String, message: String },

    #[error("[{agent}] failed to load workflows: {message}")]
    Load { agent: String, message: String },

    #[error("[{agent}] {message}")]
    Fatal { agent: String, message: String },
}

/// A worker specialization: owns its external resources and interprets
/// steps. Step errors are returned as failed [`StepEvidence`], never raised.
#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &str;

    fn layer(&self) -> WorkerLayer;

    /// Acquire worker-local resources. Called once.
    async fn initialize(&mut self) -> Result<(), AgentError>;

    /// Execute one step. `index` is 1-based.
    async fn run_step(
        &mut self,
        workflow: &WorkflowDefinition,
        index: usize,
        step: &WorkflowStep,
    ) -> StepEvidence;

    /// Best-effort hook after a failing step, e.g. a screenshot. Returns
    /// the artifact to attach to the evidence record.
    async fn capture_failure(
        &mut self,
        _workflow: &WorkflowDefinition,
        _index: usize,
    ) -> Option<PathBuf> {
        None
    }

    /// Pause between consecutive steps.
    fn step_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Release resources. May be called more than once.
    async fn shutdown(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only run owned workflows whose latest evidence did not pass
    pub failed_only: bool,
}

/// What `execute_workflow` reports. Always produced, never an error.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub passed: bool,
    pub outcome: EvidenceOutcome,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub evidence: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub results: Vec<WorkflowResult>,
    /// Invalid workflow files skipped at load time
    pub invalid_files: usize,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    pub fn count(&self, outcome: EvidenceOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    /// True when every executed workflow passed and nothing was cut short.
    pub fn all_passed(&self) -> bool {
        !self.interrupted && self.results.iter().all(|r| r.passed)
    }

    pub fn describe(&self) -> String {
        let mut parts = vec![
            format!("{} passed", self.passed()),
            format!("{} failed", self.count(EvidenceOutcome::Failed)),
        ];
        let skipped = self.count(EvidenceOutcome::Skipped);
        if skipped > 0 {
            parts.push(format!("{} skipped", skipped));
        }
        if self.interrupted {
            parts.push("interrupted".to_string());
        }
        parts.join(", ")
    }
}

pub struct AgentRuntime<A: Agent> {
    agent: A,
    paths: FleetPaths,
    store: EvidenceStore,
    status: Arc<dyn StatusChannel>,
    cancel: CancellationToken,
    options: RunOptions,
    state: WorkerState,
    owned: Vec<String>,
    initialized: bool,
    shut_down: bool,
}

impl<A: Agent> AgentRuntime<A> {
    pub fn new(
        agent: A,
        paths: FleetPaths,
        status: Arc<dyn StatusChannel>,
        cancel: CancellationToken,
    ) -> Self {
        let store = EvidenceStore::new(paths.evidence_dir());
        Self {
            agent,
            paths,
            store,
            status,
            cancel,
            options: RunOptions::default(),
            state: WorkerState::Initializing,
            owned: Vec::new(),
            initialized: false,
            shut_down: false,
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn evidence_store(&self) -> &EvidenceStore {
        &self.store
    }

    /// Publish the worker's current state. Channel failures are logged and
    /// never interrupt the run.
    pub fn update_status(&mut self, state: WorkerState, message: &str) {
        self.state = state;
        let mut status = WorkerStatus::new(self.agent.name(), self.agent.layer(), state, message);
        status.workflows = self.owned.clone();
        if let Err(e) = self.status.publish(&status) {
            tracing::warn!("[Agent:{}] Failed to publish status: {}", self.agent.name(), e);
        }
        tracing::info!("[Agent:{}] {}: {}", self.agent.name(), state, message);
    }

    pub async fn initialize(&mut self) -> Result<(), AgentError> {
        if self.initialized {
            return Ok(());
        }
        self.update_status(WorkerState::Initializing, "initializing");
        let name = self.agent.name().to_string();
        let prepared = self.paths.ensure().map_err(|e| AgentError::Init {
            agent: name.clone(),
            message: format!("state directory {}: {}", self.paths.root().display(), e),
        });
        let result = match prepared {
            Ok(()) => self.agent.initialize().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.update_status(WorkerState::Crashed, &e.to_string());
            return Err(e);
        }
        self.initialized = true;
        Ok(())
    }

    /// Load and run every owned workflow exactly once, sequentially.
    pub async fn run_all_workflows(&mut self) -> Result<RunSummary, AgentError> {
        let name = self.agent.name().to_string();
        let loaded = match load_agent_workflows(&self.paths.workflows_dir(), &name) {
            Ok(loaded) => loaded,
            Err(e) => {
                let err = AgentError::Load {
                    agent: name,
                    message: e.to_string(),
                };
                self.update_status(WorkerState::Crashed, &err.to_string());
                return Err(err);
            }
        };

        let latest = self.store.latest_per_workflow().unwrap_or_else(|e| {
            tracing::warn!("[Agent:{}] Could not read prior evidence: {}", name, e);
            Default::default()
        });

        let mut workflows = loaded.workflows;
        if self.options.failed_only {
            workflows.retain(|wf| latest.get(&wf.id).map(|r| !r.passed).unwrap_or(false));
        }
        self.owned = workflows.iter().map(|wf| wf.id.clone()).collect();

        let mut summary = RunSummary {
            invalid_files: loaded.skipped.len(),
            ..Default::default()
        };
        self.update_status(
            WorkerState::Monitoring,
            &format!("running {} workflow(s)", workflows.len()),
        );

        let mut passed_this_run: HashMap<String, bool> = HashMap::new();
        for workflow in &workflows {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }

            let blocking = workflow.dependencies.iter().find(|dep| {
                let passed = passed_this_run
                    .get(*dep)
                    .copied()
                    .or_else(|| latest.get(*dep).map(|r| r.passed));
                passed != Some(true)
            });

            let result = match blocking {
                Some(dep) => {
                    let reason = format!("dependency '{}' has not passed", dep);
                    self.record_skip(workflow, &reason).await
                }
                None => self.execute_workflow(workflow).await,
            };
            if result.outcome == EvidenceOutcome::Interrupted {
                summary.interrupted = true;
            }
            passed_this_run.insert(workflow.id.clone(), result.passed);
            summary.results.push(result);
        }

        let state = if summary.interrupted {
            WorkerState::Monitoring
        } else {
            WorkerState::Idle
        };
        self.update_status(state, &summary.describe());
        Ok(summary)
    }

    async fn record_skip(&mut self, workflow: &WorkflowDefinition, reason: &str) -> WorkflowResult {
        tracing::warn!(
            "[Agent:{}] Skipping {}: {}",
            self.agent.name(),
            workflow.id,
            reason
        );
        let record = EvidenceRecorder::skipped(workflow, self.agent.name(), reason);
        let evidence = match self.store.persist(&record).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!("[Agent:{}] Failed to persist evidence: {}", self.agent.name(), e);
                None
            }
        };
        WorkflowResult {
            workflow_id: workflow.id.clone(),
            passed: false,
            outcome: EvidenceOutcome::Skipped,
            duration_ms: 0,
            error: Some(reason.to_string()),
            evidence,
        }
    }

    /// Run one workflow, fail-fast on the first failing step, and persist
    /// its evidence. Never returns an error: panics and step errors become
    /// a failed result.
    pub async fn execute_workflow(&mut self, workflow: &WorkflowDefinition) -> WorkflowResult {
        let name = self.agent.name().to_string();
        tracing::info!("[Agent:{}] ▶ {} ({} steps)", name, workflow.id, workflow.steps.len());
        let mut recorder = EvidenceRecorder::start(workflow, &name);

        for (i, step) in workflow.steps.iter().enumerate() {
            let index = i + 1;
            if self.cancel.is_cancelled() {
                recorder.interrupt();
                break;
            }

            let started = Instant::now();
            let outcome = AssertUnwindSafe(self.agent.run_step(workflow, index, step))
                .catch_unwind()
                .await;
            let evidence = match outcome {
                Ok(evidence) => evidence,
                Err(panic) => StepEvidence {
                    index,
                    action: step.action.clone(),
                    target: step.kind.target(),
                    success: false,
                    response: None,
                    error: Some(format!("step panicked: {}", panic_message(&panic))),
                    validation: vec![],
                    duration_ms: started.elapsed().as_millis() as u64,
                },
            };

            let success = evidence.success;
            recorder.push_step(evidence);
            if !success {
                if let Some(path) = self.agent.capture_failure(workflow, index).await {
                    recorder.attach_screenshot(path);
                }
                break;
            }

            let delay = self.agent.step_delay();
            if index < workflow.steps.len() && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        let record = recorder.finish();
        let evidence = match self.store.persist(&record).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!("[Agent:{}] Failed to persist evidence for {}: {}", name, workflow.id, e);
                None
            }
        };
        match record.outcome {
            EvidenceOutcome::Passed => {
                tracing::info!("[Agent:{}] ✓ {} ({}ms)", name, workflow.id, record.duration_ms)
            }
            _ => tracing::warn!(
                "[Agent:{}] ✗ {} {}: {}",
                name,
                workflow.id,
                record.outcome,
                record.error.as_deref().unwrap_or("")
            ),
        }
        WorkflowResult {
            workflow_id: workflow.id.clone(),
            passed: record.passed,
            outcome: record.outcome,
            duration_ms: record.duration_ms,
            error: record.error.clone(),
            evidence,
        }
    }

    /// Release the agent's resources. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.agent.shutdown().await;
        tracing::info!("[Agent:{}] Shut down", self.agent.name());
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Full worker lifecycle: initialize, one pass over owned workflows,
/// shutdown. Shutdown runs on every path, including a failed initialize.
pub async fn run_worker<A: Agent>(
    agent: A,
    paths: FleetPaths,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<RunSummary, AgentError> {
    let status: Arc<dyn StatusChannel> = Arc::new(FileStatusChannel::new(paths.status_dir()));
    let mut runtime = AgentRuntime::new(agent, paths, status, cancel).with_options(options);

    if let Err(e) = runtime.initialize().await {
        runtime.shutdown().await;
        return Err(e);
    }
    let summary = runtime.run_all_workflows().await;
    runtime.shutdown().await;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{write_catalog, Catalog, WorkflowCategory};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted agent: steps whose action is "fail" fail, "panic" panics,
    /// "cancel" trips the token then succeeds.
    struct ScriptedAgent {
        cancel: CancellationToken,
        steps_run: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        fail_init: bool,
    }

    impl ScriptedAgent {
        fn new(cancel: CancellationToken) -> Self {
            Self {
                cancel,
                steps_run: Arc::new(AtomicUsize::new(0)),
                shutdowns: Arc::new(AtomicUsize::new(0)),
                fail_init: false,
            }
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn name(&self) -> &str {
            "api-agent"
        }

        fn layer(&self) -> WorkerLayer {
            WorkerLayer::Api
        }

        async fn initialize(&mut self) -> Result<(), AgentError> {
            if self.fail_init {
                return Err(AgentError::Init {
                    agent: "api-agent".to_string(),
                    message: "no browser".to_string(),
                });
            }
            Ok(())
        }

        async fn run_step(
            &mut self,
            _workflow: &WorkflowDefinition,
            index: usize,
            step: &WorkflowStep,
        ) -> StepEvidence {
            self.steps_run.fetch_add(1, Ordering::SeqCst);
            if step.action == "panic" {
                panic!("interpreter bug");
            }
            if step.action == "cancel" {
                self.cancel.cancel();
            }
            let success = step.action != "fail";
            StepEvidence {
                index,
                action: step.action.clone(),
                target: step.kind.target(),
                success,
                response: None,
                error: (!success).then(|| "HTTP 500: boom".to_string()),
                validation: vec![],
                duration_ms: 0,
            }
        }

        async fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn workflow(id: &str, actions: &[&str], deps: &[&str]) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            description: String::new(),
            category: WorkflowCategory::Api,
            critical_path: false,
            expected_duration_ms: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            steps: actions
                .iter()
                .map(|a| WorkflowStep::api(a, "GET", "/x", None, "2xx"))
                .collect(),
        }
    }

    async fn setup(workflows: Vec<WorkflowDefinition>) -> (tempfile::TempDir, FleetPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = FleetPaths::new(dir.path());
        let mut catalog = Catalog::new();
        catalog.insert("api-agent".to_string(), workflows);
        write_catalog(&paths.workflows_dir(), &catalog).await.unwrap();
        (dir, paths)
    }

    fn runtime(
        agent: ScriptedAgent,
        paths: &FleetPaths,
        cancel: CancellationToken,
    ) -> (AgentRuntime<ScriptedAgent>, Arc<MemoryStatusChannel>) {
        let channel = Arc::new(MemoryStatusChannel::new());
        let rt = AgentRuntime::new(agent, paths.clone(), channel.clone(), cancel);
        (rt, channel)
    }

    #[tokio::test]
    async fn test_fail_fast_records_k_steps() {
        let (_dir, paths) = setup(vec![workflow("wf-three", &["ok", "fail", "ok"], &[])]).await;
        let cancel = CancellationToken::new();
        let (mut rt, _) = runtime(ScriptedAgent::new(cancel.clone()), &paths, cancel);
        rt.initialize().await.unwrap();
        let summary = rt.run_all_workflows().await.unwrap();

        assert_eq!(summary.results.len(), 1);
        assert!(!summary.results[0].passed);
        let record = rt
            .evidence_store()
            .load(summary.results[0].evidence.as_ref().unwrap())
            .unwrap();
        assert_eq!(record.steps.len(), 2);
        assert!(!record.steps[1].success);
        assert!(!record.passed);
    }

    #[tokio::test]
    async fn test_workflow_failure_does_not_stop_others() {
        let (_dir, paths) = setup(vec![
            workflow("a-fails", &["fail"], &[]),
            workflow("b-passes", &["ok", "ok"], &[]),
            workflow("c-panics", &["panic"], &[]),
        ])
        .await;
        let cancel = CancellationToken::new();
        let (mut rt, channel) = runtime(ScriptedAgent::new(cancel.clone()), &paths, cancel);
        rt.initialize().await.unwrap();
        let summary = rt.run_all_workflows().await.unwrap();

        let ids: Vec<_> = summary.results.iter().map(|r| r.workflow_id.as_str()).collect();
        assert_eq!(ids, vec!["a-fails", "b-passes", "c-panics"]);
        assert_eq!(summary.passed(), 1);
        assert!(summary.results[2].error.as_ref().unwrap().contains("panicked"));
        assert!(!summary.all_passed());
        assert_eq!(rt.state(), WorkerState::Idle);

        let history = channel.history();
        assert_eq!(history.first().unwrap().state, WorkerState::Initializing);
        assert_eq!(history.last().unwrap().state, WorkerState::Idle);
        assert_eq!(history.last().unwrap().workflows.len(), 3);
    }

    #[tokio::test]
    async fn test_dependency_gating_writes_skipped_record() {
        let (_dir, paths) = setup(vec![
            workflow("a-sync", &["fail"], &[]),
            workflow("b-invoice", &["ok"], &["a-sync"]),
        ])
        .await;
        let cancel = CancellationToken::new();
        let agent = ScriptedAgent::new(cancel.clone());
        let steps_run = agent.steps_run.clone();
        let (mut rt, _) = runtime(agent, &paths, cancel);
        rt.initialize().await.unwrap();
        let summary = rt.run_all_workflows().await.unwrap();

        assert_eq!(summary.results[1].outcome, EvidenceOutcome::Skipped);
        assert_eq!(steps_run.load(Ordering::SeqCst), 1);
        let latest = rt.evidence_store().latest_per_workflow().unwrap();
        assert_eq!(latest["b-invoice"].outcome, EvidenceOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_cancellation_marks_interrupted_and_stops() {
        let (_dir, paths) = setup(vec![
            workflow("a-long", &["ok", "cancel", "ok", "ok"], &[]),
            workflow("b-never", &["ok"], &[]),
        ])
        .await;
        let cancel = CancellationToken::new();
        let agent = ScriptedAgent::new(cancel.clone());
        let steps_run = agent.steps_run.clone();
        let (mut rt, _) = runtime(agent, &paths, cancel);
        rt.initialize().await.unwrap();
        let summary = rt.run_all_workflows().await.unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].outcome, EvidenceOutcome::Interrupted);
        assert_eq!(steps_run.load(Ordering::SeqCst), 2);

        // The record on disk is complete and parseable; no temp files remain.
        let records = rt.evidence_store().list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].steps.len(), 2);
        let leftovers = std::fs::read_dir(paths.evidence_dir())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_failed_only_reruns_failures() {
        let (_dir, paths) = setup(vec![
            workflow("a-fails", &["fail"], &[]),
            workflow("b-passes", &["ok"], &[]),
        ])
        .await;
        let cancel = CancellationToken::new();
        let (mut rt, _) = runtime(ScriptedAgent::new(cancel.clone()), &paths, cancel.clone());
        rt.initialize().await.unwrap();
        rt.run_all_workflows().await.unwrap();

        let (rt2, _) = runtime(ScriptedAgent::new(cancel.clone()), &paths, cancel);
        let mut rt2 = rt2.with_options(RunOptions { failed_only: true });
        rt2.initialize().await.unwrap();
        let summary = rt2.run_all_workflows().await.unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].workflow_id, "a-fails");
    }

    #[tokio::test]
    async fn test_init_failure_is_fatal() {
        let (_dir, paths) = setup(vec![workflow("a", &["ok"], &[])]).await;
        let cancel = CancellationToken::new();
        let mut agent = ScriptedAgent::new(cancel.clone());
        agent.fail_init = true;
        let shutdowns = agent.shutdowns.clone();

        let err = run_worker(agent, paths.clone(), RunOptions::default(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Init { .. }));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        let statuses = read_all_statuses(&paths.status_dir()).unwrap();
        assert_eq!(statuses[0].state, WorkerState::Crashed);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (_dir, paths) = setup(vec![workflow("a", &["ok"], &[])]).await;
        let cancel = CancellationToken::new();
        let agent = ScriptedAgent::new(cancel.clone());
        let shutdowns = agent.shutdowns.clone();
        let (mut rt, _) = runtime(agent, &paths, cancel);
        rt.shutdown().await;
        rt.shutdown().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
