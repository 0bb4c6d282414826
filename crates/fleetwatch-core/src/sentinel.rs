//! Regression sentinel — gates merges on the health of the whole catalog.
//!
//! ```text
//! watching(C) ──merge M──► validating ──0 failures──► watching(M)
//!                               └──── ≥1 failure ───► revert R ─► watching(R)
//! ```
//!
//! Non-merge commits only move the tracked head. A failed revert stops the
//! sentinel: continuing from an unknown repository state could approve or
//! revert the wrong commit.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::{StatusChannel, WorkerLayer, WorkerState, WorkerStatus};
use crate::config::FleetPaths;
use crate::evidence::{EvidenceRecord, EvidenceStore};
use crate::fleet::{launch_fleet, FleetConfig, LaunchContext};
use crate::fsutil;
use crate::git::{GitError, VersionControl};
use crate::workflow::load_catalog;

pub const SENTINEL_NAME: &str = "regression-sentinel";

#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("Revert of merge {merge} failed, sentinel halted: {source}")]
    RevertFailed {
        merge: String,
        #[source]
        source: GitError,
    },

    #[error("Suite run failed: {0}")]
    Suite(String),

    #[error("Failed to write revert record: {0}")]
    Record(String),
}

impl SentinelError {
    /// Whether the watch loop must stop. A suite that could not run is
    /// retried on the next poll; repository errors are not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SentinelError::Suite(_))
    }
}

/// Failing workflow ids from one full run of the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteOutcome {
    pub executed: usize,
    pub failed: Vec<String>,
}

/// Runs every known workflow once.
#[async_trait]
pub trait SuiteRunner: Send + Sync {
    async fn run_suite(&self) -> Result<SuiteOutcome, SentinelError>;
}

#[async_trait]
impl<T: SuiteRunner + ?Sized> SuiteRunner for Arc<T> {
    async fn run_suite(&self) -> Result<SuiteOutcome, SentinelError> {
        (**self).run_suite().await
    }
}

/// Written once per automatic revert, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRevertRecord {
    pub merge_commit: String,
    pub revert_commit: String,
    pub reason: String,
    pub failed_workflows: Vec<String>,
    pub reverted_at: DateTime<Utc>,
}

impl MergeRevertRecord {
    pub fn file_name(&self) -> String {
        let short: String = self.merge_commit.chars().take(12).collect();
        format!("{}--{}.json", self.reverted_at.format("%Y%m%dT%H%M%S%3fZ"), short)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentinelEvent {
    Unchanged,
    /// A non-merge commit; no validation
    Advanced { commit: String },
    Approved { merge: String },
    Reverted {
        merge: String,
        revert: String,
        record: PathBuf,
    },
}

pub struct RegressionSentinel<V: VersionControl, R: SuiteRunner> {
    vcs: V,
    runner: R,
    reverts_dir: PathBuf,
    status: Arc<dyn StatusChannel>,
    poll_interval: Duration,
    tracked: Option<String>,
}

impl<V: VersionControl, R: SuiteRunner> RegressionSentinel<V, R> {
    pub fn new(vcs: V, runner: R, paths: &FleetPaths, status: Arc<dyn StatusChannel>) -> Self {
        Self {
            vcs,
            runner,
            reverts_dir: paths.reverts_dir(),
            status,
            poll_interval: Duration::from_secs(30),
            tracked: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn tracked_head(&self) -> Option<&str> {
        self.tracked.as_deref()
    }

    fn publish(&self, state: WorkerState, message: &str) {
        let status = WorkerStatus::new(SENTINEL_NAME, WorkerLayer::Oversight, state, message);
        if let Err(e) = self.status.publish(&status) {
            tracing::warn!("[Sentinel] Failed to publish status: {}", e);
        }
    }

    /// Check the head once and act on a new merge.
    pub async fn poll_once(&mut self) -> Result<SentinelEvent, SentinelError> {
        let head = self.vcs.head()?;
        let Some(tracked) = self.tracked.clone() else {
            tracing::info!("[Sentinel] Watching from {}", head);
            self.publish(WorkerState::Monitoring, &format!("watching {}", head));
            self.tracked = Some(head);
            return Ok(SentinelEvent::Unchanged);
        };
        if head == tracked {
            return Ok(SentinelEvent::Unchanged);
        }

        if !self.vcs.is_merge(&head)? {
            tracing::debug!("[Sentinel] {} is not a merge, tracking it", head);
            self.tracked = Some(head.clone());
            return Ok(SentinelEvent::Advanced { commit: head });
        }

        tracing::info!("[Sentinel] Merge {} detected, running full suite", head);
        self.publish(WorkerState::Monitoring, &format!("validating merge {}", head));
        let outcome = self.runner.run_suite().await?;

        if outcome.failed.is_empty() {
            tracing::info!(
                "[Sentinel] Merge {} approved ({} workflows passed)",
                head,
                outcome.executed
            );
            self.tracked = Some(head.clone());
            self.publish(WorkerState::Monitoring, &format!("approved {}", head));
            return Ok(SentinelEvent::Approved { merge: head });
        }

        let reason = format!(
            "{} workflow(s) failed after merge: {}",
            outcome.failed.len(),
            outcome.failed.join(", ")
        );
        tracing::warn!("[Sentinel] Reverting {}: {}", head, reason);
        let revert = match self.vcs.revert_merge(&head, &reason) {
            Ok(revert) => revert,
            Err(source) => {
                let err = SentinelError::RevertFailed {
                    merge: head.clone(),
                    source,
                };
                tracing::error!("[Sentinel] {}", err);
                self.publish(WorkerState::Crashed, &err.to_string());
                return Err(err);
            }
        };
        self.tracked = Some(revert.clone());

        let record = MergeRevertRecord {
            merge_commit: head.clone(),
            revert_commit: revert.clone(),
            reason,
            failed_workflows: outcome.failed,
            reverted_at: Utc::now(),
        };
        let path = self.write_record(&record).await?;
        self.publish(
            WorkerState::Monitoring,
            &format!("reverted {} as {}", head, revert),
        );
        Ok(SentinelEvent::Reverted {
            merge: head,
            revert,
            record: path,
        })
    }

    async fn write_record(&self, record: &MergeRevertRecord) -> Result<PathBuf, SentinelError> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| SentinelError::Record(e.to_string()))?;
        let path = self.reverts_dir.join(record.file_name());
        fsutil::write_atomic_new(&path, json.as_bytes())
            .await
            .map_err(|e| SentinelError::Record(format!("{}: {}", path.display(), e)))?;
        tracing::info!("[Sentinel] Revert record written to {}", path.display());
        Ok(path)
    }

    /// Poll until cancelled or a fatal error.
    pub async fn watch(&mut self, cancel: CancellationToken) -> Result<(), SentinelError> {
        loop {
            match self.poll_once().await {
                Ok(_) => {}
                Err(e) if !e.is_fatal() => {
                    tracing::warn!("[Sentinel] {}; retrying next poll", e);
                }
                Err(e) => {
                    self.publish(WorkerState::Crashed, &e.to_string());
                    return Err(e);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    self.publish(WorkerState::Idle, "stopped");
                    tracing::info!("[Sentinel] Stopped");
                    return Ok(());
                }
            }
        }
    }
}

/// Runs the catalog by launching the test fleet and reading back the
/// evidence it produced. A known workflow without fresh evidence counts as
/// failed.
pub struct FleetSuiteRunner {
    config: FleetConfig,
    ctx: LaunchContext,
    paths: FleetPaths,
    cancel: CancellationToken,
}

impl FleetSuiteRunner {
    pub fn new(config: FleetConfig, ctx: LaunchContext, paths: FleetPaths, cancel: CancellationToken) -> Self {
        Self {
            config,
            ctx,
            paths,
            cancel,
        }
    }
}

/// Ids of catalog workflows whose newest record in `recent` did not pass.
fn failing_workflows(known: &[String], recent: Vec<EvidenceRecord>) -> Vec<String> {
    let mut latest: BTreeMap<String, bool> = BTreeMap::new();
    for record in recent {
        latest.insert(record.workflow_id, record.passed);
    }
    known
        .iter()
        .filter(|id| latest.get(*id) != Some(&true))
        .cloned()
        .collect()
}

#[async_trait]
impl SuiteRunner for FleetSuiteRunner {
    async fn run_suite(&self) -> Result<SuiteOutcome, SentinelError> {
        let started = Utc::now();
        let report = launch_fleet(&self.config, &self.ctx, self.cancel.child_token())
            .await
            .map_err(|e| SentinelError::Suite(e.to_string()))?;
        if report.terminated {
            return Err(SentinelError::Suite("suite run interrupted".to_string()));
        }

        let catalog = load_catalog(&self.paths.workflows_dir())
            .map_err(|e| SentinelError::Suite(e.to_string()))?;
        let mut known: Vec<String> = catalog.values().flatten().map(|wf| wf.id.clone()).collect();
        known.sort();
        known.dedup();

        let recent = EvidenceStore::new(self.paths.evidence_dir())
            .since(started)
            .map_err(|e| SentinelError::Suite(e.to_string()))?;
        Ok(SuiteOutcome {
            executed: known.len(),
            failed: failing_workflows(&known, recent),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MemoryStatusChannel;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// In-memory linear history. Merges are commits with two parents.
    #[derive(Default)]
    struct FakeHistory {
        parents: BTreeMap<String, Vec<String>>,
        head: String,
        reverts: Vec<(String, String)>,
        fail_revert: bool,
    }

    #[derive(Clone, Default)]
    struct FakeVcs(Arc<Mutex<FakeHistory>>);

    impl FakeVcs {
        fn new() -> Self {
            let vcs = Self::default();
            vcs.commit("c0", &[]);
            vcs
        }

        fn commit(&self, id: &str, parents: &[&str]) {
            let mut h = self.0.lock().unwrap();
            h.parents
                .insert(id.to_string(), parents.iter().map(|p| p.to_string()).collect());
            h.head = id.to_string();
        }

        fn merge(&self, id: &str) {
            let head = self.0.lock().unwrap().head.clone();
            self.commit(id, &[head.as_str(), "feature"]);
        }
    }

    impl VersionControl for FakeVcs {
        fn head(&self) -> Result<String, GitError> {
            Ok(self.0.lock().unwrap().head.clone())
        }

        fn parents(&self, commit: &str) -> Result<Vec<String>, GitError> {
            Ok(self.0.lock().unwrap().parents.get(commit).cloned().unwrap_or_default())
        }

        fn revert_merge(&self, commit: &str, _reason: &str) -> Result<String, GitError> {
            let mut h = self.0.lock().unwrap();
            if h.fail_revert {
                return Err(GitError::RevertFailed {
                    commit: commit.to_string(),
                    message: "conflict".to_string(),
                });
            }
            let id = format!("revert-{}", commit);
            h.parents.insert(id.clone(), vec![commit.to_string()]);
            h.head = id.clone();
            h.reverts.push((commit.to_string(), id.clone()));
            Ok(id)
        }
    }

    #[derive(Default)]
    struct ScriptedRunner {
        outcomes: Mutex<VecDeque<Vec<&'static str>>>,
        runs: Mutex<usize>,
    }

    impl ScriptedRunner {
        fn with(outcomes: Vec<Vec<&'static str>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                runs: Mutex::new(0),
            }
        }

        fn runs(&self) -> usize {
            *self.runs.lock().unwrap()
        }
    }

    #[async_trait]
    impl SuiteRunner for ScriptedRunner {
        async fn run_suite(&self) -> Result<SuiteOutcome, SentinelError> {
            *self.runs.lock().unwrap() += 1;
            let failed = self.outcomes.lock().unwrap().pop_front().unwrap_or_default();
            Ok(SuiteOutcome {
                executed: 3,
                failed: failed.into_iter().map(str::to_string).collect(),
            })
        }
    }

    fn sentinel(
        dir: &std::path::Path,
        vcs: FakeVcs,
        runner: Arc<ScriptedRunner>,
    ) -> (RegressionSentinel<FakeVcs, Arc<ScriptedRunner>>, Arc<MemoryStatusChannel>) {
        let status = Arc::new(MemoryStatusChannel::new());
        let paths = FleetPaths::new(dir);
        let s = RegressionSentinel::new(vcs, runner, &paths, status.clone())
            .with_poll_interval(Duration::from_millis(10));
        (s, status)
    }

    fn revert_records(dir: &std::path::Path) -> Vec<MergeRevertRecord> {
        let reverts = FleetPaths::new(dir).reverts_dir();
        let Ok(entries) = std::fs::read_dir(&reverts) else { return vec![] };
        entries
            .flatten()
            .map(|e| serde_json::from_str(&std::fs::read_to_string(e.path()).unwrap()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_non_merge_commits_are_not_validated() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = FakeVcs::new();
        let runner = Arc::new(ScriptedRunner::default());
        let (mut s, _) = sentinel(dir.path(), vcs.clone(), runner.clone());

        assert_eq!(s.poll_once().await.unwrap(), SentinelEvent::Unchanged);
        assert_eq!(s.poll_once().await.unwrap(), SentinelEvent::Unchanged);
        vcs.commit("c1", &["c0"]);
        assert_eq!(
            s.poll_once().await.unwrap(),
            SentinelEvent::Advanced { commit: "c1".into() }
        );
        assert_eq!(s.tracked_head(), Some("c1"));
        assert_eq!(runner.runs(), 0);
    }

    #[tokio::test]
    async fn test_clean_merge_is_approved() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = FakeVcs::new();
        let runner = Arc::new(ScriptedRunner::with(vec![vec![]]));
        let (mut s, _) = sentinel(dir.path(), vcs.clone(), runner.clone());
        s.poll_once().await.unwrap();

        vcs.merge("m1");
        assert_eq!(
            s.poll_once().await.unwrap(),
            SentinelEvent::Approved { merge: "m1".into() }
        );
        assert_eq!(s.tracked_head(), Some("m1"));
        assert!(vcs.0.lock().unwrap().reverts.is_empty());
        assert!(revert_records(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_regressing_merge_is_reverted_once() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = FakeVcs::new();
        let runner = Arc::new(ScriptedRunner::with(vec![vec!["wf-checkout"]]));
        let (mut s, _) = sentinel(dir.path(), vcs.clone(), runner.clone());
        s.poll_once().await.unwrap();

        vcs.merge("m1");
        let event = s.poll_once().await.unwrap();
        let SentinelEvent::Reverted { merge, revert, record } = event else {
            panic!("expected revert, got {:?}", event);
        };
        assert_eq!(merge, "m1");
        assert_eq!(revert, "revert-m1");
        assert!(record.exists());
        assert_eq!(s.tracked_head(), Some("revert-m1"));

        // The revert commit itself is not re-validated.
        assert_eq!(s.poll_once().await.unwrap(), SentinelEvent::Unchanged);
        assert_eq!(runner.runs(), 1);

        assert_eq!(vcs.0.lock().unwrap().reverts.len(), 1);
        let records = revert_records(dir.path());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].merge_commit, "m1");
        assert_eq!(records[0].revert_commit, "revert-m1");
        assert_eq!(records[0].failed_workflows, vec!["wf-checkout"]);
        assert!(records[0].reason.contains("wf-checkout"));
    }

    #[tokio::test]
    async fn test_failed_revert_halts_watch() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = FakeVcs::new();
        vcs.0.lock().unwrap().fail_revert = true;
        let runner = Arc::new(ScriptedRunner::with(vec![vec!["wf-1"]]));
        let (mut s, status) = sentinel(dir.path(), vcs.clone(), runner);
        s.poll_once().await.unwrap();
        vcs.merge("m1");

        let err = s.watch(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SentinelError::RevertFailed { .. }));
        assert!(err.is_fatal());
        assert_eq!(status.latest().unwrap().state, WorkerState::Crashed);
        assert!(revert_records(dir.path()).is_empty());
        // Still tracking the pre-merge head: nothing was approved.
        assert_eq!(s.tracked_head(), Some("c0"));
    }

    #[tokio::test]
    async fn test_watch_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let (mut s, status) = sentinel(dir.path(), FakeVcs::new(), runner);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        s.watch(cancel).await.unwrap();
        assert_eq!(status.latest().unwrap().state, WorkerState::Idle);
    }

    #[test]
    fn test_missing_evidence_counts_as_failure() {
        use crate::evidence::EvidenceRecorder;
        use crate::workflow::{WorkflowCategory, WorkflowDefinition, WorkflowStep};

        let wf = |id: &str| WorkflowDefinition {
            id: id.to_string(),
            description: String::new(),
            category: WorkflowCategory::Api,
            critical_path: false,
            expected_duration_ms: None,
            dependencies: vec![],
            steps: vec![WorkflowStep::api("probe", "GET", "/", None, "2xx")],
        };
        let mut failed_then_passed = EvidenceRecorder::start(&wf("a"), "x");
        failed_then_passed.fail("boom");
        let passed = EvidenceRecorder::start(&wf("a"), "x").finish();
        let recent = vec![failed_then_passed.finish(), passed];

        let known = vec!["a".to_string(), "b".to_string()];
        assert_eq!(failing_workflows(&known, recent), vec!["b"]);
    }

    #[tokio::test]
    async fn test_reverts_real_merge() {
        let dir = tempfile::tempdir().unwrap();
        let Some(repo) = crate::git::tests::init_repo(dir.path()) else { return };
        let state = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::with(vec![vec!["wf-1"]]));
        let paths = FleetPaths::new(state.path());
        let mut s = RegressionSentinel::new(
            repo.clone(),
            runner,
            &paths,
            Arc::new(MemoryStatusChannel::new()),
        );
        s.poll_once().await.unwrap();

        repo.run(&["checkout", "-q", "-b", "feature"]).unwrap();
        std::fs::write(dir.path().join("broken.txt"), "bad\n").unwrap();
        repo.commit_all("break things").unwrap();
        repo.checkout("main").unwrap();
        let merge = repo.merge_no_ff("feature", "Merge feature").unwrap();

        let event = s.poll_once().await.unwrap();
        assert!(matches!(event, SentinelEvent::Reverted { .. }));
        assert!(!dir.path().join("broken.txt").exists());
        assert_eq!(repo.parents(&repo.head().unwrap()).unwrap(), vec![merge]);
    }
}
