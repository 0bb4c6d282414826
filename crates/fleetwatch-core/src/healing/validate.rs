//! Branch validator — applies a patch on an isolated branch in its own
//! worktree and probes the affected workflow there. The main work tree is
//! never touched.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::artifacts::{Patch, ValidationResult};
use super::queue::ArtifactQueue;
use super::{queues, HealingError, HealingStage};
use crate::config::FleetPaths;
use crate::git::{GitRepo, VersionControl};

const PROBE_OUTPUT_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub passed: bool,
    pub detail: String,
}

/// Re-runs one workflow against a checked-out tree.
#[async_trait]
pub trait WorkflowProbe: Send + Sync {
    async fn probe(&self, worktree: &Path, workflow_id: &str) -> Result<ProbeOutcome, HealingError>;
}

/// Runs a configured command inside the worktree. Exit status 0 passes.
pub struct CommandProbe {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl WorkflowProbe for CommandProbe {
    async fn probe(&self, worktree: &Path, workflow_id: &str) -> Result<ProbeOutcome, HealingError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| HealingError::Probe("no probe command configured".to_string()))?;
        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(worktree)
            .env("FLEET_WORKFLOW_ID", workflow_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HealingError::Probe(format!("{}: {}", program, e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| HealingError::Probe(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| HealingError::Probe(e.to_string()))?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        // Keep the end of the output; failures print their reason last.
        let tail: String = {
            let chars: Vec<char> = text.trim().chars().collect();
            let start = chars.len().saturating_sub(PROBE_OUTPUT_LIMIT);
            chars[start..].iter().collect()
        };
        Ok(ProbeOutcome {
            passed: output.status.success(),
            detail: format!("exit {:?}: {}", output.status.code(), tail),
        })
    }
}

pub struct BranchValidator<P: WorkflowProbe> {
    patches: ArtifactQueue<Patch>,
    validated: ArtifactQueue<ValidationResult>,
    repo: GitRepo,
    worktrees: PathBuf,
    probe: P,
}

impl<P: WorkflowProbe> BranchValidator<P> {
    pub fn new(paths: &FleetPaths, repo: GitRepo, probe: P) -> Self {
        let healing = paths.healing_dir();
        Self {
            patches: ArtifactQueue::new(&healing, queues::PATCHES),
            validated: ArtifactQueue::new(&healing, queues::VALIDATED),
            repo,
            worktrees: healing.join("worktrees"),
            probe,
        }
    }

    /// Commit the patch on `heal/<id>` and probe it. The branch is kept
    /// only when the probe passes.
    pub async fn validate(&self, patch: &Patch) -> Result<ValidationResult, HealingError> {
        let base = self.repo.head()?;
        let branch = patch.branch_name();
        let dir = self.worktrees.join(&patch.id);
        if dir.exists() {
            let _ = self.repo.worktree_remove(&dir);
            let _ = std::fs::remove_dir_all(&dir);
        }
        // Leftover from an interrupted attempt.
        let _ = self.repo.delete_branch(&branch);
        std::fs::create_dir_all(&self.worktrees)
            .map_err(|e| HealingError::Io(format!("{}: {}", self.worktrees.display(), e)))?;

        let worktree = self.repo.worktree_add(&dir, &branch, &base)?;
        let attempt = self.apply_and_probe(&worktree, patch).await;
        if let Err(e) = self.repo.worktree_remove(&dir) {
            tracing::warn!("[Heal:validate] Could not remove worktree {}: {}", dir.display(), e);
        }

        let passed = matches!(&attempt, Ok((_, outcome)) if outcome.passed);
        if !passed {
            let _ = self.repo.delete_branch(&branch);
        }
        let (commit, outcome) = attempt?;
        Ok(ValidationResult {
            id: patch.id.clone(),
            patch: patch.clone(),
            branch,
            commit,
            passed: outcome.passed,
            detail: outcome.detail,
            validated_at: Utc::now(),
        })
    }

    async fn apply_and_probe(
        &self,
        worktree: &GitRepo,
        patch: &Patch,
    ) -> Result<(String, ProbeOutcome), HealingError> {
        for edit in &patch.edits {
            edit.apply(worktree.path())?;
        }
        let commit = worktree.commit_all(&format!("heal({}): {}", patch.workflow_id, patch.description))?;
        let outcome = self.probe.probe(worktree.path(), &patch.workflow_id).await?;
        Ok((commit, outcome))
    }
}

#[async_trait]
impl<P: WorkflowProbe> HealingStage for BranchValidator<P> {
    fn name(&self) -> &'static str {
        "branch-validator"
    }

    async fn run_once(&mut self) -> Result<usize, HealingError> {
        let mut handled = 0;
        while let Some(claimed) = self.patches.claim().await? {
            match self.validate(&claimed.artifact).await {
                Ok(result) if result.passed => {
                    tracing::info!("[Heal:validate] {} passed on {}", result.id, result.branch);
                    self.validated.enqueue(&result.id, &result).await?;
                    self.patches.complete(claimed).await?;
                }
                Ok(result) => {
                    let reason = format!("validation failed: {}", result.detail);
                    self.patches.reject(claimed, &reason).await?;
                }
                Err(e) => {
                    let reason = format!("could not validate: {}", e);
                    self.patches.reject(claimed, &reason).await?;
                }
            }
            handled += 1;
        }
        Ok(handled)
    }
}
