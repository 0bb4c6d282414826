//! Commit agent — merges validated patches into the main line in small
//! batches.
//!
//! Each batch is assembled on its own `heal/batch-<ts>-<rand>` branch in a
//! separate worktree, then fast-forwarded into the current branch. A
//! conflict anywhere in a batch rejects the whole batch and leaves the
//! main line exactly as the previous batch left it.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;

use super::artifacts::{MergedBatch, ValidationResult};
use super::queue::{ArtifactQueue, Claimed};
use super::{queues, HealingError, HealingStage};
use crate::config::FleetPaths;
use crate::git::{GitError, GitRepo, VersionControl};

pub struct CommitAgent {
    validated: ArtifactQueue<ValidationResult>,
    merged: ArtifactQueue<MergedBatch>,
    repo: GitRepo,
    worktrees: PathBuf,
    batch_size: usize,
}

impl CommitAgent {
    pub fn new(paths: &FleetPaths, repo: GitRepo, batch_size: usize) -> Self {
        let healing = paths.healing_dir();
        Self {
            validated: ArtifactQueue::new(&healing, queues::VALIDATED),
            merged: ArtifactQueue::new(&healing, queues::MERGED),
            repo,
            worktrees: healing.join("worktrees"),
            batch_size: batch_size.max(1),
        }
    }

    /// Build the batch branch and fast-forward the main line to it.
    fn assemble(&self, batch_id: &str, branch: &str, results: &[&ValidationResult]) -> Result<String, GitError> {
        let base = self.repo.head()?;
        let dir = self.worktrees.join(batch_id);
        let _ = std::fs::create_dir_all(&self.worktrees);
        let worktree = self.repo.worktree_add(&dir, branch, &base)?;
        let merged = results.iter().try_for_each(|r| {
            worktree
                .merge_no_ff(&r.branch, &format!("Merge {} ({})", r.branch, r.patch.description))
                .map(|_| ())
        });
        if let Err(e) = self.repo.worktree_remove(&dir) {
            tracing::warn!("[Heal:commit] Could not remove worktree {}: {}", dir.display(), e);
        }
        merged?;
        self.repo.merge_ff_only(branch)
    }

    async fn merge_batch(&self, claims: Vec<Claimed<ValidationResult>>) -> Result<(), HealingError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let batch_id = format!("batch-{}-{}", Utc::now().format("%Y%m%dT%H%M%S%3f"), &suffix[..8]);
        let branch = format!("heal/{}", batch_id);
        let results: Vec<&ValidationResult> = claims.iter().map(|c| &c.artifact).collect();

        match self.assemble(&batch_id, &branch, &results) {
            Ok(head) => {
                let patches: Vec<String> = results.iter().map(|r| r.id.clone()).collect();
                for r in &results {
                    let _ = self.repo.delete_branch(&r.branch);
                }
                let _ = self.repo.delete_branch(&branch);
                tracing::info!(
                    "[Heal:commit] Merged {} ({} patch(es)), head {}",
                    batch_id,
                    patches.len(),
                    head
                );
                let record = MergedBatch {
                    id: batch_id.clone(),
                    branch,
                    patches,
                    head,
                    merged_at: Utc::now(),
                };
                self.merged.enqueue(&batch_id, &record).await?;
                for claim in claims {
                    self.validated.complete(claim).await?;
                }
            }
            Err(e) => {
                tracing::warn!("[Heal:commit] {} halted: {}", batch_id, e);
                let _ = self.repo.delete_branch(&branch);
                let reason = format!("{} halted: {}", batch_id, e);
                for claim in claims {
                    self.validated.reject(claim, &reason).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HealingStage for CommitAgent {
    fn name(&self) -> &'static str {
        "commit-agent"
    }

    async fn run_once(&mut self) -> Result<usize, HealingError> {
        let mut handled = 0;
        loop {
            let mut batch = Vec::with_capacity(self.batch_size);
            while batch.len() < self.batch_size {
                match self.validated.claim().await? {
                    Some(claimed) if claimed.artifact.passed => batch.push(claimed),
                    Some(claimed) => self.validated.reject(claimed, "not a passing validation").await?,
                    None => break,
                }
            }
            if batch.is_empty() {
                return Ok(handled);
            }
            handled += batch.len();
            self.merge_batch(batch).await?;
        }
    }
}
