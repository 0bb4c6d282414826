//! Fix generator — turns a confident drift analysis into file-scoped edits.
//!
//! Only renames are generated: the stale selector id or endpoint path is
//! replaced by the one the analysis located. Every edit's search text must
//! occur exactly once in its file; occurrences that cannot be pinned down
//! to a unique line leave that file untouched.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use super::artifacts::{Analysis, FileEdit, Patch};
use super::queue::ArtifactQueue;
use super::{queues, HealingError, HealingStage};
use crate::config::FleetPaths;

pub struct FixGenerator {
    analyses: ArtifactQueue<Analysis>,
    patches: ArtifactQueue<Patch>,
    repo_root: PathBuf,
    targets: Vec<PathBuf>,
}

/// Edits renaming `old` to `new` in one file's content.
pub fn rename_edits(path: &Path, content: &str, old: &str, new: &str) -> Vec<FileEdit> {
    match content.matches(old).count() {
        0 => vec![],
        1 => vec![FileEdit {
            path: path.to_path_buf(),
            search: old.to_string(),
            replace: new.to_string(),
        }],
        _ => {
            let mut edits = Vec::new();
            for line in content.lines().filter(|l| l.contains(old)) {
                if content.matches(line).count() != 1 {
                    tracing::debug!(
                        "[Heal:fix] {} has repeated line containing '{}', skipping file",
                        path.display(),
                        old
                    );
                    return vec![];
                }
                edits.push(FileEdit {
                    path: path.to_path_buf(),
                    search: line.to_string(),
                    replace: line.replace(old, new),
                });
            }
            edits
        }
    }
}

impl FixGenerator {
    pub fn new(paths: &FleetPaths, repo_root: &Path, targets: Vec<PathBuf>) -> Self {
        let healing = paths.healing_dir();
        Self {
            analyses: ArtifactQueue::new(&healing, queues::ANALYSES),
            patches: ArtifactQueue::new(&healing, queues::PATCHES),
            repo_root: repo_root.to_path_buf(),
            targets,
        }
    }

    /// Build a patch, or say why none can be built.
    pub fn generate(&self, analysis: &Analysis) -> Result<Patch, String> {
        if analysis.needs_review {
            return Err("analysis requires human review".to_string());
        }
        let Some((old, new)) = analysis.cause.rename() else {
            return Err(format!("no automatic fix for {}", analysis.cause.label()));
        };

        let mut edits = Vec::new();
        for target in &self.targets {
            let content = match std::fs::read_to_string(self.repo_root.join(target)) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("[Heal:fix] Cannot read {}: {}", target.display(), e);
                    continue;
                }
            };
            edits.extend(rename_edits(target, &content, &old, &new));
        }
        if edits.is_empty() {
            return Err(format!("no patchable location for '{}'", old));
        }

        let preview = edits.iter().map(FileEdit::preview).collect::<Vec<_>>().join("");
        Ok(Patch {
            id: analysis.id.clone(),
            analysis_id: analysis.id.clone(),
            workflow_id: analysis.ticket.workflow_id.clone(),
            description: format!("{}: {} → {}", analysis.cause.label(), old, new),
            edits,
            preview,
            created_at: Utc::now(),
        })
    }
}

#[async_trait]
impl HealingStage for FixGenerator {
    fn name(&self) -> &'static str {
        "fix-generator"
    }

    async fn run_once(&mut self) -> Result<usize, HealingError> {
        let mut handled = 0;
        while let Some(claimed) = self.analyses.claim().await? {
            match self.generate(&claimed.artifact) {
                Ok(patch) => {
                    tracing::info!(
                        "[Heal:fix] Patch for {} touches {} file(s)",
                        patch.workflow_id,
                        patch.files().len()
                    );
                    self.patches.enqueue(&patch.id, &patch).await?;
                    self.analyses.complete(claimed).await?;
                }
                Err(reason) => self.analyses.reject(claimed, &reason).await?,
            }
            handled += 1;
        }
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healing::{FailureTicket, QueueState, RootCause};
    use crate::workflow::WorkflowCategory;

    fn analysis(cause: RootCause, needs_review: bool) -> Analysis {
        Analysis {
            id: "ui-quote--20260101T000000000Z".to_string(),
            ticket: FailureTicket {
                id: "ui-quote--20260101T000000000Z".to_string(),
                workflow_id: "ui-quote".to_string(),
                agent: "ui-agent".to_string(),
                category: WorkflowCategory::Ui,
                evidence: PathBuf::from("e.json"),
                failed_step: None,
                error: None,
                detected_at: Utc::now(),
            },
            cause,
            hypothesis: String::new(),
            confidence: if needs_review { 0.2 } else { 0.85 },
            needs_review,
            analyzed_at: Utc::now(),
        }
    }

    fn drift() -> RootCause {
        RootCause::SelectorDrift {
            selector: "#calc-btn".into(),
            replacement: Some("#calculate-btn".into()),
        }
    }

    #[test]
    fn test_rename_edits_pins_lines() {
        let path = Path::new("app.js");
        assert!(rename_edits(path, "nothing", "calc-btn", "x").is_empty());
        let single = rename_edits(path, "$('#calc-btn')", "calc-btn", "calculate-btn");
        assert_eq!(single[0].search, "calc-btn");

        let content = "a('calc-btn');\nb('calc-btn');\n";
        let edits = rename_edits(path, content, "calc-btn", "calculate-btn");
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[1].replace, "b('calculate-btn');");

        let repeated = "a('calc-btn');\na('calc-btn');\n";
        assert!(rename_edits(path, repeated, "calc-btn", "calculate-btn").is_empty());
    }

    #[tokio::test]
    async fn test_generates_patch_or_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(repo.join("frontend")).unwrap();
        std::fs::write(repo.join("frontend/app.js"), "document.querySelector('#calc-btn');\n").unwrap();
        let paths = FleetPaths::new(dir.path().join("state"));

        let analyses: ArtifactQueue<Analysis> = ArtifactQueue::new(&paths.healing_dir(), queues::ANALYSES);
        let a = analysis(drift(), false);
        analyses.enqueue(&a.id, &a).await.unwrap();
        let mut b = analysis(RootCause::Timeout, false);
        b.id = "other".to_string();
        analyses.enqueue(&b.id, &b).await.unwrap();

        let mut fix = FixGenerator::new(&paths, &repo, vec![PathBuf::from("frontend/app.js")]);
        assert_eq!(fix.run_once().await.unwrap(), 2);

        let patches: ArtifactQueue<Patch> = ArtifactQueue::new(&paths.healing_dir(), queues::PATCHES);
        let pending = patches.list(QueueState::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].edits[0].replace, "calculate-btn");
        assert!(pending[0].preview.contains("+++ b/frontend/app.js"));
        assert!(analyses.reason("other").unwrap().contains("no automatic fix"));
    }

    #[test]
    fn test_review_analysis_never_patched() {
        let dir = tempfile::tempdir().unwrap();
        let fix = FixGenerator::new(&FleetPaths::new(dir.path()), dir.path(), vec![]);
        assert!(fix.generate(&analysis(drift(), true)).is_err());
    }
}
