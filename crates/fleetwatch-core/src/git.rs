//! Git boundary: the only repository mutations the fleet performs are
//! revert commits, merge commits and throwaway worktrees/branches. Nothing
//! here rewrites existing history.

use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git is not available: {0}")]
    Unavailable(String),

    #[error("Not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("git {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("Revert of {commit} failed: {message}")]
    RevertFailed { commit: String, message: String },

    #[error("Merge of {branch} failed: {message}")]
    MergeFailed { branch: String, message: String },
}

/// History operations the regression sentinel needs. Implemented by
/// [`GitRepo`]; tests substitute an in-memory history.
pub trait VersionControl: Send + Sync {
    fn head(&self) -> Result<String, GitError>;

    fn parents(&self, commit: &str) -> Result<Vec<String>, GitError>;

    fn is_merge(&self, commit: &str) -> Result<bool, GitError> {
        Ok(self.parents(commit)?.len() >= 2)
    }

    /// Create a revert commit for a merge against its first parent and
    /// return the revert commit id.
    fn revert_merge(&self, commit: &str, reason: &str) -> Result<String, GitError>;
}

#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
    identity: Option<(String, String)>,
}

/// Whether a `git` executable can be run at all.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

impl GitRepo {
    /// Wrap a path without checking it.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            identity: None,
        }
    }

    /// Wrap a path, failing if it is not inside a work tree.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GitError> {
        let repo = Self::new(path);
        match repo.run(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) if out == "true" => Ok(repo),
            Ok(_) | Err(GitError::Command { .. }) => Err(GitError::NotARepository(repo.path.clone())),
            Err(e) => Err(e),
        }
    }

    /// Author/committer for commits, independent of the user's git config.
    #[cfg(test)]
    pub fn with_identity(mut self, name: &str, email: &str) -> Self {
        self.identity = Some((name.to_string(), email.to_string()));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Same identity, different work tree.
    pub fn at(&self, path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            identity: self.identity.clone(),
        }
    }

    /// Run git and return trimmed stdout.
    pub fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let mut cmd = Command::new("git");
        if let Some((name, email)) = &self.identity {
            cmd.arg("-c").arg(format!("user.name={}", name));
            cmd.arg("-c").arg(format!("user.email={}", email));
        }
        let output = cmd
            .args(args)
            .current_dir(&self.path)
            .output()
            .map_err(|e| GitError::Unavailable(e.to_string()))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Err(GitError::Command {
                command: args.first().copied().unwrap_or_default().to_string(),
                message: if stderr.is_empty() { stdout } else { stderr },
            })
        }
    }

    pub fn current_branch(&self) -> Result<String, GitError> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn subject(&self, commit: &str) -> Result<String, GitError> {
        self.run(&["log", "-1", "--format=%s", commit])
    }

    pub fn is_clean(&self) -> Result<bool, GitError> {
        Ok(self.run(&["status", "--porcelain"])?.is_empty())
    }

    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        self.run(&["branch", "-D", name]).map(|_| ())
    }

    pub fn checkout(&self, branch: &str) -> Result<(), GitError> {
        self.run(&["checkout", branch]).map(|_| ())
    }

    /// Check out a new branch `branch` from `base` into a separate
    /// directory, leaving this work tree untouched.
    pub fn worktree_add(&self, dir: &Path, branch: &str, base: &str) -> Result<GitRepo, GitError> {
        let dir_str = dir.to_string_lossy();
        self.run(&["worktree", "add", "-b", branch, &dir_str, base])?;
        Ok(self.at(dir))
    }

    pub fn worktree_remove(&self, dir: &Path) -> Result<(), GitError> {
        let dir_str = dir.to_string_lossy();
        self.run(&["worktree", "remove", "--force", &dir_str])?;
        self.run(&["worktree", "prune"]).map(|_| ())
    }

    /// Stage everything and commit. Returns the new head.
    pub fn commit_all(&self, message: &str) -> Result<String, GitError> {
        self.run(&["add", "-A"])?;
        self.run(&["commit", "-m", message])?;
        self.head()
    }

    /// Merge `branch` into the current branch with a merge commit. A
    /// conflicting merge is aborted so the work tree stays clean.
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<String, GitError> {
        match self.run(&["merge", "--no-ff", "-m", message, branch]) {
            Ok(_) => self.head(),
            Err(e) => {
                let _ = self.run(&["merge", "--abort"]);
                Err(GitError::MergeFailed {
                    branch: branch.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    pub fn merge_ff_only(&self, branch: &str) -> Result<String, GitError> {
        self.run(&["merge", "--ff-only", branch])
            .map_err(|e| GitError::MergeFailed {
                branch: branch.to_string(),
                message: e.to_string(),
            })?;
        self.head()
    }
}

impl VersionControl for GitRepo {
    fn head(&self) -> Result<String, GitError> {
        self.run(&["rev-parse", "HEAD"])
    }

    fn parents(&self, commit: &str) -> Result<Vec<String>, GitError> {
        let line = self.run(&["rev-list", "--parents", "-n", "1", commit])?;
        Ok(line.split_whitespace().skip(1).map(str::to_string).collect())
    }

    fn revert_merge(&self, commit: &str, reason: &str) -> Result<String, GitError> {
        let message = format!("Revert merge {}\n\n{}", commit, reason);
        let args: Vec<&str> = if self.is_merge(commit)? {
            vec!["revert", "--no-commit", "-m", "1", commit]
        } else {
            vec!["revert", "--no-commit", commit]
        };
        // Stage the inverse, then record it as a single commit.
        let reverted = self
            .run(&args)
            .and_then(|_| self.run(&["commit", "-m", &message]));
        if let Err(e) = reverted {
            let _ = self.run(&["revert", "--abort"]);
            return Err(GitError::RevertFailed {
                commit: commit.to_string(),
                message: e.to_string(),
            });
        }
        self.head()
    }
}
