//! File-backed artifact queue shared by healing stages.
//!
//! ```text
//! <healing>/<queue>/pending/<id>.json      enqueued, unclaimed
//! <healing>/<queue>/processing/<id>.json   claimed by one stage process
//! <healing>/<queue>/done/<id>.json         handed downstream
//! <healing>/<queue>/rejected/<id>.json     terminal, with <id>.reason.txt
//! ```
//!
//! Claiming is a `rename` from `pending/` to `processing/`, so at most one
//! process wins each artifact even when a stage runs in several processes.

use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::HealingError;
use crate::fsutil;
use crate::workflow::catalog::json_files;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Pending,
    Processing,
    Done,
    Rejected,
}

impl QueueState {
    pub const ALL: [QueueState; 4] = [
        QueueState::Pending,
        QueueState::Processing,
        QueueState::Done,
        QueueState::Rejected,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Processing => "processing",
            QueueState::Done => "done",
            QueueState::Rejected => "rejected",
        }
    }
}

/// An artifact this process owns until it completes or rejects it.
#[derive(Debug)]
pub struct Claimed<T> {
    pub id: String,
    pub artifact: T,
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactQueue<T> {
    name: String,
    root: PathBuf,
    _artifact: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> ArtifactQueue<T> {
    pub fn new(healing_dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            root: healing_dir.join(name),
            _artifact: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self, state: QueueState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    fn file(&self, state: QueueState, id: &str) -> PathBuf {
        self.dir(state).join(format!("{}.json", id))
    }

    fn io_err(&self, path: &Path, e: std::io::Error) -> HealingError {
        HealingError::Queue(format!("{} {}: {}", self.name, path.display(), e))
    }

    /// Whether `id` is known to the queue in any state.
    pub fn contains(&self, id: &str) -> bool {
        QueueState::ALL.iter().any(|s| self.file(*s, id).exists())
    }

    /// Add an artifact. Returns `false` when `id` was already enqueued.
    pub async fn enqueue(&self, id: &str, artifact: &T) -> Result<bool, HealingError> {
        if self.contains(id) {
            return Ok(false);
        }
        let json = serde_json::to_string_pretty(artifact)
            .map_err(|e| HealingError::Queue(e.to_string()))?;
        let path = self.file(QueueState::Pending, id);
        match fsutil::write_atomic_new(&path, json.as_bytes()).await {
            Ok(()) => {
                tracing::debug!("[Queue:{}] Enqueued {}", self.name, id);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(self.io_err(&path, e)),
        }
    }

    /// Claim the oldest-named pending artifact. Unreadable artifacts are
    /// moved to `rejected/` and skipped.
    pub async fn claim(&self) -> Result<Option<Claimed<T>>, HealingError> {
        let pending_dir = self.dir(QueueState::Pending);
        // A missing directory lists as empty.
        let files = json_files(&pending_dir).map_err(|e| self.io_err(&pending_dir, e))?;
        let processing_dir = self.dir(QueueState::Processing);
        tokio::fs::create_dir_all(&processing_dir)
            .await
            .map_err(|e| self.io_err(&processing_dir, e))?;

        for file in files {
            let Some(id) = file.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            let target = self.file(QueueState::Processing, &id);
            match tokio::fs::rename(&file, &target).await {
                Ok(()) => {}
                // Another process claimed it first.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(self.io_err(&file, e)),
            }
            let content = tokio::fs::read_to_string(&target)
                .await
                .map_err(|e| self.io_err(&target, e))?;
            match serde_json::from_str::<T>(&content) {
                Ok(artifact) => {
                    return Ok(Some(Claimed {
                        id,
                        artifact,
                        path: target,
                    }))
                }
                Err(e) => {
                    tracing::warn!("[Queue:{}] Unreadable artifact {}: {}", self.name, id, e);
                    self.move_to(&target, QueueState::Rejected, &id).await?;
                    self.write_reason(&id, &format!("unreadable: {}", e)).await?;
                }
            }
        }
        Ok(None)
    }

    async fn move_to(&self, from: &Path, state: QueueState, id: &str) -> Result<PathBuf, HealingError> {
        let dir = self.dir(state);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| self.io_err(&dir, e))?;
        let to = self.file(state, id);
        tokio::fs::rename(from, &to)
            .await
            .map_err(|e| self.io_err(from, e))?;
        Ok(to)
    }

    async fn write_reason(&self, id: &str, reason: &str) -> Result<(), HealingError> {
        let path = self.dir(QueueState::Rejected).join(format!("{}.reason.txt", id));
        fsutil::write_atomic(&path, reason.as_bytes())
            .await
            .map_err(|e| self.io_err(&path, e))
    }

    pub async fn complete(&self, claimed: Claimed<T>) -> Result<(), HealingError> {
        self.move_to(&claimed.path, QueueState::Done, &claimed.id).await?;
        Ok(())
    }

    /// Terminal for this artifact; `reason` is kept beside it.
    pub async fn reject(&self, claimed: Claimed<T>, reason: &str) -> Result<(), HealingError> {
        tracing::info!("[Queue:{}] Rejected {}: {}", self.name, claimed.id, reason);
        self.move_to(&claimed.path, QueueState::Rejected, &claimed.id).await?;
        self.write_reason(&claimed.id, reason).await
    }

    /// Artifacts in `state`, ordered by id.
    pub fn list(&self, state: QueueState) -> Result<Vec<T>, HealingError> {
        let dir = self.dir(state);
        let files = json_files(&dir).map_err(|e| self.io_err(&dir, e))?;
        let mut out = Vec::new();
        for file in files {
            let content = std::fs::read_to_string(&file).map_err(|e| self.io_err(&file, e))?;
            match serde_json::from_str(&content) {
                Ok(artifact) => out.push(artifact),
                Err(e) => tracing::warn!("[Queue:{}] Skipping {}: {}", self.name, file.display(), e),
            }
        }
        Ok(out)
    }

    pub fn reason(&self, id: &str) -> Option<String> {
        std::fs::read_to_string(self.dir(QueueState::Rejected).join(format!("{}.reason.txt", id))).ok()
    }

    pub fn count(&self, state: QueueState) -> usize {
        json_files(&self.dir(state)).map(|f| f.len()).unwrap_or(0)
    }
}
