//! Worker status channel — one small persisted record per worker that an
//! external dashboard (or `fleetwatch status`) polls.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fsutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLayer {
    Ui,
    Api,
    Integration,
    Oversight,
}

impl WorkerLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerLayer::Ui => "ui",
            WorkerLayer::Api => "api",
            WorkerLayer::Integration => "integration",
            WorkerLayer::Oversight => "oversight",
        }
    }
}

impl std::fmt::Display for WorkerLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `initializing → (idle | monitoring) → [crashed]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Initializing,
    /// Full pass over owned workflows completed
    Idle,
    /// Executing workflows or watching for events
    Monitoring,
    Crashed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Initializing => "initializing",
            WorkerState::Idle => "idle",
            WorkerState::Monitoring => "monitoring",
            WorkerState::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub layer: WorkerLayer,
    pub state: WorkerState,
    /// Free-text detail, e.g. "3 passed, 1 failed"
    pub message: String,
    /// Workflow IDs the worker owns
    #[serde(default)]
    pub workflows: Vec<String>,
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
}

impl WorkerStatus {
    pub fn new(name: &str, layer: WorkerLayer, state: WorkerState, message: &str) -> Self {
        Self {
            name: name.to_string(),
            layer,
            state,
            message: message.to_string(),
            workflows: Vec::new(),
            pid: std::process::id(),
            updated_at: Utc::now(),
        }
    }
}

/// Where workers publish their status.
pub trait StatusChannel: Send + Sync {
    fn publish(&self, status: &WorkerStatus) -> std::io::Result<()>;
}

/// Writes `<dir>/<worker>.json`, replacing the previous status atomically.
#[derive(Debug, Clone)]
pub struct FileStatusChannel {
    dir: PathBuf,
}

impl FileStatusChannel {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, worker: &str) -> PathBuf {
        self.dir.join(format!("{}.json", worker))
    }
}

impl StatusChannel for FileStatusChannel {
    fn publish(&self, status: &WorkerStatus) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(status)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fsutil::write_atomic_blocking(&self.path_for(&status.name), &json)
    }
}

/// Process-local channel that keeps every published status.
#[derive(Debug, Default)]
pub struct MemoryStatusChannel {
    history: Mutex<Vec<WorkerStatus>>,
}

impl MemoryStatusChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<WorkerStatus> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn latest(&self) -> Option<WorkerStatus> {
        self.history().pop()
    }
}

impl StatusChannel for MemoryStatusChannel {
    fn publish(&self, status: &WorkerStatus) -> std::io::Result<()> {
        let mut history = self
            .history
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "status lock poisoned"))?;
        history.push(status.clone());
        Ok(())
    }
}

impl<T: StatusChannel + ?Sized> StatusChannel for std::sync::Arc<T> {
    fn publish(&self, status: &WorkerStatus) -> std::io::Result<()> {
        (**self).publish(status)
    }
}

/// Read every status file in `dir`, sorted by worker name.
pub fn read_all_statuses(dir: &Path) -> std::io::Result<Vec<WorkerStatus>> {
    let mut statuses = Vec::new();
    for path in crate::workflow::catalog::json_files(dir)? {
        match std::fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str::<WorkerStatus>(&c).ok())
        {
            Some(status) => statuses.push(status),
            None => tracing::warn!("[Status] Ignoring unreadable status file {}", path.display()),
        }
    }
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(statuses)
}
