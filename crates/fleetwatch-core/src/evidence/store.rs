//! EvidenceStore — write-once evidence files plus the queries the sentinel,
//! the healing pipeline and the CLI need.
//!
//! Storage path: `<state>/evidence/<workflow-id>--<timestamp>.json`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::{EvidenceError, EvidenceKey, EvidenceOutcome, EvidenceRecord};
use crate::fsutil;

/// How many later timestamps to try when two attempts of one workflow
/// start in the same millisecond.
const KEY_COLLISION_RETRIES: usize = 8;

#[derive(Debug, Clone)]
pub struct EvidenceStore {
    /// Evidence directory (e.g. "/project/.fleet/evidence")
    dir: PathBuf,
}

impl EvidenceStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialize the finished record and write it in one atomic step.
    /// Existing files are never replaced.
    pub async fn persist(&self, record: &EvidenceRecord) -> Result<PathBuf, EvidenceError> {
        let mut json = serde_json::to_string_pretty(record)
            .map_err(|e| EvidenceError::Serialization(e.to_string()))?;
        json.push('\n');

        let mut key = record.key();
        for _ in 0..KEY_COLLISION_RETRIES {
            let path = self.dir.join(key.file_name());
            match fsutil::write_atomic_new(&path, json.as_bytes()).await {
                Ok(()) => {
                    tracing::debug!("[EvidenceStore] Wrote {}", path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    key = key.next();
                }
                Err(e) => return Err(EvidenceError::Io(e.to_string())),
            }
        }
        Err(EvidenceError::AlreadyExists(record.key().file_name()))
    }

    pub fn load(&self, path: &Path) -> Result<EvidenceRecord, EvidenceError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EvidenceError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| EvidenceError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Every evidence file name in the directory, sorted.
    pub fn keys(&self) -> Result<Vec<(EvidenceKey, PathBuf)>, EvidenceError> {
        let files = crate::workflow::catalog::json_files(&self.dir)
            .map_err(|e| EvidenceError::Io(e.to_string()))?;
        Ok(files
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_string_lossy().to_string();
                EvidenceKey::parse(&name).map(|key| (key, path))
            })
            .collect())
    }

    /// All readable records, oldest first. Unreadable files are logged and
    /// skipped.
    pub fn list(&self) -> Result<Vec<EvidenceRecord>, EvidenceError> {
        let mut records = Vec::new();
        for (_, path) in self.keys()? {
            match self.load(&path) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("[EvidenceStore] Skipping {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        Ok(records)
    }

    /// Most recent record for each workflow ID.
    pub fn latest_per_workflow(&self) -> Result<BTreeMap<String, EvidenceRecord>, EvidenceError> {
        let mut latest = BTreeMap::new();
        for record in self.list()? {
            latest.insert(record.workflow_id.clone(), record);
        }
        Ok(latest)
    }

    /// Records whose execution started at or after `since`.
    pub fn since(&self, since: DateTime<Utc>) -> Result<Vec<EvidenceRecord>, EvidenceError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.started_at >= since)
            .collect())
    }

    /// Records of attempts that actually ran and failed.
    pub fn failed(&self) -> Result<Vec<EvidenceRecord>, EvidenceError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.outcome == EvidenceOutcome::Failed)
            .collect())
    }
}
