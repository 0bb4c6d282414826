//! Coordinator — turns new failed evidence into failure tickets.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;

use super::artifacts::FailureTicket;
use super::queue::ArtifactQueue;
use super::{queues, HealingError, HealingStage};
use crate::config::FleetPaths;
use crate::evidence::{EvidenceOutcome, EvidenceStore};
use crate::fsutil;

pub struct Coordinator {
    store: EvidenceStore,
    failures: ArtifactQueue<FailureTicket>,
    /// Evidence files already looked at, so each is considered once
    ledger: PathBuf,
}

impl Coordinator {
    pub fn new(paths: &FleetPaths) -> Self {
        Self {
            store: EvidenceStore::new(paths.evidence_dir()),
            failures: ArtifactQueue::new(&paths.healing_dir(), queues::FAILURES),
            ledger: paths.healing_dir().join("coordinator-seen.json"),
        }
    }

    fn load_ledger(&self) -> BTreeSet<String> {
        std::fs::read_to_string(&self.ledger)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    async fn save_ledger(&self, seen: &BTreeSet<String>) -> Result<(), HealingError> {
        let json = serde_json::to_string(seen).map_err(|e| HealingError::Io(e.to_string()))?;
        fsutil::write_atomic(&self.ledger, json.as_bytes())
            .await
            .map_err(|e| HealingError::Io(format!("{}: {}", self.ledger.display(), e)))
    }
}

#[async_trait]
impl HealingStage for Coordinator {
    fn name(&self) -> &'static str {
        "coordinator"
    }

    async fn run_once(&mut self) -> Result<usize, HealingError> {
        let mut seen = self.load_ledger();
        let mut enqueued = 0;
        let mut changed = false;

        for (key, path) in self.store.keys()? {
            let id = key.file_name().trim_end_matches(".json").to_string();
            if !seen.insert(id.clone()) {
                continue;
            }
            changed = true;
            let record = match self.store.load(&path) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("[Heal:coordinator] Ignoring {}: {}", path.display(), e);
                    continue;
                }
            };
            // Skipped and interrupted attempts say nothing about the code.
            if record.outcome != EvidenceOutcome::Failed {
                continue;
            }
            let ticket = FailureTicket::from_record(&id, &path, &record);
            if self.failures.enqueue(&id, &ticket).await? {
                tracing::info!(
                    "[Heal:coordinator] Failure {} queued: {}",
                    record.workflow_id,
                    ticket.error_text()
                );
                enqueued += 1;
            }
        }

        if changed {
            self.save_ledger(&seen).await?;
        }
        Ok(enqueued)
    }
}
