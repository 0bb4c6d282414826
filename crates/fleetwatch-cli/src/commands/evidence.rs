//! `fleetwatch evidence list` — browse persisted execution records.

use fleetwatch_core::evidence::{EvidenceOutcome, EvidenceRecord, EvidenceStore};

use super::{truncate, CliContext};

#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    /// Only records whose outcome is `failed`
    pub failed: bool,
    /// Only the newest record of each workflow
    pub latest: bool,
}

pub fn select(store: &EvidenceStore, filter: ListFilter) -> Result<Vec<EvidenceRecord>, String> {
    if !filter.latest {
        let records = if filter.failed { store.failed() } else { store.list() };
        return records.map_err(|e| e.to_string());
    }
    let mut records: Vec<EvidenceRecord> = store
        .latest_per_workflow()
        .map_err(|e| e.to_string())?
        .into_values()
        .collect();
    if filter.failed {
        records.retain(|r| r.outcome == EvidenceOutcome::Failed);
    }
    Ok(records)
}

pub async fn list(ctx: &CliContext, filter: ListFilter) -> Result<(), String> {
    let store = EvidenceStore::new(ctx.paths.evidence_dir());
    let records = select(&store, filter)?;
    if records.is_empty() {
        println!("No matching evidence in {}", store.dir().display());
        return Ok(());
    }

    println!("┌─────────────┬──────────────────────────────────┬──────────────────────┬─────────────────────┬──────────┐");
    println!("│ Outcome     │ Workflow                         │ Agent                │ Started (UTC)       │ Duration │");
    println!("├─────────────┼──────────────────────────────────┼──────────────────────┼─────────────────────┼──────────┤");
    for record in &records {
        println!(
            "│ {:<11} │ {:<32} │ {:<20} │ {:<19} │ {:>6}ms │",
            record.outcome.as_str(),
            truncate(&record.workflow_id, 32),
            truncate(&record.agent, 20),
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.duration_ms
        );
        if let Some(error) = &record.error {
            println!("│   ↳ {:<101} │", truncate(error, 101));
        }
    }
    println!("└─────────────┴──────────────────────────────────┴──────────────────────┴─────────────────────┴──────────┘");
    Ok(())
}
