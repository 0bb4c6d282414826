//! Workflow catalog on disk: `<workflows>/<agent>/<workflow-id>.json`.
//!
//! The directory encodes the owning worker, the file stem the workflow ID.
//! Files are written whole (atomic rename) and loaded in sorted filename
//! order so every worker sees a deterministic execution order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::schema::WorkflowDefinition;
use super::SchemaError;
use crate::fsutil;

/// Workflows grouped by owning agent key.
pub type Catalog = BTreeMap<String, Vec<WorkflowDefinition>>;

/// Result of loading one agent's workflow directory.
#[derive(Debug, Default)]
pub struct LoadedWorkflows {
    /// Valid workflows, in load order
    pub workflows: Vec<WorkflowDefinition>,
    /// Files that failed validation and were skipped
    pub skipped: Vec<SkippedWorkflow>,
}

#[derive(Debug)]
pub struct SkippedWorkflow {
    pub path: PathBuf,
    pub error: SchemaError,
}

pub fn workflow_path(workflows_dir: &Path, agent: &str, workflow_id: &str) -> PathBuf {
    workflows_dir.join(agent).join(format!("{}.json", workflow_id))
}

/// Write a catalog, one file per workflow. The written catalog replaces
/// what is on disk wholesale: stale `.json` files are removed, including
/// those of agents the new catalog no longer has.
pub async fn write_catalog(workflows_dir: &Path, catalog: &Catalog) -> std::io::Result<usize> {
    for workflow in catalog.values().flatten() {
        super::validate_definition(workflow)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    }

    for agent in list_agents(workflows_dir)? {
        if catalog.contains_key(&agent) {
            continue;
        }
        for path in json_files(&workflows_dir.join(&agent))? {
            tracing::info!("[Catalog] Removing workflow file {} of dropped agent {}", path.display(), agent);
            tokio::fs::remove_file(&path).await?;
        }
    }

    let mut written = 0;
    for (agent, workflows) in catalog {
        let agent_dir = workflows_dir.join(agent);
        tokio::fs::create_dir_all(&agent_dir).await?;

        let keep: std::collections::HashSet<String> =
            workflows.iter().map(|w| format!("{}.json", w.id)).collect();
        let mut entries = tokio::fs::read_dir(&agent_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") && !keep.contains(&name) {
                tracing::info!("[Catalog] Removing stale workflow file {}/{}", agent, name);
                tokio::fs::remove_file(entry.path()).await?;
            }
        }

        for workflow in workflows {
            let json = workflow
                .to_catalog_json()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let path = workflow_path(workflows_dir, agent, &workflow.id);
            fsutil::write_atomic(&path, json.as_bytes()).await?;
            written += 1;
        }
    }
    Ok(written)
}

/// List agent keys that have a catalog directory, sorted.
pub fn list_agents(workflows_dir: &Path) -> std::io::Result<Vec<String>> {
    if !workflows_dir.is_dir() {
        return Ok(vec![]);
    }
    let mut agents: Vec<String> = std::fs::read_dir(workflows_dir)?
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    agents.sort();
    Ok(agents)
}

/// Sorted `.json` files in a directory (hidden temp files excluded).
pub fn json_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension().map(|e| e == "json").unwrap_or(false)
                && !p
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(true)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Load every workflow an agent owns. Invalid files are skipped with a
/// warning instead of failing the whole load.
pub fn load_agent_workflows(workflows_dir: &Path, agent: &str) -> std::io::Result<LoadedWorkflows> {
    let mut loaded = LoadedWorkflows::default();
    for path in json_files(&workflows_dir.join(agent))? {
        match WorkflowDefinition::from_file(&path) {
            Ok(workflow) => loaded.workflows.push(workflow),
            Err(error) => {
                tracing::warn!(
                    "[Catalog] Skipping invalid workflow file {}: {}",
                    path.display(),
                    error
                );
                loaded.skipped.push(SkippedWorkflow { path, error });
            }
        }
    }
    Ok(loaded)
}

/// Load the whole catalog, keyed by agent.
pub fn load_catalog(workflows_dir: &Path) -> std::io::Result<Catalog> {
    let mut catalog = Catalog::new();
    for agent in list_agents(workflows_dir)? {
        let loaded = load_agent_workflows(workflows_dir, &agent)?;
        catalog.insert(agent, loaded.workflows);
    }
    Ok(catalog)
}
