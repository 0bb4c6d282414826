//! `fleetwatch workflow` — inspect and validate workflow definition files.

use std::path::{Path, PathBuf};

use fleetwatch_core::workflow::catalog::json_files;
use fleetwatch_core::workflow::{load_catalog, WorkflowDefinition};

use super::{truncate, CliContext};

/// Workflow files under `path`: the file itself, or every `.json` file in
/// the directory and its immediate subdirectories (the catalog layout).
fn collect_files(path: &Path) -> Result<Vec<PathBuf>, String> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(format!("'{}' does not exist", path.display()));
    }
    let read = |dir: &Path| json_files(dir).map_err(|e| format!("{}: {}", dir.display(), e));
    let mut files = read(path)?;
    let mut subdirs: Vec<PathBuf> = std::fs::read_dir(path)
        .map_err(|e| format!("{}: {}", path.display(), e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    subdirs.sort();
    for dir in subdirs {
        files.extend(read(&dir)?);
    }
    Ok(files)
}

/// Validate a workflow file, or every workflow file in a directory.
pub async fn validate(path: &Path) -> Result<(), String> {
    let files = collect_files(path)?;
    if files.is_empty() {
        return Err(format!("No workflow files found in '{}'", path.display()));
    }

    let mut invalid = 0;
    for file in &files {
        match WorkflowDefinition::from_file(file) {
            Ok(workflow) => println!(
                "✅ {} ({}, {} step(s){})",
                workflow.id,
                workflow.category,
                workflow.steps.len(),
                if workflow.critical_path { ", critical" } else { "" }
            ),
            Err(e) => {
                invalid += 1;
                println!("❌ {}: {}", file.display(), e);
            }
        }
    }

    println!();
    println!("{} valid, {} invalid", files.len() - invalid, invalid);
    if invalid == 0 {
        Ok(())
    } else {
        Err(format!("{} invalid workflow file(s)", invalid))
    }
}

/// List the catalog grouped by owning worker.
pub async fn list(ctx: &CliContext) -> Result<(), String> {
    let catalog = load_catalog(&ctx.paths.workflows_dir()).map_err(|e| e.to_string())?;
    if catalog.is_empty() {
        println!("No workflows in {}. Run `fleetwatch discover` first.", ctx.paths.workflows_dir().display());
        return Ok(());
    }

    println!("┌──────────────────────┬──────────────────────────────────┬─────────────┬──────────┐");
    println!("│ Agent                │ Workflow                         │ Category    │ Critical │");
    println!("├──────────────────────┼──────────────────────────────────┼─────────────┼──────────┤");
    for (agent, workflows) in &catalog {
        for wf in workflows {
            println!(
                "│ {:<20} │ {:<32} │ {:<11} │ {:<8} │",
                truncate(agent, 20),
                truncate(&wf.id, 32),
                wf.category.as_str(),
                if wf.critical_path { "yes" } else { "" }
            );
        }
    }
    println!("└──────────────────────┴──────────────────────────────────┴─────────────┴──────────┘");
    Ok(())
}
