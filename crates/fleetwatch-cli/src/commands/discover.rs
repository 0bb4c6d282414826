//! `fleetwatch discover` — scan the application and (re)write the workflow
//! catalog.

use std::path::Path;

use fleetwatch_core::workflow::{write_catalog, Discoverer, DiscoveryConfig};

use super::CliContext;

pub async fn run(
    ctx: &CliContext,
    config_file: Option<&Path>,
    ui_source: Option<&Path>,
    routes_source: Option<&Path>,
) -> Result<(), String> {
    let mut config = match config_file {
        Some(path) => DiscoveryConfig::from_file(path).map_err(|e| e.to_string())?,
        None => DiscoveryConfig::default(),
    };
    if let Some(ui) = ui_source {
        config.ui_source = Some(ui.to_path_buf());
    }
    if let Some(routes) = routes_source {
        config.routes_source = Some(routes.to_path_buf());
    }
    // Sources given relative to the repository, as the healing stages see them.
    for source in [&mut config.ui_source, &mut config.routes_source] {
        if let Some(p) = source.as_mut() {
            if p.is_relative() && !p.exists() {
                *p = ctx.repo.join(&p);
            }
        }
    }

    let (catalog, report) = Discoverer::new(config).discover().map_err(|e| e.to_string())?;
    let workflows_dir = ctx.paths.workflows_dir();
    let written = write_catalog(&workflows_dir, &catalog)
        .await
        .map_err(|e| format!("Failed to write catalog to '{}': {}", workflows_dir.display(), e))?;

    println!(
        "🔎 Scanned {} element(s) and {} route(s)",
        report.scanned_elements, report.scanned_routes
    );
    for (agent, count) in &report.per_agent {
        println!("   {:<20} {} workflow(s)", agent, count);
    }
    println!("✅ Wrote {} workflow(s) to {}", written, workflows_dir.display());
    Ok(())
}
