//! `fleetwatch fleet launch` — start every enabled worker as its own
//! process and wait for the fleet.

use std::path::Path;

use fleetwatch_core::fleet::{launch_fleet, ChildPhase, FleetConfig, FleetReport};
use tokio_util::sync::CancellationToken;

use super::CliContext;

/// Fleet config from `config_file`, else the built-in test or healing fleet.
pub fn load_config(config_file: Option<&Path>, healing: bool) -> Result<FleetConfig, String> {
    match config_file {
        Some(path) => FleetConfig::from_file(path).map_err(|e| e.to_string()),
        None if healing => Ok(FleetConfig::healing_fleet()),
        None => Ok(FleetConfig::test_fleet()),
    }
}

pub async fn launch(
    ctx: &CliContext,
    config_file: Option<&Path>,
    healing: bool,
    cancel: CancellationToken,
) -> Result<(), String> {
    let config = load_config(config_file, healing)?;
    let launch_ctx = ctx.launch_context()?;
    ctx.paths
        .ensure()
        .map_err(|e| format!("state directory {}: {}", ctx.paths.root().display(), e))?;

    let order: Vec<&str> = config.launch_order().iter().map(|(key, _)| *key).collect();
    println!("🚀 Launching {} worker(s): {}", order.len(), order.join(", "));

    let report = launch_fleet(&config, &launch_ctx, cancel)
        .await
        .map_err(|e| e.to_string())?;
    print_report(&report);

    if report.all_succeeded() && !report.terminated {
        Ok(())
    } else if report.terminated {
        Err("fleet stopped by termination request".to_string())
    } else {
        let failed = report.exits.iter().filter(|e| !e.succeeded()).count() + report.spawn_failures.len();
        Err(format!("{} worker(s) did not succeed", failed))
    }
}

fn describe_phase(phase: &ChildPhase) -> String {
    match phase {
        ChildPhase::Exited(Some(code)) => format!("exit {}", code),
        ChildPhase::Exited(None) => "terminated by signal".to_string(),
        ChildPhase::Killed => "killed after grace period".to_string(),
        ChildPhase::Running => "running".to_string(),
        ChildPhase::Stopping => "stopping".to_string(),
    }
}

fn print_report(report: &FleetReport) {
    println!();
    for exit in &report.exits {
        let mark = if exit.succeeded() { "✅" } else { "❌" };
        println!(
            "{} {:<24} {:<28} log: {}",
            mark,
            exit.key,
            describe_phase(&exit.phase),
            exit.log_file.display()
        );
    }
    for (key, message) in &report.spawn_failures {
        println!("❌ {:<24} not started: {}", key, message);
    }
}
