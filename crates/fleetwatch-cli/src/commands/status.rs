//! `fleetwatch status` — render every published worker status.

use chrono::Utc;
use console::style;
use fleetwatch_core::agent::{read_all_statuses, WorkerState, WorkerStatus};

use super::{truncate, CliContext};

fn styled_state(state: WorkerState) -> String {
    let text = format!("{:<12}", state.as_str());
    match state {
        WorkerState::Idle => style(text).green().to_string(),
        WorkerState::Monitoring => style(text).cyan().to_string(),
        WorkerState::Initializing => style(text).yellow().to_string(),
        WorkerState::Crashed => style(text).red().bold().to_string(),
    }
}

fn age(status: &WorkerStatus) -> String {
    let secs = (Utc::now() - status.updated_at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}

pub async fn show(ctx: &CliContext, json: bool) -> Result<(), String> {
    let dir = ctx.paths.status_dir();
    let statuses = read_all_statuses(&dir).map_err(|e| format!("{}: {}", dir.display(), e))?;

    if json {
        let value = serde_json::to_value(&statuses).map_err(|e| e.to_string())?;
        super::print_json(&value);
        return Ok(());
    }
    if statuses.is_empty() {
        println!("No worker has published a status in {}", dir.display());
        return Ok(());
    }

    println!("┌──────────────────────┬─────────────┬──────────────┬──────────┬────────────────────────────────────────┐");
    println!("│ Worker               │ Layer       │ State        │ Updated  │ Message                                │");
    println!("├──────────────────────┼─────────────┼──────────────┼──────────┼────────────────────────────────────────┤");
    for status in &statuses {
        println!(
            "│ {:<20} │ {:<11} │ {} │ {:<8} │ {:<38} │",
            truncate(&status.name, 20),
            status.layer.as_str(),
            styled_state(status.state),
            age(status),
            truncate(&status.message, 38)
        );
    }
    println!("└──────────────────────┴─────────────┴──────────────┴──────────┴────────────────────────────────────────┘");

    let crashed = statuses.iter().filter(|s| s.state == WorkerState::Crashed).count();
    if crashed > 0 {
        println!("{} crashed worker(s)", style(crashed).red().bold());
    }
    Ok(())
}
