//! `fleetwatch agent run` — one worker process: a single pass over the
//! workflows it owns.

use clap::ValueEnum;
use fleetwatch_core::agent::{
    run_worker, BrowserAgent, BrowserConfig, HttpAgent, RunOptions, RunSummary, WorkerLayer,
};
use tokio_util::sync::CancellationToken;

use super::CliContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AgentKind {
    /// Drives a headless browser over CDP
    Browser,
    /// Issues plain HTTP requests
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LayerArg {
    Ui,
    Api,
    Integration,
}

impl From<LayerArg> for WorkerLayer {
    fn from(layer: LayerArg) -> Self {
        match layer {
            LayerArg::Ui => WorkerLayer::Ui,
            LayerArg::Api => WorkerLayer::Api,
            LayerArg::Integration => WorkerLayer::Integration,
        }
    }
}

pub async fn run(
    ctx: &CliContext,
    name: &str,
    kind: AgentKind,
    layer: Option<LayerArg>,
    failed_only: bool,
    cancel: CancellationToken,
) -> Result<(), String> {
    let options = RunOptions { failed_only };
    let result = match kind {
        AgentKind::Browser => {
            let profile_dir = std::env::temp_dir().join(format!("fleetwatch-{}-{}", name, std::process::id()));
            let config = BrowserConfig::new(&ctx.base_url, ctx.paths.screenshots_dir(), profile_dir);
            run_worker(BrowserAgent::new(name, config), ctx.paths.clone(), options, cancel).await
        }
        AgentKind::Http => {
            let layer = layer.map(WorkerLayer::from).unwrap_or(WorkerLayer::Api);
            let agent = HttpAgent::new(name, layer, &ctx.base_url);
            run_worker(agent, ctx.paths.clone(), options, cancel).await
        }
    };

    let summary = result.map_err(|e| e.to_string())?;
    report(name, &summary)
}

fn report(name: &str, summary: &RunSummary) -> Result<(), String> {
    for result in &summary.results {
        let mark = if result.passed { "✅" } else { "❌" };
        match &result.error {
            Some(error) => println!(
                "{} {} [{}] {}ms: {}",
                mark,
                result.workflow_id,
                result.outcome.as_str(),
                result.duration_ms,
                error
            ),
            None => println!("{} {} {}ms", mark, result.workflow_id, result.duration_ms),
        }
    }
    if summary.invalid_files > 0 {
        println!("⚠️  {} invalid workflow file(s) skipped", summary.invalid_files);
    }
    println!("{}: {}", name, summary.describe());

    if summary.all_passed() {
        Ok(())
    } else {
        Err(format!("{}: {}", name, summary.describe()))
    }
}
