//! `fleetwatch heal` — the self-healing pipeline, either all stages in one
//! process (`heal run`) or one stage per fleet process (`heal stage`).

use std::path::Path;

use clap::ValueEnum;
use fleetwatch_core::fleet::FleetConfig;
use fleetwatch_core::git::GitRepo;
use fleetwatch_core::healing::{
    run_stage, AnalysisStage, BranchValidator, CommandProbe, CommitAgent, Coordinator, FixGenerator,
    HealingConfig, HealingOrchestrator, HealingStage, RetestStage,
};
use fleetwatch_core::sentinel::FleetSuiteRunner;
use tokio_util::sync::CancellationToken;

use super::CliContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StageName {
    Coordinator,
    Analysis,
    FixGenerator,
    BranchValidator,
    CommitAgent,
    Retest,
}

fn load_config(config_file: Option<&Path>) -> Result<HealingConfig, String> {
    match config_file {
        Some(path) => HealingConfig::from_file(path).map_err(|e| e.to_string()),
        None => Ok(HealingConfig::default()),
    }
}

fn open_repo(ctx: &CliContext) -> Result<GitRepo, String> {
    GitRepo::open(&ctx.repo).map_err(|e| e.to_string())
}

/// Suite runner that launches the test fleet for a re-test.
fn retest_runner(
    ctx: &CliContext,
    fleet_config: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<FleetSuiteRunner, String> {
    let fleet = match fleet_config {
        Some(path) => FleetConfig::from_file(path).map_err(|e| e.to_string())?,
        None => FleetConfig::test_fleet(),
    };
    Ok(FleetSuiteRunner::new(fleet, ctx.launch_context()?, ctx.paths.clone(), cancel.clone()))
}

/// Build one stage. Stages that touch the repository open it here.
/// `fleet_config` is the fleet a re-test launches.
pub fn build_stage(
    ctx: &CliContext,
    config: &HealingConfig,
    name: StageName,
    fleet_config: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<Box<dyn HealingStage>, String> {
    let paths = &ctx.paths;
    Ok(match name {
        StageName::Coordinator => Box::new(Coordinator::new(paths)),
        StageName::Analysis => Box::new(AnalysisStage::new(
            paths,
            config.discovery_for(&ctx.repo),
            config.confidence_threshold,
        )),
        StageName::FixGenerator => {
            Box::new(FixGenerator::new(paths, &ctx.repo, config.patch_targets.clone()))
        }
        StageName::BranchValidator => Box::new(BranchValidator::new(
            paths,
            open_repo(ctx)?,
            CommandProbe::new(config.probe_command.clone()),
        )),
        StageName::CommitAgent => Box::new(CommitAgent::new(paths, open_repo(ctx)?, config.batch_size)),
        StageName::Retest => Box::new(RetestStage::new(
            paths,
            Box::new(retest_runner(ctx, fleet_config, cancel)?),
        )),
    })
}

/// Run one stage until cancelled.
pub async fn stage(
    ctx: &CliContext,
    config_file: Option<&Path>,
    fleet_config: Option<&Path>,
    name: StageName,
    cancel: CancellationToken,
) -> Result<(), String> {
    let config = load_config(config_file)?;
    let mut stage = build_stage(ctx, &config, name, fleet_config, &cancel)?;
    run_stage(stage.as_mut(), config.poll_interval(), cancel)
        .await
        .map_err(|e| e.to_string())
}

/// Run every stage in-process. With `once`, a single cycle is run and
/// reported.
pub async fn run(
    ctx: &CliContext,
    config_file: Option<&Path>,
    fleet_config: Option<&Path>,
    once: bool,
    cancel: CancellationToken,
) -> Result<(), String> {
    let config = load_config(config_file)?;
    if config.probe_command.is_empty() {
        tracing::warn!("[Heal] No probe_command configured; every patch will fail validation");
    }
    let repo = open_repo(ctx)?;
    let retest = retest_runner(ctx, fleet_config, &cancel)?;
    let mut orchestrator = HealingOrchestrator::standard(
        &ctx.paths,
        repo,
        &config,
        CommandProbe::new(config.probe_command.clone()),
        Box::new(retest),
    );

    if once {
        let report = orchestrator.run_cycle().await.map_err(|e| e.to_string())?;
        for (stage, handled) in &report.stages {
            println!("   {:<18} {}", stage, handled);
        }
        println!("🩹 {} artifact(s) handled, {} re-test(s)", report.handled(), report.retests);
        return Ok(());
    }
    orchestrator.run(cancel).await.map_err(|e| e.to_string())
}
