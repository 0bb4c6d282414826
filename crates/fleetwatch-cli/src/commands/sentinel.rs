//! `fleetwatch sentinel watch` — gate merges on the test suite and revert
//! the ones that break it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fleetwatch_core::agent::{FileStatusChannel, StatusChannel};
use fleetwatch_core::git::GitRepo;
use fleetwatch_core::sentinel::{FleetSuiteRunner, RegressionSentinel};
use tokio_util::sync::CancellationToken;

use super::{fleet, CliContext};

pub async fn watch(
    ctx: &CliContext,
    fleet_config: Option<&Path>,
    poll_secs: u64,
    cancel: CancellationToken,
) -> Result<(), String> {
    let repo = GitRepo::open(&ctx.repo).map_err(|e| e.to_string())?;
    ctx.paths
        .ensure()
        .map_err(|e| format!("state directory {}: {}", ctx.paths.root().display(), e))?;

    let runner = FleetSuiteRunner::new(
        fleet::load_config(fleet_config, false)?,
        ctx.launch_context()?,
        ctx.paths.clone(),
        cancel.clone(),
    );
    let status: Arc<dyn StatusChannel> = Arc::new(FileStatusChannel::new(ctx.paths.status_dir()));
    let mut sentinel = RegressionSentinel::new(repo, runner, &ctx.paths, status)
        .with_poll_interval(Duration::from_secs(poll_secs.max(1)));

    println!("👀 Watching {} every {}s", ctx.repo.display(), poll_secs.max(1));
    sentinel.watch(cancel).await.map_err(|e| e.to_string())
}
