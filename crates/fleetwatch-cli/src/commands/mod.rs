//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command. Commands return
//! `Result<(), String>`; the binary prints the error and exits 1.

pub mod agent;
pub mod discover;
pub mod evidence;
pub mod fleet;
pub mod heal;
pub mod sentinel;
pub mod status;
pub mod workflow;

use std::path::PathBuf;

use fleetwatch_core::fleet::LaunchContext;
use fleetwatch_core::FleetPaths;
use tokio_util::sync::CancellationToken;

/// Settings every command shares, taken from the global flags.
#[derive(Debug, Clone)]
pub struct CliContext {
    pub paths: FleetPaths,
    pub base_url: String,
    pub repo: PathBuf,
}

impl CliContext {
    pub fn new(state_dir: impl Into<PathBuf>, base_url: &str, repo: impl Into<PathBuf>) -> Self {
        Self {
            paths: FleetPaths::new(state_dir.into()),
            base_url: base_url.trim_end_matches('/').to_string(),
            repo: repo.into(),
        }
    }

    /// How the launcher re-invokes this binary for default workers. The
    /// global flags are forwarded so children share the same state dir.
    pub fn launch_context(&self) -> Result<LaunchContext, String> {
        let exe = std::env::current_exe().map_err(|e| format!("cannot locate own executable: {}", e))?;
        Ok(LaunchContext {
            exe,
            global_args: vec![
                "--state-dir".to_string(),
                self.paths.root().display().to_string(),
                "--base-url".to_string(),
                self.base_url.clone(),
                "--repo".to_string(),
                self.repo.display().to_string(),
            ],
            logs_dir: self.paths.logs_dir(),
        })
    }
}

/// A token that fires on SIGINT or SIGTERM.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("[Cli] Termination requested, stopping");
        trigger.cancel();
    });
    token
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut term), Ok(mut int)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
                return;
            }
            _ => tracing::warn!("[Cli] Could not install signal handlers, falling back to ctrl-c"),
        }
    }
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Cut `s` to at most `max` characters, marking the cut with `…`.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}
