//! Fleet launcher — spawns enabled workers as OS processes and supervises
//! them until the last one exits.
//!
//! Each child gets a watcher task that owns the `Child`, copies its
//! stdout/stderr into `logs/<key>.log`, and drives the stop sequence when
//! the cancellation token fires:
//!
//! ```text
//! Running ──stop──► Stopping (SIGTERM) ──grace expired──► Killed
//!    │                   │
//!    └──────exit─────────┴──────exit──────► Exited
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::{FleetConfig, WorkerEntry};
use super::LaunchError;

const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPhase {
    Running,
    /// Graceful stop requested, waiting out the grace period
    Stopping,
    Exited(Option<i32>),
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    StopRequested,
    Exited(Option<i32>),
    GraceExpired,
}

impl ChildPhase {
    pub fn next(self, event: ChildEvent) -> ChildPhase {
        match (self, event) {
            (ChildPhase::Running, ChildEvent::StopRequested) => ChildPhase::Stopping,
            (ChildPhase::Running | ChildPhase::Stopping, ChildEvent::Exited(code)) => {
                ChildPhase::Exited(code)
            }
            (ChildPhase::Stopping, ChildEvent::GraceExpired) => ChildPhase::Killed,
            (phase, _) => phase,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChildPhase::Exited(_) | ChildPhase::Killed)
    }
}

/// How the launcher invokes default (non-custom) workers.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    /// Executable that provides the worker subcommands
    pub exe: PathBuf,
    /// Arguments placed before the subcommand, e.g. `--state-dir`
    pub global_args: Vec<String>,
    pub logs_dir: PathBuf,
}

impl LaunchContext {
    /// Program and arguments for one entry.
    pub fn command_for(&self, key: &str, entry: &WorkerEntry) -> Result<(String, Vec<String>), LaunchError> {
        match &entry.command {
            Some(command) => {
                let (program, args) = command.split_first().ok_or_else(|| LaunchError::Spawn {
                    key: key.to_string(),
                    message: "empty command".to_string(),
                })?;
                let mut args = args.to_vec();
                args.extend(entry.args.iter().cloned());
                Ok((program.clone(), args))
            }
            None => {
                let mut args = self.global_args.clone();
                args.extend(entry.kind.default_args(key));
                args.extend(entry.args.iter().cloned());
                Ok((self.exe.display().to_string(), args))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    pub key: String,
    pub pid: Option<u32>,
    pub phase: ChildPhase,
    pub log_file: PathBuf,
}

impl ChildExit {
    pub fn succeeded(&self) -> bool {
        self.phase == ChildPhase::Exited(Some(0))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FleetReport {
    /// Processes actually started
    pub spawned: usize,
    pub exits: Vec<ChildExit>,
    /// Entries whose process could not be started
    pub spawn_failures: Vec<(String, String)>,
    /// A termination request stopped the fleet early
    pub terminated: bool,
}

impl FleetReport {
    pub fn all_succeeded(&self) -> bool {
        self.spawn_failures.is_empty() && self.exits.iter().all(ChildExit::succeeded)
    }
}

/// Spawn every enabled worker, staggered, then wait for all of them. When
/// `cancel` fires, unspawned workers are skipped and live children are
/// stopped gracefully, then forcibly after the grace period.
pub async fn launch_fleet(
    config: &FleetConfig,
    ctx: &LaunchContext,
    cancel: CancellationToken,
) -> Result<FleetReport, LaunchError> {
    tokio::fs::create_dir_all(&ctx.logs_dir)
        .await
        .map_err(|e| LaunchError::Io(format!("{}: {}", ctx.logs_dir.display(), e)))?;

    let grace = Duration::from_millis(config.grace_period_ms);
    let stagger = Duration::from_millis(config.stagger_ms);
    let order = config.launch_order();
    tracing::info!(
        "[Launcher] Starting {} of {} worker(s)",
        order.len(),
        config.workers.len()
    );

    let mut report = FleetReport::default();
    let mut watchers = Vec::new();
    for (i, (key, entry)) in order.iter().enumerate() {
        if i > 0 && !stagger.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(stagger) => {}
                _ = cancel.cancelled() => {}
            }
        }
        if cancel.is_cancelled() {
            tracing::warn!("[Launcher] Termination requested, not starting remaining workers");
            break;
        }

        match spawn_worker(key, entry, ctx).await {
            Ok(spawned) => {
                report.spawned += 1;
                let key = key.to_string();
                let cancel = cancel.clone();
                watchers.push(tokio::spawn(watch_child(key, spawned, grace, cancel)));
            }
            Err(e) => {
                tracing::error!("[Launcher] {}", e);
                report.spawn_failures.push((key.to_string(), e.to_string()));
            }
        }
    }

    for exit in futures::future::join_all(watchers).await {
        match exit {
            Ok(exit) => report.exits.push(exit),
            Err(e) => tracing::error!("[Launcher] Watcher task failed: {}", e),
        }
    }
    report.terminated = cancel.is_cancelled();
    tracing::info!(
        "[Launcher] All workers exited ({} spawned, {} succeeded{})",
        report.spawned,
        report.exits.iter().filter(|e| e.succeeded()).count(),
        if report.terminated { ", terminated" } else { "" }
    );
    Ok(report)
}

/// A started child plus the tasks copying its output into the log.
struct Spawned {
    child: Child,
    log_file: PathBuf,
    copiers: Vec<JoinHandle<()>>,
}

async fn spawn_worker(key: &str, entry: &WorkerEntry, ctx: &LaunchContext) -> Result<Spawned, LaunchError> {
    let (program, args) = ctx.command_for(key, entry)?;
    let log_file = log_path(&ctx.logs_dir, key);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .await
        .map_err(|e| LaunchError::Io(format!("{}: {}", log_file.display(), e)))?;

    let mut child = Command::new(&program)
        .args(&args)
        .envs(&entry.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| LaunchError::Spawn {
            key: key.to_string(),
            message: format!("{} {}: {}", program, args.join(" "), e),
        })?;
    tracing::info!(
        "[Launcher] Spawned {} ({}) pid={:?}, log {}",
        key,
        entry.kind,
        child.id(),
        log_file.display()
    );

    let file = Arc::new(Mutex::new(file));
    let mut copiers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        copiers.push(tokio::spawn(copy_lines(stdout, file.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        copiers.push(tokio::spawn(copy_lines(stderr, file)));
    }
    Ok(Spawned {
        child,
        log_file,
        copiers,
    })
}

async fn copy_lines<R: AsyncRead + Unpin>(stream: R, file: Arc<Mutex<tokio::fs::File>>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut file = file.lock().await;
        let _ = file.write_all(line.as_bytes()).await;
        let _ = file.write_all(b"\n").await;
        let _ = file.flush().await;
    }
}

/// Ask a child to stop. On unix this is SIGTERM so the worker can run its
/// shutdown; elsewhere there is no graceful signal and the child is killed.
fn request_stop(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            return;
        }
    }
    let _ = child.start_kill();
}

async fn watch_child(key: String, spawned: Spawned, grace: Duration, cancel: CancellationToken) -> ChildExit {
    let Spawned {
        mut child,
        log_file,
        copiers,
    } = spawned;
    let pid = child.id();
    let mut phase = ChildPhase::Running;

    let exit_code = |status: std::io::Result<std::process::ExitStatus>| match status {
        Ok(status) => status.code(),
        Err(_) => None,
    };

    tokio::select! {
        status = child.wait() => {
            phase = phase.next(ChildEvent::Exited(exit_code(status)));
        }
        _ = cancel.cancelled() => {
            phase = phase.next(ChildEvent::StopRequested);
        }
    }

    if phase == ChildPhase::Stopping {
        tracing::info!("[Launcher] Stopping {} (grace {:?})", key, grace);
        request_stop(&mut child);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => phase = phase.next(ChildEvent::Exited(exit_code(status))),
            Err(_) => {
                tracing::warn!("[Launcher] {} ignored stop request, killing", key);
                let _ = child.start_kill();
                let _ = child.wait().await;
                phase = phase.next(ChildEvent::GraceExpired);
            }
        }
    }

    // Drain what the child wrote before it exited. A grandchild holding the
    // pipes open must not block the fleet.
    let _ = tokio::time::timeout(LOG_DRAIN_TIMEOUT, futures::future::join_all(copiers)).await;

    match phase {
        ChildPhase::Exited(Some(0)) => tracing::info!("[Launcher] {} exited cleanly", key),
        ChildPhase::Exited(code) => {
            tracing::warn!("[Launcher] {} exited with {:?} (see {})", key, code, log_file.display())
        }
        _ => tracing::warn!("[Launcher] {} was killed", key),
    }
    ChildExit {
        key,
        pid,
        phase,
        log_file,
    }
}

/// Path of a worker's log file.
pub fn log_path(logs_dir: &Path, key: &str) -> PathBuf {
    logs_dir.join(format!("{}.log", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::config::WorkerKind;

    fn shell(script: &str) -> WorkerEntry {
        let mut entry = WorkerEntry::new(WorkerKind::Http);
        entry.command = Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]);
        entry
    }

    fn ctx(dir: &Path) -> LaunchContext {
        LaunchContext {
            exe: PathBuf::from("fleetwatch"),
            global_args: vec!["--state-dir".to_string(), "/tmp/state".to_string()],
            logs_dir: dir.join("logs"),
        }
    }

    #[test]
    fn test_phase_transitions() {
        let p = ChildPhase::Running;
        assert_eq!(p.next(ChildEvent::Exited(Some(0))), ChildPhase::Exited(Some(0)));
        let stopping = p.next(ChildEvent::StopRequested);
        assert_eq!(stopping, ChildPhase::Stopping);
        assert_eq!(stopping.next(ChildEvent::GraceExpired), ChildPhase::Killed);
        assert_eq!(stopping.next(ChildEvent::Exited(None)), ChildPhase::Exited(None));
        assert_eq!(ChildPhase::Killed.next(ChildEvent::Exited(Some(1))), ChildPhase::Killed);
        assert_eq!(p.next(ChildEvent::GraceExpired), ChildPhase::Running);
        assert!(ChildPhase::Killed.is_terminal());
    }

    #[test]
    fn test_command_for_default_and_custom() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let entry = WorkerEntry::new(WorkerKind::Browser).with_args(&["--failed-only"]);
        let (program, args) = ctx.command_for("ui-agent", &entry).unwrap();
        assert_eq!(program, "fleetwatch");
        assert_eq!(
            args,
            vec!["--state-dir", "/tmp/state", "agent", "run", "--name", "ui-agent", "--kind", "browser", "--failed-only"]
        );

        let (program, args) = ctx.command_for("x", &shell("exit 0")).unwrap();
        assert_eq!(program, "sh");
        assert_eq!(args, vec!["-c", "exit 0"]);

        let mut empty = WorkerEntry::new(WorkerKind::Http);
        empty.command = Some(vec![]);
        assert!(ctx.command_for("x", &empty).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawns_only_enabled_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FleetConfig {
            stagger_ms: 10,
            grace_period_ms: 1_000,
            workers: Default::default(),
        };
        config.workers.insert("a".to_string(), shell("echo hello from a"));
        config.workers.insert("b".to_string(), shell("echo oops >&2; exit 3"));
        let mut disabled = shell("echo never");
        disabled.enabled = false;
        config.workers.insert("c".to_string(), disabled);

        let ctx = ctx(dir.path());
        let report = launch_fleet(&config, &ctx, CancellationToken::new()).await.unwrap();

        assert_eq!(report.spawned, 2);
        assert_eq!(report.exits.len(), 2);
        assert!(!report.terminated);
        assert!(!report.all_succeeded());
        let b = report.exits.iter().find(|e| e.key == "b").unwrap();
        assert_eq!(b.phase, ChildPhase::Exited(Some(3)));

        // Give the log copiers a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let a_log = std::fs::read_to_string(log_path(&ctx.logs_dir, "a")).unwrap();
        assert!(a_log.contains("hello from a"));
        let b_log = std::fs::read_to_string(log_path(&ctx.logs_dir, "b")).unwrap();
        assert!(b_log.contains("oops"));
        assert!(!log_path(&ctx.logs_dir, "c").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_termination_stops_then_kills() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FleetConfig {
            stagger_ms: 0,
            grace_period_ms: 300,
            workers: Default::default(),
        };
        config.workers.insert("polite".to_string(), shell("sleep 30"));
        config.workers.insert(
            "stubborn".to_string(),
            shell("trap '' TERM; while true; do sleep 0.1; done"),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let report = launch_fleet(&config, &ctx(dir.path()), cancel).await.unwrap();
        assert!(report.terminated);
        assert_eq!(report.spawned, 2);
        let polite = report.exits.iter().find(|e| e.key == "polite").unwrap();
        assert!(matches!(polite.phase, ChildPhase::Exited(_)));
        let stubborn = report.exits.iter().find(|e| e.key == "stubborn").unwrap();
        assert_eq!(stubborn.phase, ChildPhase::Killed);
    }
}
