//! Fleetwatch CLI — discover workflows, run test workers, launch the fleet,
//! gate merges and drive the self-healing pipeline.
//!
//! Every long-running command maps SIGINT/SIGTERM onto a cancellation token
//! so workers finish their in-flight step and persist evidence before
//! exiting.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fleetwatch_cli::commands::{self, agent, heal, CliContext};
use fleetwatch_core::config::{DEFAULT_BASE_URL, DEFAULT_STATE_DIR};

/// Fleetwatch — autonomous multi-agent testing with self-healing
#[derive(Parser)]
#[command(name = "fleetwatch", version, about = "Fleetwatch — autonomous multi-agent testing with self-healing")]
pub struct Cli {
    /// Shared state directory (workflows, evidence, status, logs, healing queues)
    #[arg(long, env = "FLEET_STATE_DIR", default_value = DEFAULT_STATE_DIR, global = true)]
    state_dir: PathBuf,

    /// Base URL of the application under test
    #[arg(long, env = "FLEET_BASE_URL", default_value = DEFAULT_BASE_URL, global = true)]
    base_url: String,

    /// Git repository of the application under test
    #[arg(long, env = "FLEET_REPO", default_value = ".", global = true)]
    repo: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the application and write the workflow catalog
    Discover {
        /// Discovery config (YAML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// UI markup to scan, overrides the config
        #[arg(long)]
        ui: Option<PathBuf>,
        /// Server route table to scan, overrides the config
        #[arg(long)]
        routes: Option<PathBuf>,
    },

    /// Inspect and validate workflow definitions
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Run a single worker
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Supervise the worker fleet
    Fleet {
        #[command(subcommand)]
        action: FleetAction,
    },

    /// Revert merges that break the test suite
    Sentinel {
        #[command(subcommand)]
        action: SentinelAction,
    },

    /// Self-healing pipeline
    Heal {
        #[command(subcommand)]
        action: HealAction,
    },

    /// Show every worker's published status
    Status {
        /// Print raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Browse execution evidence
    Evidence {
        #[command(subcommand)]
        action: EvidenceAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Validate a workflow file or a directory of them
    Validate {
        /// Workflow JSON file or catalog directory
        path: PathBuf,
    },
    /// List the catalog grouped by worker
    List,
}

#[derive(Subcommand)]
enum AgentAction {
    /// Run every workflow the worker owns once
    Run {
        /// Worker key; also the catalog directory it loads from
        #[arg(long)]
        name: String,
        /// Worker implementation
        #[arg(long, value_enum)]
        kind: agent::AgentKind,
        /// Layer reported by an HTTP worker
        #[arg(long, value_enum)]
        layer: Option<agent::LayerArg>,
        /// Only workflows whose latest evidence did not pass
        #[arg(long)]
        failed_only: bool,
    },
}

#[derive(Subcommand)]
enum FleetAction {
    /// Launch every enabled worker and wait for them
    Launch {
        /// Fleet config (YAML); defaults to the built-in test fleet
        #[arg(long)]
        config: Option<PathBuf>,
        /// Use the built-in healing fleet instead of the test fleet
        #[arg(long)]
        healing: bool,
    },
}

#[derive(Subcommand)]
enum SentinelAction {
    /// Poll the repository head and gate every new merge
    Watch {
        /// Fleet used to run the suite (YAML)
        #[arg(long)]
        fleet_config: Option<PathBuf>,
        /// Seconds between polls
        #[arg(long, default_value_t = 30)]
        poll_secs: u64,
    },
}

#[derive(Subcommand)]
enum HealAction {
    /// Run all stages in one process
    Run {
        /// Healing config (YAML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Fleet used for re-tests after a merge (YAML)
        #[arg(long)]
        fleet_config: Option<PathBuf>,
        /// Run one cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Run a single stage until stopped
    Stage {
        #[arg(value_enum)]
        name: heal::StageName,
        /// Healing config (YAML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Fleet launched by the retest stage (YAML)
        #[arg(long)]
        fleet_config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum EvidenceAction {
    /// List evidence records, oldest first
    List {
        /// Only failed attempts
        #[arg(long)]
        failed: bool,
        /// Only the newest record per workflow
        #[arg(long)]
        latest: bool,
    },
}

#[tokio::main]
async fn main() {
    // .env.local wins over .env; variables already set win over both.
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetwatch_core=info,fleetwatch_cli=info".into()),
        )
        .init();

    let ctx = CliContext::new(&cli.state_dir, &cli.base_url, &cli.repo);

    let result = match cli.command {
        Some(Commands::Discover { config, ui, routes }) => {
            commands::discover::run(&ctx, config.as_deref(), ui.as_deref(), routes.as_deref()).await
        }

        Some(Commands::Workflow { action }) => match action {
            WorkflowAction::Validate { path } => commands::workflow::validate(&path).await,
            WorkflowAction::List => commands::workflow::list(&ctx).await,
        },

        Some(Commands::Agent { action }) => match action {
            AgentAction::Run {
                name,
                kind,
                layer,
                failed_only,
            } => {
                let cancel = commands::shutdown_token();
                commands::agent::run(&ctx, &name, kind, layer, failed_only, cancel).await
            }
        },

        Some(Commands::Fleet { action }) => match action {
            FleetAction::Launch { config, healing } => {
                let cancel = commands::shutdown_token();
                commands::fleet::launch(&ctx, config.as_deref(), healing, cancel).await
            }
        },

        Some(Commands::Sentinel { action }) => match action {
            SentinelAction::Watch {
                fleet_config,
                poll_secs,
            } => {
                let cancel = commands::shutdown_token();
                commands::sentinel::watch(&ctx, fleet_config.as_deref(), poll_secs, cancel).await
            }
        },

        Some(Commands::Heal { action }) => {
            let cancel = commands::shutdown_token();
            match action {
                HealAction::Run {
                    config,
                    fleet_config,
                    once,
                } => {
                    commands::heal::run(&ctx, config.as_deref(), fleet_config.as_deref(), once, cancel)
                        .await
                }
                HealAction::Stage {
                    name,
                    config,
                    fleet_config,
                } => {
                    commands::heal::stage(&ctx, config.as_deref(), fleet_config.as_deref(), name, cancel)
                        .await
                }
            }
        }

        Some(Commands::Status { json }) => commands::status::show(&ctx, json).await,

        Some(Commands::Evidence { action }) => match action {
            EvidenceAction::List { failed, latest } => {
                commands::evidence::list(&ctx, commands::evidence::ListFilter { failed, latest }).await
            }
        },

        None => {
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
