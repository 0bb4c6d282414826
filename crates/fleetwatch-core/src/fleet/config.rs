//! Fleet configuration (YAML).
//!
//! ```yaml
//! stagger_ms: 2000
//! grace_period_ms: 10000
//! workers:
//!   ui-agent:
//!     kind: browser
//!   api-agent:
//!     kind: http
//!     priority: 1
//!   legacy-probe:
//!     kind: http
//!     enabled: false
//!     command: ["node", "scripts/probe.js"]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::LaunchError;

/// What a fleet entry runs. Kinds other than custom commands map to a
/// `fleetwatch` subcommand of the current executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerKind {
    Browser,
    Http,
    Sentinel,
    Coordinator,
    Analysis,
    FixGenerator,
    BranchValidator,
    CommitAgent,
    /// Re-runs the test fleet after each merged batch
    Retest,
    Orchestrator,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Browser => "browser",
            WorkerKind::Http => "http",
            WorkerKind::Sentinel => "sentinel",
            WorkerKind::Coordinator => "coordinator",
            WorkerKind::Analysis => "analysis",
            WorkerKind::FixGenerator => "fix-generator",
            WorkerKind::BranchValidator => "branch-validator",
            WorkerKind::CommitAgent => "commit-agent",
            WorkerKind::Retest => "retest",
            WorkerKind::Orchestrator => "orchestrator",
        }
    }

    /// Subcommand arguments that run this kind under `key`.
    pub fn default_args(&self, key: &str) -> Vec<String> {
        let args: Vec<&str> = match self {
            WorkerKind::Browser | WorkerKind::Http => {
                vec!["agent", "run", "--name", key, "--kind", self.as_str()]
            }
            WorkerKind::Sentinel => vec!["sentinel", "watch"],
            WorkerKind::Orchestrator => vec!["heal", "run"],
            stage => vec!["heal", "stage", stage.as_str()],
        };
        args.into_iter().map(str::to_string).collect()
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub kind: WorkerKind,

    /// Disabled entries are never spawned
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lower launches first; ties break on key
    #[serde(default)]
    pub priority: i32,

    /// Extra arguments appended to the default subcommand
    #[serde(default)]
    pub args: Vec<String>,

    /// Replaces the default subcommand entirely (program + args)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkerEntry {
    pub fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            enabled: true,
            priority: 0,
            args: Vec::new(),
            command: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }
}

fn default_stagger_ms() -> u64 {
    2_000
}

fn default_grace_period_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Delay between consecutive launches
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,

    /// How long children get between SIGTERM and a forced kill
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default)]
    pub workers: BTreeMap<String, WorkerEntry>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self::test_fleet()
    }
}

impl FleetConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_file(path: &Path) -> Result<Self, LaunchError> {
        let content = std::fs::read_to_string(path).map_err(|e| LaunchError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_yaml(&content).map_err(|e| LaunchError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// The testing fleet: one browser worker and two HTTP workers, matching
    /// the discoverer's default agent assignment.
    pub fn test_fleet() -> Self {
        let mut workers = BTreeMap::new();
        workers.insert("ui-agent".to_string(), WorkerEntry::new(WorkerKind::Browser));
        workers.insert(
            "api-agent".to_string(),
            WorkerEntry::new(WorkerKind::Http).with_priority(1),
        );
        workers.insert(
            "integration-agent".to_string(),
            WorkerEntry::new(WorkerKind::Http)
                .with_priority(2)
                .with_args(&["--layer", "integration"]),
        );
        Self {
            stagger_ms: default_stagger_ms(),
            grace_period_ms: default_grace_period_ms(),
            workers,
        }
    }

    /// The self-healing fleet. Downstream stages launch first so they are
    /// ready before upstream stages produce work.
    pub fn healing_fleet() -> Self {
        let stages = [
            ("retest", WorkerKind::Retest),
            ("commit-agent", WorkerKind::CommitAgent),
            ("branch-validator", WorkerKind::BranchValidator),
            ("fix-generator", WorkerKind::FixGenerator),
            ("analysis", WorkerKind::Analysis),
            ("coordinator", WorkerKind::Coordinator),
        ];
        let workers = stages
            .iter()
            .enumerate()
            .map(|(i, (key, kind))| (key.to_string(), WorkerEntry::new(*kind).with_priority(i as i32)))
            .collect();
        Self {
            stagger_ms: 5_000,
            grace_period_ms: default_grace_period_ms(),
            workers,
        }
    }

    /// Enabled entries in launch order `(priority, key)`.
    pub fn launch_order(&self) -> Vec<(&str, &WorkerEntry)> {
        let mut enabled: Vec<(&str, &WorkerEntry)> = self
            .workers
            .iter()
            .filter(|(_, entry)| entry.enabled)
            .map(|(key, entry)| (key.as_str(), entry))
            .collect();
        enabled.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then_with(|| a.0.cmp(b.0)));
        enabled
    }
}
