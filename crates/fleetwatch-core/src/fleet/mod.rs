//! Fleet supervision: configuration and the process launcher.

pub mod config;
pub mod launcher;

use std::path::PathBuf;

pub use config::{FleetConfig, WorkerEntry, WorkerKind};
pub use launcher::{
    launch_fleet, ChildEvent, ChildExit, ChildPhase, FleetReport, LaunchContext,
};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Invalid fleet config '{path}': {message}")]
    Config { path: PathBuf, message: String },

    #[error("Failed to spawn worker '{key}': {message}")]
    Spawn { key: String, message: String },

    #[error("IO error: {0}")]
    Io(String),
}
