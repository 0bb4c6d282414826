//! Fleetwatch Core — orchestration layer for an autonomous test fleet.
//!
//! Independent worker processes load workflow definitions from a shared
//! catalog, drive a running application (through a headless browser or
//! plain HTTP), and persist one evidence record per execution attempt. The
//! regression sentinel gates merges on that evidence and the self-healing
//! pipeline turns failures into validated, merged patches.
//!
//! ```text
//! Discoverer ──► workflows/<agent>/<id>.json ──► Fleet Launcher
//!                                                   │ spawns
//!                                      ┌────────────┼─────────────┐
//!                                 BrowserAgent   HttpAgent   Sentinel …
//!                                      └──► evidence/<id>--<ts>.json ◄──┘
//!                                                   │
//!                     Coordinator → Analysis → Fix → Validate → Commit
//! ```
//!
//! The crate has no CLI dependency; `fleetwatch-cli` wires it to signals,
//! environment and process arguments.

pub mod agent;
pub mod config;
pub mod evidence;
pub mod fleet;
pub mod fsutil;
pub mod git;
pub mod healing;
pub mod sentinel;
pub mod workflow;

// Convenience re-exports
pub use config::FleetPaths;
