//! Fleetwatch CLI library — the command implementations behind the
//! `fleetwatch` binary, exposed so integration tests can drive them without
//! spawning a process.

pub mod commands;

pub use commands::CliContext;
