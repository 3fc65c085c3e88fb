//! Command-line interface for contentforge.
//!
//! Provides commands for running the orchestrator and for submitting,
//! inspecting and cancelling content jobs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
