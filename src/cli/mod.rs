//! Command-line interface for fold-forge.
//!
//! Provides commands for schema migration, running workers, and submitting
//! and inspecting jobs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
