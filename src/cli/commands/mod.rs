//! cli::commands
//!
//! Command dispatch and handlers.
//!
//! # Architecture
//!
//! Each command handler:
//! 1. Validates command-specific arguments
//! 2. Calls into the library
//! 3. Formats and displays output
//!
//! # Async Commands
//!
//! `contend` drives many tokio tasks, so it builds its own runtime and
//! blocks on it; the other commands are synchronous.

mod config_cmd;
mod contend;
mod matrix;

pub use config_cmd::config;
pub use contend::{contend, run_contention, ContendOptions, ContentionReport};
pub use matrix::{matrix, matrix_table};

use std::time::Duration;

use super::args::Command;
use super::Context;
use anyhow::Result;

/// Dispatch a parsed command to its handler.
pub fn dispatch(command: Command, ctx: &Context) -> Result<()> {
    match command {
        Command::Matrix { json } => matrix(ctx, json),
        Command::Config => config(ctx),
        Command::Contend {
            workers,
            iterations,
            level,
            hold_ms,
            wait_ms,
            work_ms,
            json,
        } => {
            let opts = ContendOptions {
                workers,
                iterations,
                level,
                hold: Duration::from_millis(hold_ms),
                wait: Duration::from_millis(wait_ms),
                work: Duration::from_millis(work_ms),
            };
            contend(ctx, &opts, json)
        }
    }
}
