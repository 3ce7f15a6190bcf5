//! cli::args
//!
//! Command-line argument definitions using clap derive.
//!
//! # Global Flags
//!
//! These flags are available on all commands:
//! - `--help` / `-h`: Show help
//! - `--version`: Show version
//! - `--config <path>`: Load configuration from this file
//! - `--debug`: Print diagnostics to stderr

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::core::level::LockLevel;

/// stacklock - reentrant multi-level advisory locks
#[derive(Parser, Debug)]
#[command(name = "stacklock")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Load configuration from this file instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print diagnostics to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Parser::parse()
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the lock compatibility matrix
    #[command(
        name = "matrix",
        long_about = "Print the lock compatibility matrix.\n\n\
            Rows are the level already held, columns the level requested. \
            A Y means both may be held on one resource at the same time.",
        after_help = "\
EXAMPLES:
    stacklock matrix
    stacklock matrix --json"
    )]
    Matrix {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    #[command(name = "config")]
    Config,

    /// Hammer one resource from concurrent units and report what happened
    #[command(
        name = "contend",
        long_about = "Hammer one resource from concurrent execution units.\n\n\
            Spawns WORKERS tokio tasks that each acquire the same resource \
            ITERATIONS times through one shared-table backend, holding it \
            briefly each time. Prints the backend counters and the largest \
            number of units seen inside the critical section at once.",
        after_help = "\
EXAMPLES:
    # Eight units fighting over an exclusive lock
    stacklock contend --workers 8 --iterations 20 --level ex

    # Readers share, so the peak climbs above one
    stacklock contend --workers 8 --level pr --json"
    )]
    Contend {
        /// Number of concurrent execution units
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Acquisitions per unit
        #[arg(long, default_value_t = 10)]
        iterations: usize,

        /// Lock level (nl, cr, cw, pr/read, pw/write, ex)
        #[arg(long, default_value = "ex")]
        level: LockLevel,

        /// Lease per acquisition in milliseconds
        #[arg(long, default_value_t = 1000)]
        hold_ms: u64,

        /// Wait budget per acquisition in milliseconds
        #[arg(long, default_value_t = 5000)]
        wait_ms: u64,

        /// Time spent inside the critical section in milliseconds
        #[arg(long, default_value_t = 1)]
        work_ms: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
