//! cli
//!
//! Command-line interface layer for stacklock.
//!
//! # Responsibilities
//!
//! - Parse command-line arguments and global flags
//! - Load configuration
//! - Delegate to command handlers
//!
//! # Architecture
//!
//! The CLI layer is thin. Locking itself lives in [`crate::manager`] and
//! [`crate::backend`]; commands only wire configuration into them and
//! format results.

pub mod args;
pub mod commands;

pub use args::{Cli, Command};

use std::path::PathBuf;

use anyhow::{Context as _, Result};

use crate::core::config::LockConfig;

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct Context {
    /// Effective configuration.
    pub config: LockConfig,
    /// File the configuration came from, if any.
    pub config_path: Option<PathBuf>,
    /// Print diagnostics to stderr.
    pub debug: bool,
}

/// Run the CLI application.
///
/// This is the main entry point called from `main.rs`.
pub fn run() -> Result<()> {
    let cli = Cli::parse_args();

    let (config, config_path) = match &cli.config {
        Some(path) => {
            let config = LockConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            (config, Some(path.clone()))
        }
        None => LockConfig::load_default().context("Failed to load config")?,
    };

    if cli.debug {
        match &config_path {
            Some(path) => eprintln!("[debug] config: {}", path.display()),
            None => eprintln!("[debug] config: built-in defaults"),
        }
    }

    let ctx = Context {
        config,
        config_path,
        debug: cli.debug,
    };

    commands::dispatch(cli.command, &ctx)
}
