//! config command - Print the effective configuration

use anyhow::{Context as _, Result};

use crate::cli::Context;

/// Print the effective configuration as TOML, preceded by where it came from.
pub fn config(ctx: &Context) -> Result<()> {
    let rendered = ctx
        .config
        .to_toml_string()
        .context("Failed to render config")?;

    match &ctx.config_path {
        Some(path) => println!("# source: {}", path.display()),
        None => println!("# source: built-in defaults"),
    }
    print!("{}", rendered);
    Ok(())
}
