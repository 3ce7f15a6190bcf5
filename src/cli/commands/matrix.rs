//! matrix command - Print the lock compatibility matrix

use anyhow::Result;
use serde_json::json;

use crate::cli::Context;
use crate::core::level::{compatible, LockLevel};

/// Render the matrix as a text table, held levels down, requested across.
pub fn matrix_table() -> String {
    let mut out = String::from("held\\req ");
    for requested in LockLevel::ALL {
        out.push_str(&format!(" {}", requested));
    }
    out.push('\n');

    for held in LockLevel::ALL {
        out.push_str(&format!("{:<9}", held.to_string()));
        for requested in LockLevel::ALL {
            let cell = if compatible(held, requested) { "Y" } else { "N" };
            out.push_str(&format!("  {}", cell));
        }
        out.push('\n');
    }
    out
}

/// Print the compatibility matrix.
pub fn matrix(ctx: &Context, json: bool) -> Result<()> {
    if ctx.debug {
        eprintln!("[debug] matrix: {} levels", LockLevel::ALL.len());
    }

    if json {
        let rows: Vec<Vec<bool>> = LockLevel::ALL
            .iter()
            .map(|&held| {
                LockLevel::ALL
                    .iter()
                    .map(|&requested| compatible(held, requested))
                    .collect()
            })
            .collect();
        let document = json!({
            "levels": LockLevel::ALL.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
            "bits": LockLevel::ALL.iter().map(|l| l.bits()).collect::<Vec<_>>(),
            "compatible": rows,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
    } else {
        print!("{}", matrix_table());
    }
    Ok(())
}
