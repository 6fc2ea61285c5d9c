//! `info` command: summarize the catalog and seed files.

use std::path::PathBuf;

use anyhow::{Context, Result};
use console::style;
use millbridge::{CommandCatalog, VirtualFileStore};

/// Print a summary of the catalog and virtual file set.
pub fn run(commands: Option<&PathBuf>, files: Option<&PathBuf>, json: bool) -> Result<()> {
    let catalog = match commands {
        Some(path) => CommandCatalog::from_file(path)
            .with_context(|| format!("Failed to load catalog: {}", path.display()))?,
        None => CommandCatalog::builtin(),
    };
    let store = match files {
        Some(path) => VirtualFileStore::from_file(path)
            .with_context(|| format!("Failed to load seed files: {}", path.display()))?,
        None => VirtualFileStore::builtin(),
    };

    if json {
        let (host, console_cmds, g, m) = catalog.counts();
        let files: Vec<serde_json::Value> = store
            .iter()
            .map(|f| {
                serde_json::json!({
                    "path": f.path,
                    "size": f.size,
                    "md5": f.md5,
                })
            })
            .collect();
        let doc = serde_json::json!({
            "catalog": {
                "host_commands": host,
                "console_commands": console_cmds,
                "g_codes": g,
                "m_codes": m,
            },
            "files": files,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    let (host, console_cmds, g, m) = catalog.counts();
    println!("{}", style("Command Catalog").bold().underlined());
    println!("  Host commands:    {host}");
    println!("  Console commands: {console_cmds}");
    println!("  G-codes:          {g}");
    println!("  M-codes:          {m}");

    println!("\n{}", style("Virtual Files").bold().underlined());
    if store.is_empty() {
        println!("  {}", style("none seeded").dim());
    } else {
        for file in store.iter() {
            println!(
                "  {} {} ({} bytes, md5 {})",
                style("•").green(),
                style(&file.path).cyan(),
                file.size,
                style(&file.md5[..8]).dim()
            );
        }
    }

    Ok(())
}
