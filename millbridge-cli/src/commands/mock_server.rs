//! `mock-server` command: run the mock CNC controller.

use std::io::Read;
use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use console::style;
use log::info;
use millbridge::{CommandCatalog, MockServer, VirtualFileStore};

use crate::config::Config;

/// Resolved mock-server settings after flag/config/default layering.
pub struct ServerOptions {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
    /// Command catalog path; `None` uses the built-in set.
    pub commands: Option<PathBuf>,
    /// Seed files path; `None` uses the built-in set.
    pub files: Option<PathBuf>,
}

impl ServerOptions {
    /// Layer CLI flags over config-file values over defaults.
    pub fn resolve(
        config: &Config,
        host: Option<String>,
        port: Option<u16>,
        commands: Option<PathBuf>,
        files: Option<PathBuf>,
    ) -> Self {
        Self {
            host: host
                .or_else(|| config.server.host.clone())
                .unwrap_or_else(|| millbridge::DEFAULT_HOST.to_string()),
            port: port.or(config.server.port).unwrap_or(millbridge::DEFAULT_PORT),
            commands: commands.or_else(|| config.server.commands.clone()),
            files: files.or_else(|| config.server.files.clone()),
        }
    }
}

/// Run the mock controller until SIGINT or EOF on stdin.
pub fn run(options: &ServerOptions) -> Result<()> {
    let catalog = match &options.commands {
        Some(path) => CommandCatalog::from_file(path)
            .with_context(|| format!("Failed to load catalog: {}", path.display()))?,
        None => CommandCatalog::builtin(),
    };
    let store = match &options.files {
        Some(path) => VirtualFileStore::from_file(path)
            .with_context(|| format!("Failed to load seed files: {}", path.display()))?,
        None => VirtualFileStore::builtin(),
    };

    let (host_cmds, console_cmds, g_codes, m_codes) = catalog.counts();
    println!(
        "{} Catalog: {} host, {} console, {} G-code, {} M-code commands",
        style("•").cyan(),
        host_cmds,
        console_cmds,
        g_codes,
        m_codes
    );
    println!(
        "{} Virtual files: {} seeded",
        style("•").cyan(),
        store.len()
    );

    let server = MockServer::new(catalog, store);
    let cancel = server.transfer_cancel();

    // Ctrl-C: cancel any in-flight transfer, then shut down cleanly.
    ctrlc::set_handler(move || {
        millbridge::set_interrupt_flag();
        cancel.cancel();
        eprintln!("\nServer stopped by user");
        std::process::exit(0);
    })
    .context("Failed to install Ctrl-C handler")?;

    // EOF on stdin also means a clean shutdown (the server is usually
    // run under a test harness that closes our stdin to stop us).
    thread::spawn(|| {
        let mut sink = Vec::new();
        let _ = std::io::stdin().read_to_end(&mut sink);
        info!("stdin closed, shutting down");
        std::process::exit(0);
    });

    let listener = MockServer::bind(&options.host, options.port)
        .with_context(|| format!("Failed to bind {}:{}", options.host, options.port))?;

    println!(
        "{} Mock CNC server listening on {}",
        style("✓").green(),
        style(format!("{}:{}", options.host, options.port)).cyan()
    );

    server.serve(&listener)?;
    Ok(())
}
