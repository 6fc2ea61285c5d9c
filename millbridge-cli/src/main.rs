//! millbridge CLI - mock CNC controller and protocol tooling.

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use env_logger::Env;
use std::path::PathBuf;

mod commands;
mod config;

use config::Config;

/// millbridge - CNC mill protocol tooling and mock controller.
#[derive(Parser)]
#[command(name = "millbridge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output level (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to a TOML config file (overrides the default search).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the mock CNC controller.
    MockServer {
        /// Host to bind to.
        #[arg(long, env = "MILLBRIDGE_HOST")]
        host: Option<String>,

        /// Port to bind to.
        #[arg(short, long, env = "MILLBRIDGE_PORT")]
        port: Option<u16>,

        /// Command catalog JSON (defaults to the built-in set).
        #[arg(long)]
        commands: Option<PathBuf>,

        /// Seed virtual-files JSON (defaults to the built-in set).
        #[arg(long)]
        files: Option<PathBuf>,
    },

    /// Show the command catalog and seed file summary.
    Info {
        /// Command catalog JSON (defaults to the built-in set).
        #[arg(long)]
        commands: Option<PathBuf>,

        /// Seed virtual-files JSON (defaults to the built-in set).
        #[arg(long)]
        files: Option<PathBuf>,

        /// Emit machine-readable JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match cli.command {
        Commands::MockServer {
            host,
            port,
            commands,
            files,
        } => {
            let options =
                commands::mock_server::ServerOptions::resolve(&config, host, port, commands, files);
            commands::mock_server::run(&options)?;
        }
        Commands::Info {
            commands,
            files,
            json,
        } => {
            commands::info::run(commands.as_ref(), files.as_ref(), json)?;
        }
        Commands::Completions { shell } => {
            commands::completions::run(shell, &mut Cli::command());
        }
    }

    Ok(())
}
