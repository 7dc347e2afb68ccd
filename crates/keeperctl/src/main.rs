//! Keeper Control - operator CLI for the game server keeper
//!
//! History commands read the data directory directly; start, stop and
//! monitor go through keeperd's control socket.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use keeper_common::ipc::ControlRequest;
use keeper_common::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keeperctl")]
#[command(about = "Game server keeper - control and history", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: /etc/keeper/config.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Control socket (overrides the config file)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild sessions and stats from the event log
    Repair {
        /// Event log to read (default: <data-dir>/events.jsonl)
        #[arg(long)]
        log: Option<PathBuf>,

        /// Directory holding the snapshot files
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Report only, do not write the snapshot
        #[arg(long)]
        dry_run: bool,
    },

    /// Show uptime statistics
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// List recent sessions
    Sessions {
        /// Number of sessions to show
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,
    },

    /// Show the tail of the event log
    Log {
        /// Number of records (0 for all)
        #[arg(long, short = 'n', default_value_t = 20)]
        lines: usize,
    },

    /// Probe the server containers directly
    Status,

    /// Ask keeperd to start the server
    Start,

    /// Ask keeperd to stop the server
    Stop,

    /// Show keeperd's monitoring state
    Monitor {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        output::display_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let socket = cli
        .socket
        .unwrap_or_else(|| config.control.socket_path.clone());

    match cli.command {
        Commands::Repair {
            log,
            data_dir,
            dry_run,
        } => commands::repair(&config, log, data_dir, dry_run),
        Commands::Stats { json } => commands::stats(&config, json),
        Commands::Sessions { limit } => commands::sessions(&config, limit),
        Commands::Log { lines } => commands::log(&config, lines),
        Commands::Status => commands::status(&config).await,
        Commands::Start => commands::control(&socket, ControlRequest::Start, false).await,
        Commands::Stop => commands::control(&socket, ControlRequest::Stop, false).await,
        Commands::Monitor { json } => {
            commands::control(&socket, ControlRequest::Monitor, json).await
        }
    }
}
