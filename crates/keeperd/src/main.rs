//! Keeper Daemon - game server lifecycle monitor
//!
//! Polls the Compose project, records starts/stops/health changes, and serves
//! start/stop/status requests on a Unix control socket.

use anyhow::{Context, Result};
use clap::Parser;
use keeper_common::compose::{self, ComposeCommander, ComposeProbe};
use keeper_common::{Config, EventLog, SnapshotStore};
use keeperd::control;
use keeperd::monitor::{Collaborators, Monitor, MonitorSettings, SystemClock};
use keeperd::notifier::{FanoutSink, LogSink, WebhookSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "keeperd")]
#[command(about = "Game server lifecycle monitor", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: /etc/keeper/config.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!("[BOOT] Keeper daemon v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    compose::validate_setup(&config.compose.dir).context("Invalid compose setup")?;
    info!("[BOOT] Compose project at {}", config.compose.dir.display());

    let data_dir = &config.storage.data_dir;
    let log = EventLog::in_dir(data_dir);
    let store = SnapshotStore::new(data_dir, config.storage.backup_generations);

    let mut sink = FanoutSink::new().with(Arc::new(LogSink));
    if let Some(url) = &config.notify.webhook_url {
        let webhook = WebhookSink::new(
            url.clone(),
            Duration::from_secs(config.notify.webhook_timeout_secs),
        )
        .context("Invalid webhook configuration")?;
        sink = sink.with(Arc::new(webhook));
        info!("[BOOT] Webhook notifications enabled");
    }

    let parts = Collaborators {
        probe: Arc::new(ComposeProbe::new(
            &config.compose.dir,
            config.compose.service.clone(),
        )),
        issuer: Arc::new(ComposeCommander::new(&config.compose.dir)),
        sink: Arc::new(sink),
        clock: Arc::new(SystemClock),
    };

    let monitor = Monitor::new(MonitorSettings::from_config(&config), log, store, parts)
        .context("Failed to initialize monitor")?;
    let (handle, task) = monitor.spawn();

    let listener = control::bind(&config.control.socket_path).await?;
    let server = tokio::spawn(control::serve(listener, handle.clone()));

    info!("[READY] keeperd operational");
    wait_for_shutdown().await;
    info!("Shutting down gracefully");

    server.abort();
    handle.shutdown().await;
    if let Err(e) = task.await {
        error!("Monitor task ended abnormally: {}", e);
    }
    let _ = std::fs::remove_file(&config.control.socket_path);
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }
}
