//! Halcyon Daemon - Main entry point
//!
//! Loads the saved device list, runs coldplug discovery and serves the device
//! database over HTTP and WebSocket.

mod api;
mod config;
mod policy;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "halcyond")]
#[command(about = "Hardware device database daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "halcyon.toml")]
    config: PathBuf,

    /// Bind address for the API server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single coldplug pass, print the device list and exit
    #[arg(long)]
    probe_once: bool,

    /// Write a default configuration file to the config path and exit
    #[arg(long)]
    write_config: bool,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Halcyon v{}", env!("CARGO_PKG_VERSION"));

    if args.write_config {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    let mut config = config::load_config(&args.config)?;

    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        state_file = %config.store.state_file,
        sysfs_root = %config.coldplug.sysfs_root,
        "Configuration loaded"
    );

    let state = state::AppState::new(config.clone()).await?;

    if config.coldplug.on_startup || args.probe_once {
        let report = state.coldplug().await;
        info!(
            committed = report.committed.len(),
            rematched = report.rematched.len(),
            duplicates = report.duplicates.len(),
            failed = report.failed.len(),
            "Coldplug complete"
        );
    }

    if args.probe_once {
        for device in state.store.all_devices(false).await {
            println!(
                "{} [{:?}] {}",
                device.udi,
                device.state,
                device
                    .properties
                    .get_string("info.product")
                    .unwrap_or("-")
            );
        }
        state.save().await?;
        return Ok(());
    }

    state.spawn_autosave();

    server::run(state.clone(), &config.daemon.bind, shutdown_signal()).await?;

    state.save().await?;
    info!("Halcyon stopped");
    Ok(())
}
