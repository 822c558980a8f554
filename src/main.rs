//! battery-hawk daemon entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use battery_hawk::{Config, Engine, JsonFileStore};
use hawk_transport::BleTransport;

#[derive(Parser)]
#[command(name = "battery-hawk", version, about = "BLE battery monitor fleet daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter override (e.g. "debug,hawk_transport=trace")
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let filter = cli
        .log
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("battery-hawk {} starting", env!("CARGO_PKG_VERSION"));

    let transport = Arc::new(
        BleTransport::new(config.bluetooth.adapter.as_deref())
            .await
            .context("opening Bluetooth adapter")?,
    );
    let store = Arc::new(JsonFileStore::new(config.storage.data_dir.clone()));

    let handle = Engine::start(config, transport, store, None)
        .await
        .context("starting engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    handle.shutdown().await;
    Ok(())
}
