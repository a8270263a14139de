//! sentinel-proxy
//!
//! Sentinel-aware redis proxy. Clients connect to one stable address and are
//! relayed to whichever node Sentinel currently reports as master.
//!
//! ## Architecture
//!
//! - **Master Watcher**: resolves and verifies the master through Sentinel,
//!   publishes it, and re-resolves when its monitoring connection breaks
//! - **Listener**: accepts clients and relays each one to the cached master

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sentinel_proxy::{
    Cli, Config, Listener, LogFormat, MasterCache, MasterWatcher, SentinelClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(Cli::parse())?;

    init_tracing(&config);

    info!("Starting sentinel-proxy");
    info!(
        listen_address = %config.listen_address,
        sentinel_address = %config.sentinel_address,
        monitor_name = %config.monitor_name,
        master_wait_secs = config.master_wait.as_secs(),
        ready_wait_secs = config.ready_wait.as_secs(),
        sentinel_wait_secs = config.sentinel_wait.as_secs(),
        "Configuration loaded"
    );

    let cache = MasterCache::new();
    let shutdown = CancellationToken::new();

    // Keep the cached master address current.
    let watcher = MasterWatcher::new(
        Arc::new(SentinelClient::new(config.sentinel_config())),
        cache.clone(),
        config.watcher_config(),
    );
    let watcher_handle = tokio::spawn(watcher.run(shutdown.clone()));

    let listener = Listener::bind(config.listener_config().await?, cache)
        .await
        .context("Failed to listen")?;
    let listener = Arc::new(listener);

    let result = tokio::select! {
        result = listener.run() => result.context("Failed to listen"),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    shutdown.cancel();
    let _ = watcher_handle.await;
    result
}

fn init_tracing(config: &Config) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter().into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
