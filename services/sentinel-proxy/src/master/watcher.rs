//! Background task that keeps the master cache current.
//!
//! Each cycle discovers and verifies a master, publishes it, then holds an
//! idle monitoring connection to it. The master never writes to that
//! connection, so the read only returns when the connection breaks, which is
//! the trigger for the next discovery.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cache::MasterCache;
use crate::discovery::MasterSource;

/// Watcher timing.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Pause before retrying after a failed cycle.
    pub poll_interval: Duration,
    /// Bound on opening the monitoring connection.
    pub connect_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// How a watch cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    /// Discovery or verification failed.
    DiscoveryFailed,
    /// The verified master refused the monitoring connection.
    MonitorUnreachable,
    /// The monitoring connection was established and later broke.
    MonitorLost,
}

impl CycleOutcome {
    fn backs_off(self) -> bool {
        !matches!(self, CycleOutcome::MonitorLost)
    }
}

/// Refreshes a [`MasterCache`] for as long as it runs.
pub struct MasterWatcher {
    source: Arc<dyn MasterSource>,
    cache: MasterCache,
    config: WatcherConfig,
}

impl MasterWatcher {
    pub fn new(source: Arc<dyn MasterSource>, cache: MasterCache, config: WatcherConfig) -> Self {
        Self {
            source,
            cache,
            config,
        }
    }

    /// The cache this watcher writes to.
    pub fn cache(&self) -> &MasterCache {
        &self.cache
    }

    /// Run until `shutdown` is cancelled. Errors never end the loop.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Monitoring master");

        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.watch_cycle() => outcome,
            };

            if outcome.backs_off() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!("Master watcher stopped");
    }

    async fn watch_cycle(&self) -> CycleOutcome {
        let addr = match self.source.discover().await {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "Failed to update master");
                return CycleOutcome::DiscoveryFailed;
            }
        };

        let previous = self.cache.set(addr.clone());
        match previous.as_deref() {
            Some(prev) if *prev == addr => debug!(master = %addr, "Master unchanged"),
            Some(prev) => info!(previous = %prev, master = %addr, "Master changed"),
            None => info!(master = %addr, "Master discovered"),
        }

        let mut monitor = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(master = %addr, error = %e, "Failed to open monitoring connection");
                return CycleOutcome::MonitorUnreachable;
            }
            Err(_) => {
                warn!(master = %addr, "Timed out opening monitoring connection");
                return CycleOutcome::MonitorUnreachable;
            }
        };

        debug!(master = %addr, "Watcher connected to master");
        match tokio::io::copy(&mut monitor, &mut tokio::io::sink()).await {
            Ok(bytes) => info!(master = %addr, bytes, "Lost connection to master"),
            Err(e) => info!(master = %addr, error = %e, "Lost connection to master"),
        }

        CycleOutcome::MonitorLost
    }
}
