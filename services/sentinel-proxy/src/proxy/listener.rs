//! TCP listener for proxy clients.
//!
//! Every accepted connection becomes a [`Session`] on its own task. A failed
//! accept ends the loop with an error; the process is expected to exit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info, Instrument};

use super::relay::{RelayConfig, Session};
use crate::error::{DialError, ListenError};
use crate::master::MasterCache;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Dial behaviour of accepted sessions.
    pub relay: RelayConfig,
}

impl ListenerConfig {
    /// Create a listener configuration with default dial settings.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self::with_relay(bind_addr, RelayConfig::default())
    }

    pub fn with_relay(bind_addr: SocketAddr, relay: RelayConfig) -> Self {
        Self { bind_addr, relay }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently open.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connect attempts made towards the master.
    pub dial_attempts: AtomicU64,
    /// Sessions that reached the master.
    pub backend_connected: AtomicU64,
    /// Sessions that gave up on the master (unknown or unreachable).
    pub backend_failed: AtomicU64,
    /// Bytes proxied to the master.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from the master.
    pub bytes_from_backend: AtomicU64,
}

/// The proxy's public listener.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    cache: MasterCache,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listener. Sessions read the master address from `cache`.
    pub async fn bind(config: ListenerConfig, cache: MasterCache) -> Result<Self, ListenError> {
        let listener =
            TcpListener::bind(config.bind_addr)
                .await
                .map_err(|source| ListenError::Bind {
                    addr: config.bind_addr.to_string(),
                    source,
                })?;

        Ok(Self {
            config,
            listener,
            cache,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until accepting fails.
    pub async fn run(self: Arc<Self>) -> Result<(), ListenError> {
        let local_addr = self.listener.local_addr().map_err(ListenError::Accept)?;
        info!(bind_addr = %local_addr, "Listening");

        loop {
            let (stream, peer_addr) = self.listener.accept().await.map_err(|e| {
                error!(error = %e, "Accept error");
                ListenError::Accept(e)
            })?;

            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            self.stats
                .connections_active
                .fetch_add(1, Ordering::Relaxed);
            debug!(peer_addr = %peer_addr, "Got connection");

            let session = Session::new(
                stream,
                peer_addr,
                self.config.relay.clone(),
                self.cache.clone(),
                Arc::clone(&self.stats),
            );
            let stats = Arc::clone(&self.stats);

            tokio::spawn(
                async move {
                    match session.run().await {
                        Ok(()) | Err(DialError::ClientHangup) => {}
                        Err(e) => debug!(error = %e, "Session ended without a backend"),
                    }

                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                }
                .instrument(tracing::info_span!("connection", peer = %peer_addr)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::DEFAULT_RETRY_INTERVAL;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("127.0.0.1:6379".parse().unwrap());
        assert_eq!(config.relay.retry_interval, DEFAULT_RETRY_INTERVAL);
    }

    #[tokio::test]
    async fn test_bind_reports_address_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = Listener::bind(ListenerConfig::new(addr), MasterCache::new())
            .await
            .err()
            .unwrap();
        match err {
            ListenError::Bind { addr: reported, .. } => assert_eq!(reported, addr.to_string()),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listener_stats() {
        let listener = Listener::bind(
            ListenerConfig::new("127.0.0.1:0".parse().unwrap()),
            MasterCache::new(),
        )
        .await
        .unwrap();

        assert_ne!(listener.local_addr().unwrap().port(), 0);
        assert_eq!(
            listener.stats().connections_accepted.load(Ordering::Relaxed),
            0
        );
    }
}
