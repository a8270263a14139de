//! Per-connection relay.
//!
//! ```text
//! client <-> [User/Server pipes] <-> relay buffer <-> [Client/Endpoint pipes] <-> master
//! ```
//!
//! The client-side pipes start as soon as the connection is accepted, so a
//! client hangup is noticed while the master is still being dialed. Bytes the
//! client sends in the meantime wait in the relay buffer and are forwarded in
//! order once the backend is connected.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::listener::ListenerStats;
use super::pipe::{pipe, OnHangup};
use crate::error::DialError;
use crate::master::MasterCache;

/// Default bound on a single connect attempt to the master.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on all connect attempts of one session.
pub const DEFAULT_DIAL_DEADLINE: Duration = Duration::from_secs(10);

/// Default pause between connect attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default time a relay-side pipe keeps draining after the session hung up.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Capacity of the in-memory buffer between client and backend.
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Dial behaviour of a session.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    pub dial_deadline: Duration,
    pub retry_interval: Duration,
    /// How long buffered bytes may take to reach their destination once
    /// either side has gone away.
    pub drain_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dial_deadline: DEFAULT_DIAL_DEADLINE,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

/// One accepted client connection.
pub struct Session {
    client: TcpStream,
    peer_addr: SocketAddr,
    config: RelayConfig,
    cache: MasterCache,
    stats: Arc<ListenerStats>,
    hangup: CancellationToken,
}

impl Session {
    pub fn new(
        client: TcpStream,
        peer_addr: SocketAddr,
        config: RelayConfig,
        cache: MasterCache,
        stats: Arc<ListenerStats>,
    ) -> Self {
        Self {
            client,
            peer_addr,
            config,
            cache,
            stats,
            hangup: CancellationToken::new(),
        }
    }

    /// Dial the master and relay until both sides are closed.
    pub async fn run(self) -> Result<(), DialError> {
        let Session {
            client,
            peer_addr,
            config,
            cache,
            stats,
            hangup,
        } = self;

        let (client_end, backend_end) = tokio::io::duplex(RELAY_BUFFER_SIZE);
        let (client_read, client_write) = client.into_split();
        let (relay_read, relay_write) = tokio::io::split(client_end);

        debug!(peer_addr = %peer_addr, "Piping user input to relay");
        let user = tokio::spawn(pipe(
            client_read,
            relay_write,
            "User",
            hangup.clone(),
            OnHangup::Abort,
        ));
        let server = tokio::spawn(pipe(
            relay_read,
            client_write,
            "Server",
            hangup.clone(),
            OnHangup::Drain(config.drain_grace),
        ));

        let result = match dial(&cache, &config, &hangup, &stats).await {
            Ok((backend, addr)) => {
                stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                debug!(backend_addr = %addr, "Connected to master");
                relay(backend, backend_end, &config, &hangup, &stats).await;
                Ok(())
            }
            Err(e) => {
                if e.is_reportable() {
                    stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Failed to contact endpoint");
                    report(backend_end, &e).await;
                } else {
                    debug!("Client gone before endpoint reached");
                    drop(backend_end);
                }
                Err(e)
            }
        };

        let _ = tokio::join!(user, server);
        debug!("Piping session done");
        result
    }
}

/// Pipe the backend end of the relay buffer to and from the master.
async fn relay(
    backend: TcpStream,
    backend_end: DuplexStream,
    config: &RelayConfig,
    hangup: &CancellationToken,
    stats: &ListenerStats,
) {
    let (backend_read, backend_write) = backend.into_split();
    let (relay_read, relay_write) = tokio::io::split(backend_end);

    let to_backend = tokio::spawn(pipe(
        relay_read,
        backend_write,
        "Client",
        hangup.clone(),
        OnHangup::Drain(config.drain_grace),
    ));
    let from_backend = pipe(
        backend_read,
        relay_write,
        "Endpoint",
        hangup.clone(),
        OnHangup::Abort,
    )
    .await;
    let to_backend = to_backend.await.unwrap_or(0);

    stats
        .bytes_to_backend
        .fetch_add(to_backend, Ordering::Relaxed);
    stats
        .bytes_from_backend
        .fetch_add(from_backend, Ordering::Relaxed);

    debug!(
        bytes_to_backend = to_backend,
        bytes_from_backend = from_backend,
        "Connection closed"
    );
}

/// Write a dial failure to the client through the relay, then close it.
async fn report(mut backend_end: DuplexStream, error: &DialError) {
    let message = format!("Failed to contact endpoint - {}\r\n", error);
    if let Err(e) = backend_end.write_all(message.as_bytes()).await {
        debug!(error = %e, "Could not report dial failure to client");
    }
    let _ = backend_end.shutdown().await;
}

/// Connect to the cached master, retrying until the deadline or a client hangup.
async fn dial(
    cache: &MasterCache,
    config: &RelayConfig,
    hangup: &CancellationToken,
    stats: &ListenerStats,
) -> Result<(TcpStream, String), DialError> {
    let addr = cache.get().ok_or(DialError::MasterUnknown)?;
    debug!(backend_addr = %addr, "Dialing master");

    let deadline = Instant::now() + config.dial_deadline;
    let mut attempts = 0u32;

    loop {
        if hangup.is_cancelled() {
            return Err(DialError::ClientHangup);
        }

        attempts += 1;
        stats.dial_attempts.fetch_add(1, Ordering::Relaxed);

        let budget = config
            .connect_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let attempt = tokio::select! {
            _ = hangup.cancelled() => return Err(DialError::ClientHangup),
            attempt = timeout(budget, TcpStream::connect(addr.as_str())) => attempt,
        };

        let error = match attempt {
            Ok(Ok(stream)) => return Ok((stream, addr)),
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
        };
        debug!(backend_addr = %addr, attempt = attempts, error = %error, "Failed to connect");

        if Instant::now() + config.retry_interval >= deadline {
            return Err(DialError::Connect {
                addr,
                attempts,
                last_error: error,
            });
        }

        tokio::select! {
            _ = hangup.cancelled() => return Err(DialError::ClientHangup),
            _ = sleep(config.retry_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn dead_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    fn fast_config() -> RelayConfig {
        RelayConfig {
            connect_timeout: Duration::from_millis(200),
            dial_deadline: Duration::from_millis(400),
            retry_interval: Duration::from_millis(50),
            drain_grace: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.dial_deadline, DEFAULT_DIAL_DEADLINE);
        assert_eq!(config.retry_interval, DEFAULT_RETRY_INTERVAL);
        assert_eq!(config.drain_grace, DEFAULT_DRAIN_GRACE);
    }

    #[tokio::test]
    async fn test_dial_unknown_master() {
        let stats = ListenerStats::default();
        let err = dial(
            &MasterCache::new(),
            &fast_config(),
            &CancellationToken::new(),
            &stats,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DialError::MasterUnknown));
        assert_eq!(stats.dial_attempts.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_dial_connects_to_cached_master() {
        let master = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let master_addr = master.local_addr().unwrap().to_string();

        let cache = MasterCache::new();
        cache.set(master_addr.clone());

        let stats = ListenerStats::default();
        let (_stream, addr) = dial(&cache, &fast_config(), &CancellationToken::new(), &stats)
            .await
            .unwrap();

        assert_eq!(addr, master_addr);
        assert_eq!(stats.dial_attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_dial_gives_up_after_deadline() {
        let cache = MasterCache::new();
        cache.set(dead_addr().await);

        let stats = ListenerStats::default();
        let started = Instant::now();
        let err = dial(&cache, &fast_config(), &CancellationToken::new(), &stats)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        match err {
            DialError::Connect { attempts, .. } => {
                assert!(attempts >= 2, "only {} attempts", attempts);
                assert_eq!(stats.dial_attempts.load(Ordering::Relaxed), attempts as u64);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dial_stops_on_hangup() {
        let cache = MasterCache::new();
        cache.set(dead_addr().await);

        let mut config = fast_config();
        config.dial_deadline = Duration::from_secs(30);

        let hangup = CancellationToken::new();
        let stats = Arc::new(ListenerStats::default());

        let handle = {
            let hangup = hangup.clone();
            let stats = Arc::clone(&stats);
            tokio::spawn(async move { dial(&cache, &config, &hangup, &stats).await })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        hangup.cancel();

        let err = timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, DialError::ClientHangup));

        let attempts = stats.dial_attempts.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(stats.dial_attempts.load(Ordering::Relaxed), attempts);
    }
}
