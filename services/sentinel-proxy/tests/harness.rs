//! Shared helpers for sentinel-proxy integration tests.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use sentinel_proxy::{
    Listener, ListenerConfig, MasterCache, MasterWatcher, RelayConfig, SentinelClient,
    SentinelConfig, WatcherConfig,
};
use sentinel_proxy_testing::MONITOR_NAME;

/// Sentinel settings with timeouts suited to local fakes.
#[allow(dead_code)]
pub fn sentinel_config(sentinel: SocketAddr) -> SentinelConfig {
    SentinelConfig {
        address: sentinel.to_string(),
        password: None,
        monitor_name: MONITOR_NAME.to_string(),
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(2),
        master_wait: Duration::from_secs(2),
        role_poll_interval: Duration::from_millis(20),
    }
}

#[allow(dead_code)]
pub fn relay_config() -> RelayConfig {
    RelayConfig {
        connect_timeout: Duration::from_millis(500),
        dial_deadline: Duration::from_secs(2),
        retry_interval: Duration::from_millis(50),
        drain_grace: Duration::from_millis(200),
    }
}

/// A running proxy listener.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub cache: MasterCache,
    pub listener: Arc<Listener>,
}

#[allow(dead_code)]
impl ProxyHandle {
    pub async fn spawn(cache: MasterCache, relay: RelayConfig) -> io::Result<Self> {
        let config = ListenerConfig::with_relay("127.0.0.1:0".parse().unwrap(), relay);
        let listener = Listener::bind(config, cache.clone())
            .await
            .map_err(io::Error::other)?;

        let listen_addr = listener.local_addr()?;
        let listener = Arc::new(listener);

        let running = Arc::clone(&listener);
        tokio::spawn(async move {
            let _ = running.run().await;
        });

        Ok(Self {
            listen_addr,
            cache,
            listener,
        })
    }
}

/// A running master watcher backed by a real Sentinel client.
#[allow(dead_code)]
pub struct WatcherHandle {
    pub cache: MasterCache,
    shutdown: CancellationToken,
}

#[allow(dead_code)]
impl WatcherHandle {
    pub fn spawn(sentinel: SocketAddr) -> Self {
        let cache = MasterCache::new();
        let shutdown = CancellationToken::new();

        let watcher = MasterWatcher::new(
            Arc::new(SentinelClient::new(sentinel_config(sentinel))),
            cache.clone(),
            WatcherConfig {
                poll_interval: Duration::from_millis(100),
                connect_timeout: Duration::from_secs(1),
            },
        );
        tokio::spawn(watcher.run(shutdown.clone()));

        Self { cache, shutdown }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Send one RESP command over an open connection and read the reply.
#[allow(dead_code)]
pub async fn request(stream: &mut TcpStream, command: &[u8]) -> io::Result<Vec<u8>> {
    stream.write_all(command).await?;
    let mut buf = vec![0u8; 1024];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply"))??;
    buf.truncate(n);
    Ok(buf)
}

/// Read until the proxy closes the connection.
#[allow(dead_code)]
pub async fn read_until_closed(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut received = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection left open"))??;
    Ok(received)
}
