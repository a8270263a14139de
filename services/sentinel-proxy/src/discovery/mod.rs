//! Master discovery through Redis Sentinel.
//!
//! A discovery cycle asks Sentinel for the address of the monitored master and
//! then polls that node until it reports the master role:
//!
//! ```text
//! SENTINEL get-master-addr-by-name <monitor>  ->  [host, port]
//! INFO replication (every poll interval)      ->  role:master
//! ```

mod role;
mod sentinel;

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use redis::aio::MultiplexedConnection;
use redis::AsyncConnectionConfig;
use tokio::time::timeout;

pub use role::{reports_master, verify_master, ROLE_MASTER};
pub use sentinel::{master_addr_from_reply, SentinelClient};

use crate::error::DiscoveryError;

/// Delay between two role queries against a candidate.
pub const DEFAULT_ROLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Settings for talking to Sentinel and to candidate masters.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Sentinel `host:port`.
    pub address: String,
    /// Password used for Sentinel and for the redis nodes it reports.
    pub password: Option<String>,
    /// Monitor name of the tracked master.
    pub monitor_name: String,
    /// Bound on establishing (and authenticating) a connection.
    pub connect_timeout: Duration,
    /// Bound on a single reply.
    pub read_timeout: Duration,
    /// Bound on the whole role verification.
    pub master_wait: Duration,
    /// Pause between role queries.
    pub role_poll_interval: Duration,
}

impl SentinelConfig {
    pub fn new(address: impl Into<String>, monitor_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            password: None,
            monitor_name: monitor_name.into(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            master_wait: Duration::from_secs(30),
            role_poll_interval: DEFAULT_ROLE_POLL_INTERVAL,
        }
    }
}

/// Something that can name the current, verified master.
#[async_trait]
pub trait MasterSource: Send + Sync {
    async fn discover(&self) -> Result<String, DiscoveryError>;
}

#[async_trait]
impl MasterSource for SentinelClient {
    async fn discover(&self) -> Result<String, DiscoveryError> {
        SentinelClient::discover(self).await
    }
}

/// Why a redis connection could not be opened.
#[derive(Debug)]
pub(crate) enum ConnectFailure {
    Redis(redis::RedisError),
    TimedOut,
}

/// Build a `redis://` URL, percent-encoding the password.
pub(crate) fn redis_url(addr: &str, password: Option<&str>) -> String {
    match password {
        Some(password) => format!(
            "redis://:{}@{}",
            utf8_percent_encode(password, NON_ALPHANUMERIC),
            addr
        ),
        None => format!("redis://{}", addr),
    }
}

/// Connection settings for a node, carrying our timeouts instead of the client defaults.
pub(crate) fn connection_config(config: &SentinelConfig) -> AsyncConnectionConfig {
    AsyncConnectionConfig::new()
        .set_connection_timeout(Some(config.connect_timeout))
        .set_response_timeout(Some(config.read_timeout))
}

/// Open an authenticated connection to a redis or sentinel node.
pub(crate) async fn open_connection(
    addr: &str,
    config: &SentinelConfig,
) -> Result<MultiplexedConnection, ConnectFailure> {
    let client = redis::Client::open(redis_url(addr, config.password.as_deref()))
        .map_err(ConnectFailure::Redis)?;

    let connection = connection_config(config);
    let connect = client.get_multiplexed_async_connection_with_config(&connection);
    match timeout(config.connect_timeout, connect).await {
        Ok(result) => result.map_err(ConnectFailure::Redis),
        Err(_) => Err(ConnectFailure::TimedOut),
    }
}
