//! Sentinel queries.

use tokio::time::timeout;
use tracing::debug;

use super::{open_connection, role, ConnectFailure, SentinelConfig};
use crate::error::DiscoveryError;

/// Client for the Sentinel node that tracks the master.
#[derive(Debug, Clone)]
pub struct SentinelClient {
    config: SentinelConfig,
}

impl SentinelClient {
    pub fn new(config: SentinelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    /// Resolve the master through Sentinel and wait until it reports the master role.
    ///
    /// Returns the address exactly as `host:port` from Sentinel's reply.
    pub async fn discover(&self) -> Result<String, DiscoveryError> {
        let addr = self.query_master_addr().await?;
        debug!(master = %addr, "Sentinel reported master");

        role::verify_master(&addr, &self.config).await?;
        Ok(addr)
    }

    /// Ask Sentinel for the master address without verifying it.
    pub async fn query_master_addr(&self) -> Result<String, DiscoveryError> {
        let config = &self.config;
        debug!(
            sentinel = %config.address,
            monitor = %config.monitor_name,
            "Contacting sentinel for address of master"
        );

        let mut conn = open_connection(&config.address, config)
            .await
            .map_err(|failure| match failure {
                ConnectFailure::Redis(source) => DiscoveryError::Unreachable {
                    addr: config.address.clone(),
                    source,
                },
                ConnectFailure::TimedOut => DiscoveryError::Timeout {
                    addr: config.address.clone(),
                    timeout: config.connect_timeout,
                },
            })?;

        let mut cmd = redis::cmd("SENTINEL");
        cmd.arg("get-master-addr-by-name").arg(&config.monitor_name);
        let query = cmd.query_async::<Option<Vec<String>>>(&mut conn);

        let reply = timeout(config.read_timeout, query)
            .await
            .map_err(|_| DiscoveryError::Timeout {
                addr: config.address.clone(),
                timeout: config.read_timeout,
            })?
            .map_err(DiscoveryError::Query)?;

        master_addr_from_reply(&config.monitor_name, reply)
    }
}

/// Turn a get-master-addr-by-name reply into `host:port`.
pub fn master_addr_from_reply(
    monitor_name: &str,
    reply: Option<Vec<String>>,
) -> Result<String, DiscoveryError> {
    let fields = reply.ok_or_else(|| DiscoveryError::UnknownMonitor(monitor_name.to_string()))?;

    let [host, port] = fields.as_slice() else {
        return Err(DiscoveryError::MalformedReply(format!(
            "expected [host, port], got {} element(s)",
            fields.len()
        )));
    };

    if host.is_empty() {
        return Err(DiscoveryError::MalformedReply("empty host".to_string()));
    }
    if port.parse::<u16>().is_err() {
        return Err(DiscoveryError::MalformedReply(format!(
            "invalid port '{}'",
            port
        )));
    }

    Ok(format!("{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn reply(fields: &[&str]) -> Option<Vec<String>> {
        Some(fields.iter().map(|f| f.to_string()).collect())
    }

    #[rstest]
    #[case(&["127.0.0.1", "6380"], "127.0.0.1:6380")]
    #[case(&["10.1.2.3", "6379"], "10.1.2.3:6379")]
    #[case(&["redis-0.redis.svc", "7000"], "redis-0.redis.svc:7000")]
    fn test_master_addr_is_host_colon_port(#[case] fields: &[&str], #[case] expected: &str) {
        assert_eq!(master_addr_from_reply("mymaster", reply(fields)).unwrap(), expected);
    }

    #[test]
    fn test_nil_reply_is_unknown_monitor() {
        let err = master_addr_from_reply("mymaster", None).unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownMonitor(name) if name == "mymaster"));
    }

    #[rstest]
    #[case(&[])]
    #[case(&["127.0.0.1"])]
    #[case(&["127.0.0.1", "6380", "extra"])]
    #[case(&["", "6380"])]
    #[case(&["127.0.0.1", "not-a-port"])]
    #[case(&["127.0.0.1", "70000"])]
    fn test_malformed_replies(#[case] fields: &[&str]) {
        let err = master_addr_from_reply("mymaster", reply(fields)).unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedReply(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_unreachable_sentinel() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = SentinelConfig::new(addr, "mymaster");
        config.connect_timeout = std::time::Duration::from_secs(1);

        let err = SentinelClient::new(config).discover().await.unwrap_err();
        assert!(
            matches!(
                err,
                DiscoveryError::Unreachable { .. } | DiscoveryError::Timeout { .. }
            ),
            "{:?}",
            err
        );
    }
}
