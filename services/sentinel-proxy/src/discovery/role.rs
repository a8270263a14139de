//! Role verification of a candidate master.
//!
//! Sentinel may name a replica that is still being promoted. The candidate is
//! only handed out once its own `INFO replication` output says `role:master`.

use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

use super::{open_connection, ConnectFailure, SentinelConfig};
use crate::error::VerificationError;

/// Line in `INFO replication` output carried by a master.
pub const ROLE_MASTER: &str = "role:master";

/// Whether an `INFO replication` reply describes a master.
pub fn reports_master(info: &str) -> bool {
    info.lines().any(|line| line.trim() == ROLE_MASTER)
}

/// Poll `addr` until it reports the master role or `config.master_wait` runs out.
pub async fn verify_master(addr: &str, config: &SentinelConfig) -> Result<(), VerificationError> {
    let mut conn = open_connection(addr, config)
        .await
        .map_err(|failure| match failure {
            ConnectFailure::Redis(source) => VerificationError::Unreachable {
                addr: addr.to_string(),
                source,
            },
            ConnectFailure::TimedOut => VerificationError::ConnectTimeout {
                addr: addr.to_string(),
            },
        })?;

    let poll = async {
        let mut polls = 0u32;
        loop {
            polls += 1;
            let mut cmd = redis::cmd("INFO");
            cmd.arg("replication");
            let query = cmd.query_async::<String>(&mut conn);

            let info = match timeout(config.read_timeout, query).await {
                Ok(Ok(info)) => info,
                Ok(Err(e)) => {
                    return Err(VerificationError::Query {
                        addr: addr.to_string(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(VerificationError::Query {
                        addr: addr.to_string(),
                        reason: format!("no reply within {:?}", config.read_timeout),
                    })
                }
            };

            if reports_master(&info) {
                debug!(master = %addr, polls, "Master verified");
                return Ok(());
            }

            trace!(candidate = %addr, polls, "Candidate has not transitioned to master yet");
            sleep(config.role_poll_interval).await;
        }
    };

    match timeout(config.master_wait, poll).await {
        Ok(result) => result,
        Err(_) => Err(VerificationError::Timeout {
            addr: addr.to_string(),
            waited: config.master_wait,
        }),
    }
}
