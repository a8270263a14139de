//! Error types for discovery, dialing and listening.
//!
//! Discovery and verification failures stay inside the master watcher.
//! Dial failures are reported to the affected client only. Listen failures
//! are fatal to the process.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure to resolve the current master through Sentinel.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Sentinel could not be reached or rejected authentication.
    #[error("failed to reach sentinel at '{addr}': {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: redis::RedisError,
    },

    /// Sentinel did not answer in time.
    #[error("sentinel at '{addr}' did not respond within {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    /// The get-master-addr-by-name query failed.
    #[error("get-master-addr-by-name failed: {0}")]
    Query(#[source] redis::RedisError),

    /// Sentinel does not know the monitor.
    #[error("sentinel has no master named '{0}'")]
    UnknownMonitor(String),

    /// The reply did not contain a usable host and port.
    #[error("malformed get-master-addr-by-name reply: {0}")]
    MalformedReply(String),

    /// The candidate never became usable.
    #[error("could not verify master: {0}")]
    Verification(#[from] VerificationError),
}

/// Failure to confirm that a candidate has finished transitioning to master.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The candidate could not be reached or rejected authentication.
    #[error("failed to reach redis at '{addr}': {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: redis::RedisError,
    },

    /// Connecting to the candidate took longer than the ready wait.
    #[error("timed out connecting to redis at '{addr}'")]
    ConnectTimeout { addr: String },

    /// The INFO query failed or timed out.
    #[error("failed to get INFO from '{addr}': {reason}")]
    Query { addr: String, reason: String },

    /// The candidate never reported the master role.
    #[error("timed out after {waited:?} waiting for '{addr}' to transition to master")]
    Timeout { addr: String, waited: Duration },
}

/// Failure to reach a backend on behalf of a client session.
#[derive(Debug, Error)]
pub enum DialError {
    /// No master has been discovered yet.
    #[error("address of master unknown")]
    MasterUnknown,

    /// Every connect attempt failed until the dial deadline passed.
    #[error("timed out trying to connect to '{addr}' after {attempts} attempts: {last_error}")]
    Connect {
        addr: String,
        attempts: u32,
        #[source]
        last_error: io::Error,
    },

    /// The client went away while the dial was still retrying.
    #[error("client disconnected before endpoint reached")]
    ClientHangup,
}

impl DialError {
    /// Whether the client should be told about this failure.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, DialError::ClientHangup)
    }
}

/// Failure of the public listener. Always fatal.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("failed to bind '{addr}': {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}
