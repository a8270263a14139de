//! L4 proxy towards the current master.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session -> relay buffer -> Master (from MasterCache)
//! ```
//!
//! The proxy never looks at the bytes it forwards.
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig};
//!
//! let cache = MasterCache::new();
//! let listener = Listener::bind(ListenerConfig::new("127.0.0.1:6379".parse()?), cache).await?;
//! Arc::new(listener).run().await?;
//! ```

mod listener;
mod pipe;
mod relay;

pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use pipe::{pipe, OnHangup, PipeEnd};
pub use relay::{
    RelayConfig, Session, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DIAL_DEADLINE, DEFAULT_DRAIN_GRACE,
    DEFAULT_RETRY_INTERVAL, RELAY_BUFFER_SIZE,
};
