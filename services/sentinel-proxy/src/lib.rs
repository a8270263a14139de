pub mod config;
pub mod discovery;
pub mod error;
pub mod master;
pub mod proxy;

pub use config::{Cli, Config, LogFormat};
pub use discovery::{MasterSource, SentinelClient, SentinelConfig};
pub use error::{DialError, DiscoveryError, ListenError, VerificationError};
pub use master::{MasterCache, MasterWatcher, WatcherConfig};
pub use proxy::{Listener, ListenerConfig, ListenerStats, RelayConfig};
