//! Master address tracking.
//!
//! The [`MasterWatcher`] is the only writer of the [`MasterCache`]; proxy
//! sessions only read it.

mod cache;
mod watcher;

pub use cache::MasterCache;
pub use watcher::{MasterWatcher, WatcherConfig};
