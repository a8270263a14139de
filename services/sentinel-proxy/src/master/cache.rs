//! Shared slot for the last verified master address.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Last known-good master address.
///
/// Written by the watcher, read by every dialing session. Uses ArcSwap so
/// readers never block and always see a whole address, either the previous
/// one or the new one.
#[derive(Clone)]
pub struct MasterCache {
    slot: Arc<ArcSwapOption<String>>,
}

impl MasterCache {
    /// Create an empty cache. `get` returns `None` until the first `set`.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// Install a new address, returning the one it replaced.
    pub fn set(&self, addr: impl Into<String>) -> Option<Arc<String>> {
        self.slot.swap(Some(Arc::new(addr.into())))
    }

    /// Current address, if one has ever been set.
    pub fn get(&self) -> Option<String> {
        self.slot.load_full().map(|addr| addr.as_ref().clone())
    }

    pub fn is_known(&self) -> bool {
        self.slot.load().is_some()
    }
}

impl Default for MasterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MasterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterCache")
            .field("master", &self.get())
            .finish()
    }
}
