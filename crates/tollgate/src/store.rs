//! Durable key/value facts the engine reads and writes.
//!
//! Only one key is used: [`LAST_PROVIDER_KEY`], the name of the provider the
//! last successful selection picked. It is read at the start of every
//! selection cycle and written on every successful one.

use std::sync::Arc;

use dashmap::DashMap;

/// Key under which the winning provider's name is stored.
pub const LAST_PROVIDER_KEY: &str = "tollgate.last_provider";

/// Key/value storage that survives application restarts.
///
/// Writes are best effort: a failing store logs and carries on, the engine
/// simply loses its preference for the next launch.
pub trait PreferenceStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;

    fn put(&self, key: &str, value: &str);

    fn remove(&self, key: &str);
}

/// In-memory store. Clones share their contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already remembers `provider` as the last winner.
    pub fn with_last_provider(provider: &str) -> Self {
        let store = Self::new();
        store.put(LAST_PROVIDER_KEY, provider);
        store
    }
}

impl PreferenceStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    fn put(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.remove(key);
    }
}
