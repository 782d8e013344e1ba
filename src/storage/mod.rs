//! Durable key/value storage and the read-through entity cache.
//!
//! The reconciliation engine persists its dictionary through
//! [`KeyValueStore`] and resolves record references through
//! [`EntityCache`]; it never touches a backend directly.

pub mod cache;
pub mod db;

use anyhow::Result;
use dashmap::DashMap;
use futures::future::BoxFuture;

pub use cache::{EntityCache, MemoryEntityCache};
pub use db::SqliteStore;

/// Async string key/value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>>;
    fn set(&self, key: &str, value: String) -> BoxFuture<'_, Result<()>>;
}

/// Process-local store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let value = self.entries.get(key).map(|v| v.clone());
        Box::pin(async move { Ok(value) })
    }

    fn set(&self, key: &str, value: String) -> BoxFuture<'_, Result<()>> {
        self.entries.insert(key.to_string(), value);
        Box::pin(async { Ok(()) })
    }
}
