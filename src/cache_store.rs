//! Storage for the latest known payload of every API key.
//!
//! [`CacheStore`] is the seam to an external cache (e.g., Redis or MongoDB). [`MemoryCacheStore`]
//! keeps everything in process memory and is suitable for single-instance deployments and tests.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{definitions::Payload, Result};

/// Cached payload for one API key.
///
/// Entries are immutable and can only be replaced completely.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: Arc<Payload>,
    /// When the payload was written to the cache.
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(payload: Arc<Payload>) -> CacheEntry {
        CacheEntry {
            payload,
            fetched_at: Utc::now(),
        }
    }
}

/// Cache backend used by the refresh pipeline.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get current entry for `api_key`. Returns `Ok(None)` if nothing was stored yet.
    async fn get(&self, api_key: &str) -> Result<Option<Arc<CacheEntry>>>;

    /// Replace the entry for `api_key` unconditionally.
    async fn set(&self, api_key: &str, payload: Arc<Payload>) -> Result<()>;
}

/// Thread-safe in-memory [`CacheStore`] allowing concurrent access for readers and writers.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
}

impl MemoryCacheStore {
    /// Create a new empty store.
    pub fn new() -> MemoryCacheStore {
        MemoryCacheStore::default()
    }

    /// Synchronous snapshot of the entry for `api_key`.
    pub fn entry(&self, api_key: &str) -> Option<Arc<CacheEntry>> {
        // Err() is only possible if the lock is poisoned (writer panicked while holding it).
        let entries = self
            .entries
            .read()
            .expect("thread holding cache lock should not panic");
        entries.get(api_key).cloned()
    }

    /// Number of API keys with a cached payload.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("thread holding cache lock should not panic")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, api_key: &str) -> Result<Option<Arc<CacheEntry>>> {
        Ok(self.entry(api_key))
    }

    async fn set(&self, api_key: &str, payload: Arc<Payload>) -> Result<()> {
        // Constructing new value before requesting the lock to minimize lock span.
        let entry = Arc::new(CacheEntry::new(payload));

        let mut entries = self
            .entries
            .write()
            .expect("thread holding cache lock should not panic");
        entries.insert(api_key.to_owned(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{CacheStore, MemoryCacheStore};
    use crate::definitions::Payload;

    fn payload(version: u64) -> Arc<Payload> {
        match json!({ "features": {}, "version": version }) {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn empty_store() {
        let store = MemoryCacheStore::new();
        assert!(store.get("key").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn set_replaces_entry() {
        let store = MemoryCacheStore::new();

        store.set("key", payload(1)).await.unwrap();
        let first = store.get("key").await.unwrap().unwrap();
        store.set("key", payload(2)).await.unwrap();
        let second = store.get("key").await.unwrap().unwrap();

        assert_eq!(first.payload, payload(1));
        assert_eq!(second.payload, payload(2));
        assert!(second.fetched_at >= first.fetched_at);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = MemoryCacheStore::new();
        store.set("a", payload(1)).await.unwrap();

        assert!(store.get("b").await.unwrap().is_none());
        assert_eq!(store.entry("a").unwrap().payload, payload(1));
    }

    #[test]
    fn can_set_entry_from_another_thread() {
        let store = Arc::new(MemoryCacheStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                runtime.block_on(store.set("key", payload(1))).unwrap();
            })
            .join();
        }

        assert!(store.entry("key").is_some());
    }
}
