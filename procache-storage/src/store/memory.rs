//! In-memory store backend.
//!
//! Reference behavior for tests and the degraded mode when no durable
//! store can be opened. Shares the latest-wins contracts of the LMDB
//! backend exactly.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use procache_core::{BucketMap, CacheEntry, ServerTimestamp, StoreError};

use super::PersistentStore;

/// Volatile [`PersistentStore`] over two locked maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    timestamps: RwLock<HashMap<String, ServerTimestamp>>,
    cache: RwLock<HashMap<String, BucketMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn set_timestamp(&self, bucket: &str, ts: ServerTimestamp) -> Result<(), StoreError> {
        let mut timestamps = self.timestamps.write().unwrap_or_else(|e| e.into_inner());
        match timestamps.get(bucket) {
            Some(current) if ts <= *current => {}
            _ => {
                timestamps.insert(bucket.to_string(), ts);
            }
        }
        Ok(())
    }

    async fn get_timestamp(&self, bucket: &str) -> Result<Option<ServerTimestamp>, StoreError> {
        Ok(self
            .timestamps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(bucket)
            .copied())
    }

    async fn all_timestamps(&self) -> Result<HashMap<String, ServerTimestamp>, StoreError> {
        Ok(self
            .timestamps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn delete_timestamp(&self, bucket: &str) -> Result<(), StoreError> {
        self.timestamps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(bucket);
        Ok(())
    }

    async fn set_cache(
        &self,
        bucket: &str,
        key: &str,
        entry: CacheEntry,
    ) -> Result<(), StoreError> {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let map = cache.entry(bucket.to_string()).or_default();
        match map.get(key) {
            Some(existing) if !entry.supersedes(existing) => {}
            _ => {
                map.insert(key.to_string(), entry);
            }
        }
        Ok(())
    }

    async fn get_cache(&self, bucket: &str, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(bucket)
            .and_then(|map| map.get(key))
            .cloned())
    }

    async fn get_bucket(&self, bucket: &str) -> Result<Option<BucketMap>, StoreError> {
        Ok(self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(bucket)
            .cloned())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(bucket);
        Ok(())
    }

    async fn all_bucket_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    async fn clear_cache(&self) -> Result<(), StoreError> {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    async fn clear_timestamps(&self) -> Result<(), StoreError> {
        self.timestamps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.clear_cache().await?;
        self.clear_timestamps().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_timestamp_latest_wins() {
        let store = MemoryStore::new();
        store.set_timestamp("/b", 100).await.unwrap();
        store.set_timestamp("/b", 90).await.unwrap();
        assert_eq!(store.get_timestamp("/b").await.unwrap(), Some(100));

        store.set_timestamp("/b", 100).await.unwrap();
        assert_eq!(store.get_timestamp("/b").await.unwrap(), Some(100));

        store.set_timestamp("/b", 110).await.unwrap();
        assert_eq!(store.get_timestamp("/b").await.unwrap(), Some(110));
    }

    #[tokio::test]
    async fn test_cache_latest_wins_per_entry() {
        let store = MemoryStore::new();
        store
            .set_cache("/u/{id}", "/u/1", CacheEntry::new(json!("a"), 60, 100))
            .await
            .unwrap();
        store
            .set_cache("/u/{id}", "/u/1", CacheEntry::new(json!("b"), 60, 90))
            .await
            .unwrap();

        let entry = store.get_cache("/u/{id}", "/u/1").await.unwrap().unwrap();
        assert_eq!(entry.data, json!("a"));
        assert_eq!(entry.timestamp, 100);
    }

    #[tokio::test]
    async fn test_bucket_operations() {
        let store = MemoryStore::new();
        store
            .set_cache("/a", "/a/1", CacheEntry::new(json!(1), 60, 1))
            .await
            .unwrap();
        store
            .set_cache("/a", "/a/2", CacheEntry::new(json!(2), 60, 1))
            .await
            .unwrap();
        store
            .set_cache("/b", "/b/1", CacheEntry::new(json!(3), 60, 1))
            .await
            .unwrap();

        let bucket = store.get_bucket("/a").await.unwrap().unwrap();
        assert_eq!(bucket.len(), 2);

        let mut keys = store.all_bucket_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["/a", "/b"]);

        store.delete_bucket("/a").await.unwrap();
        assert!(store.get_bucket("/a").await.unwrap().is_none());
        assert!(store.get_bucket("/b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_operations() {
        let store = MemoryStore::new();
        store.set_timestamp("/a", 1).await.unwrap();
        store
            .set_cache("/a", "/a/1", CacheEntry::new(json!(1), 60, 1))
            .await
            .unwrap();

        store.clear_cache().await.unwrap();
        assert!(store.all_bucket_keys().await.unwrap().is_empty());
        assert_eq!(store.get_timestamp("/a").await.unwrap(), Some(1));

        store.clear_all().await.unwrap();
        assert!(store.all_timestamps().await.unwrap().is_empty());
    }
}
