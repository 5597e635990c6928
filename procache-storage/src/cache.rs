//! Cache manager: the in-memory mirror of the persistent store.
//!
//! Two-level mapping (bucket → specific key → entry) with latest-wins
//! writes, lazy rehydration from the store, and cross-peer mirroring over
//! the realm bus:
//!
//! - own writes go memory → store → `cache-set` broadcast;
//! - peer `cache-set` / `cache-invalidate` are applied locally and never
//!   rebroadcast;
//! - a fresh peer asks the realm for a dump (`cache-request`) and merges
//!   the first matching `cache-response`; `wait_for_sync` gates readers
//!   on that hydration, bounded by a short timeout when nobody answers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use procache_core::{
    now_ms, BroadcastBus, BucketDump, BucketMap, BusMessage, CacheEntry, CacheError, PeerId,
    ServerTimestamp, Signal,
};

use crate::store::StoreHandle;

/// Shared cache layer for one peer. Cloning shares the same cache.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    store: StoreHandle,
    bus: BroadcastBus,
    memory: RwLock<HashMap<String, BucketMap>>,
    synced: Signal<bool>,
}

impl CacheManager {
    /// Build the cache layer and start its bus listener and hydration.
    ///
    /// Must run inside a tokio runtime. `sync_timeout` bounds how long
    /// `wait_for_sync` blocks when no peer answers the hydration request.
    pub fn new(store: StoreHandle, bus: BroadcastBus, sync_timeout: Duration) -> Self {
        let inner = Arc::new(CacheInner {
            store,
            bus: bus.clone(),
            memory: RwLock::new(HashMap::new()),
            synced: Signal::new(false),
        });

        let listener = Arc::clone(&inner);
        let mut sub = bus.subscribe();
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                listener.handle_peer_message(msg).await;
            }
        });

        // Ask existing peers for their contents; give up after the
        // timeout so a lone peer does not stall its first read.
        inner.bus.publish(BusMessage::CacheRequest {
            request_id: inner.bus.peer(),
        });
        let synced = inner.synced.clone();
        tokio::spawn(async move {
            tokio::time::sleep(sync_timeout).await;
            synced.set(true);
        });

        Self { inner }
    }

    /// The peer id this cache publishes as.
    pub fn peer(&self) -> PeerId {
        self.inner.bus.peer()
    }

    /// Resolves once hydration (or its timeout) has completed.
    pub async fn wait_for_sync(&self) {
        self.inner.synced.wait_for(|s| *s).await;
    }

    /// Write an entry: memory (latest-wins), store, then broadcast.
    pub async fn set(
        &self,
        bucket: &str,
        key: &str,
        data: serde_json::Value,
        ttl_seconds: u32,
        timestamp: ServerTimestamp,
    ) -> Result<(), CacheError> {
        if data.is_null() {
            return Err(CacheError::NullData {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if ttl_seconds == 0 {
            return Err(CacheError::InvalidTtl {
                bucket: bucket.to_string(),
                key: key.to_string(),
                ttl_seconds,
            });
        }

        let entry = CacheEntry::new(data, ttl_seconds, timestamp);
        self.inner.apply_entry(bucket, key, entry.clone()).await;
        self.inner.store.set_cache(bucket, key, entry.clone()).await;
        self.inner.bus.publish(BusMessage::CacheSet {
            bucket: bucket.to_string(),
            key: key.to_string(),
            data: entry.data,
            expiry: entry.expires_at,
            timestamp: entry.timestamp,
        });
        Ok(())
    }

    /// Read a specific key. Expired entries are evicted from memory and
    /// read as misses; memory misses fall back to the store.
    pub async fn get(&self, bucket: &str, key: &str) -> Option<serde_json::Value> {
        let now = now_ms();

        let cached = {
            let memory = self.inner.memory.read().await;
            memory.get(bucket).and_then(|m| m.get(key)).cloned()
        };
        if let Some(entry) = cached {
            if entry.is_expired_at(now) {
                let mut memory = self.inner.memory.write().await;
                if let Some(map) = memory.get_mut(bucket) {
                    // Re-check under the write lock; a fresher entry may
                    // have landed in between.
                    if map.get(key).is_some_and(|e| e.is_expired_at(now)) {
                        map.remove(key);
                    }
                }
                return None;
            }
            return Some(entry.data);
        }

        let entry = self.inner.store.get_cache(bucket, key).await?;
        if entry.is_expired_at(now) {
            return None;
        }
        let mut memory = self.inner.memory.write().await;
        let map = memory.entry(bucket.to_string()).or_default();
        match map.get(key) {
            Some(existing) if !entry.supersedes(existing) => Some(existing.data.clone()),
            _ => {
                let data = entry.data.clone();
                map.insert(key.to_string(), entry);
                Some(data)
            }
        }
    }

    /// Search every bucket for a specific key. Memory first, then the
    /// slow path over all store buckets. Used when only the key is known
    /// (background refill checks).
    pub async fn find(&self, key: &str) -> Option<serde_json::Value> {
        let now = now_ms();
        {
            let memory = self.inner.memory.read().await;
            for map in memory.values() {
                if let Some(entry) = map.get(key) {
                    if !entry.is_expired_at(now) {
                        return Some(entry.data.clone());
                    }
                }
            }
        }
        for bucket in self.inner.store.all_bucket_keys().await {
            if let Some(entry) = self.inner.store.get_cache(&bucket, key).await {
                if !entry.is_expired_at(now) {
                    return Some(entry.data);
                }
            }
        }
        None
    }

    /// Drop a bucket everywhere and tell the other peers.
    pub async fn invalidate(&self, bucket: &str) {
        self.inner.invalidate_local(bucket).await;
        self.inner.bus.publish(BusMessage::CacheInvalidate {
            bucket: bucket.to_string(),
        });
    }

    /// Drop every cached bucket (memory + store cache namespace).
    pub async fn clear(&self) {
        self.inner.memory.write().await.clear();
        self.inner.store.clear_cache().await;
    }

    /// Drop everything including stored timestamps. Used when the server
    /// re-asserts an empty bucket set.
    pub async fn purge(&self) {
        self.inner.memory.write().await.clear();
        self.inner.store.clear_all().await;
    }

    /// Drop the in-memory mirror only (the store was already handled by
    /// the peer that initiated the purge).
    pub async fn clear_memory(&self) {
        self.inner.memory.write().await.clear();
    }

    /// Snapshot of the in-memory contents.
    pub async fn dump(&self) -> BucketDump {
        let memory = self.inner.memory.read().await;
        memory
            .iter()
            .map(|(bucket, map)| (bucket.clone(), map.clone()))
            .collect()
    }
}

impl CacheInner {
    async fn handle_peer_message(&self, msg: BusMessage) {
        match msg {
            BusMessage::CacheSet {
                bucket,
                key,
                data,
                expiry,
                timestamp,
            } => {
                // The writing peer already persisted it; mirror memory only.
                self.apply_entry(
                    &bucket,
                    &key,
                    CacheEntry {
                        data,
                        expires_at: expiry,
                        timestamp,
                    },
                )
                .await;
            }
            BusMessage::CacheInvalidate { bucket } => {
                self.invalidate_local(&bucket).await;
            }
            BusMessage::CacheRequest { request_id } => {
                let dump: BucketDump = {
                    let memory = self.memory.read().await;
                    memory
                        .iter()
                        .map(|(bucket, map)| (bucket.clone(), map.clone()))
                        .collect()
                };
                if dump.is_empty() {
                    return;
                }
                debug!(%request_id, buckets = dump.len(), "answering cache request");
                self.bus.publish(BusMessage::CacheResponse { request_id, dump });
            }
            BusMessage::CacheResponse { request_id, dump } => {
                if request_id != self.bus.peer() {
                    return;
                }
                self.merge_dump(dump).await;
                self.synced.set(true);
            }
            // Coordination traffic on a shared channel is not ours.
            _ => {}
        }
    }

    /// Latest-wins insert into memory.
    async fn apply_entry(&self, bucket: &str, key: &str, entry: CacheEntry) {
        let mut memory = self.memory.write().await;
        let map = memory.entry(bucket.to_string()).or_default();
        match map.get(key) {
            Some(existing) if !entry.supersedes(existing) => {
                debug!(bucket, key, "dropping stale cache write");
            }
            _ => {
                map.insert(key.to_string(), entry);
            }
        }
    }

    async fn invalidate_local(&self, bucket: &str) {
        self.memory.write().await.remove(bucket);
        self.store.delete_bucket(bucket).await;
    }

    async fn merge_dump(&self, dump: BucketDump) {
        let mut merged = 0usize;
        let mut memory = self.memory.write().await;
        for (bucket, map) in dump {
            let local = memory.entry(bucket).or_default();
            for (key, entry) in map {
                match local.get(&key) {
                    Some(existing) if !entry.supersedes(existing) => {}
                    _ => {
                        local.insert(key, entry);
                        merged += 1;
                    }
                }
            }
        }
        if merged > 0 {
            debug!(entries = merged, "merged peer cache dump");
        } else {
            warn!("peer cache dump contained nothing newer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, PersistentStore};
    use procache_core::Realm;
    use serde_json::json;
    use uuid::Uuid;

    const SYNC_TIMEOUT: Duration = Duration::from_millis(200);

    fn shared_store() -> (Arc<MemoryStore>, StoreHandle) {
        let store = Arc::new(MemoryStore::new());
        (Arc::clone(&store), StoreHandle::new(store))
    }

    fn manager(realm: &Realm, handle: StoreHandle) -> CacheManager {
        let bus = realm.channel("cache", Uuid::new_v4());
        CacheManager::new(handle, bus, SYNC_TIMEOUT)
    }

    /// Poll until `check` passes or the deadline lapses.
    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let realm = Realm::new();
        let (_store, handle) = shared_store();
        let cm = manager(&realm, handle);

        cm.set("/todos", "/todos?page=1", json!([1, 2]), 60, 100)
            .await
            .unwrap();
        assert_eq!(cm.get("/todos", "/todos?page=1").await, Some(json!([1, 2])));
        assert_eq!(cm.get("/todos", "/todos?page=2").await, None);
    }

    #[tokio::test]
    async fn test_rejects_null_and_zero_ttl() {
        let realm = Realm::new();
        let (_store, handle) = shared_store();
        let cm = manager(&realm, handle);

        let err = cm.set("/b", "/k", json!(null), 60, 1).await.unwrap_err();
        assert!(matches!(err, CacheError::NullData { .. }));

        let err = cm.set("/b", "/k", json!(1), 0, 1).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidTtl { .. }));
    }

    #[tokio::test]
    async fn test_latest_wins_on_set() {
        let realm = Realm::new();
        let (_store, handle) = shared_store();
        let cm = manager(&realm, handle);

        cm.set("/u/{id}", "/u/1", json!("a"), 60, 100).await.unwrap();
        cm.set("/u/{id}", "/u/1", json!("b"), 60, 90).await.unwrap();
        assert_eq!(cm.get("/u/{id}", "/u/1").await, Some(json!("a")));

        // Equal timestamp refreshes.
        cm.set("/u/{id}", "/u/1", json!("c"), 60, 100).await.unwrap();
        assert_eq!(cm.get("/u/{id}", "/u/1").await, Some(json!("c")));
    }

    #[tokio::test]
    async fn test_set_mirrors_to_peer_memory() {
        let realm = Realm::new();
        let (_store, handle) = shared_store();
        let a = manager(&realm, handle.clone());
        let b = manager(&realm, handle);

        a.set("/todos", "/todos", json!(1), 60, 5).await.unwrap();

        let b2 = b.clone();
        eventually(move || {
            let b = b2.clone();
            async move { !b.dump().await.is_empty() }
        })
        .await;
        assert_eq!(b.get("/todos", "/todos").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_invalidate_propagates() {
        let realm = Realm::new();
        let (_store, handle) = shared_store();
        let a = manager(&realm, handle.clone());
        let b = manager(&realm, handle);

        a.set("/todos", "/todos", json!(1), 60, 5).await.unwrap();
        let b2 = b.clone();
        eventually(move || {
            let b = b2.clone();
            async move { !b.dump().await.is_empty() }
        })
        .await;

        b.invalidate("/todos").await;
        let a2 = a.clone();
        eventually(move || {
            let a = a2.clone();
            async move { a.dump().await.is_empty() }
        })
        .await;
        assert_eq!(a.get("/todos", "/todos").await, None);
    }

    #[tokio::test]
    async fn test_peer_hydration() {
        let realm = Realm::new();
        let (_store, handle) = shared_store();
        let a = manager(&realm, handle.clone());
        a.set("/todos", "/todos", json!([1]), 60, 5).await.unwrap();

        let b = manager(&realm, handle);
        b.wait_for_sync().await;
        assert_eq!(b.get("/todos", "/todos").await, Some(json!([1])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_sync_times_out_alone() {
        let realm = Realm::new();
        let (_store, handle) = shared_store();
        let cm = manager(&realm, handle);
        // No peers: resolves via the timeout rather than hanging.
        cm.wait_for_sync().await;
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let realm = Realm::new();
        let (store, handle) = shared_store();
        let cm = manager(&realm, handle);

        store
            .set_cache(
                "/b",
                "/k",
                CacheEntry {
                    data: json!(1),
                    expires_at: now_ms() - 1000,
                    timestamp: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(cm.get("/b", "/k").await, None);
    }

    #[tokio::test]
    async fn test_get_falls_back_to_store() {
        let realm = Realm::new();
        let (store, handle) = shared_store();
        let cm = manager(&realm, handle);

        store
            .set_cache("/b", "/k", CacheEntry::new(json!("stored"), 60, 1))
            .await
            .unwrap();
        assert_eq!(cm.get("/b", "/k").await, Some(json!("stored")));
        // Second read comes from memory.
        assert_eq!(cm.get("/b", "/k").await, Some(json!("stored")));
    }

    #[tokio::test]
    async fn test_find_searches_memory_then_store() {
        let realm = Realm::new();
        let (store, handle) = shared_store();
        let cm = manager(&realm, handle);

        cm.set("/a", "/a/1", json!("mem"), 60, 1).await.unwrap();
        assert_eq!(cm.find("/a/1").await, Some(json!("mem")));

        store
            .set_cache("/zzz", "/zzz/9", CacheEntry::new(json!("disk"), 60, 1))
            .await
            .unwrap();
        assert_eq!(cm.find("/zzz/9").await, Some(json!("disk")));
        assert_eq!(cm.find("/missing").await, None);
    }

    #[tokio::test]
    async fn test_clear_and_purge() {
        let realm = Realm::new();
        let (store, handle) = shared_store();
        let cm = manager(&realm, handle);

        store.set_timestamp("/a", 9).await.unwrap();
        cm.set("/a", "/a/1", json!(1), 60, 9).await.unwrap();

        cm.clear().await;
        assert_eq!(cm.get("/a", "/a/1").await, None);
        assert_eq!(store.get_timestamp("/a").await.unwrap(), Some(9));

        cm.set("/a", "/a/1", json!(1), 60, 10).await.unwrap();
        cm.purge().await;
        assert_eq!(cm.get("/a", "/a/1").await, None);
        assert_eq!(store.get_timestamp("/a").await.unwrap(), None);
    }
}
