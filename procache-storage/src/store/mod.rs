//! Persistent store abstraction.
//!
//! Two keyed namespaces: *timestamps* (bucket → server timestamp) and
//! *cache* (bucket → specific-key map). Both apply latest-wins inside a
//! single transaction so concurrent writers cannot interleave a stale
//! value past a fresh one.
//!
//! Store failures never fail a read or a fetch: callers go through
//! [`StoreHandle`], which logs a warning and substitutes a benign value,
//! degrading the runtime to memory-only operation.

mod lmdb;
mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use procache_core::{BucketMap, CacheEntry, ServerTimestamp, StoreError};

pub use lmdb::LmdbStore;
pub use memory::MemoryStore;

/// Durable key/value backing for the cache.
///
/// Implementations must provide atomic read-modify-write per call: the
/// latest-wins comparisons in `set_timestamp` and `set_cache` happen
/// inside one transaction.
#[async_trait]
pub trait PersistentStore: Send + Sync + 'static {
    /// Record a bucket's server timestamp. Latest-wins: values at or
    /// below the stored one are dropped.
    async fn set_timestamp(&self, bucket: &str, ts: ServerTimestamp) -> Result<(), StoreError>;

    async fn get_timestamp(&self, bucket: &str) -> Result<Option<ServerTimestamp>, StoreError>;

    async fn all_timestamps(&self) -> Result<HashMap<String, ServerTimestamp>, StoreError>;

    /// Forget a bucket's timestamp entirely. Used when the server stops
    /// listing a bucket, as opposed to advancing it.
    async fn delete_timestamp(&self, bucket: &str) -> Result<(), StoreError>;

    /// Insert an entry into a bucket map. Latest-wins per entry: an
    /// existing entry with a strictly newer timestamp survives.
    async fn set_cache(&self, bucket: &str, key: &str, entry: CacheEntry)
        -> Result<(), StoreError>;

    async fn get_cache(&self, bucket: &str, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    async fn get_bucket(&self, bucket: &str) -> Result<Option<BucketMap>, StoreError>;

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    /// Names of every bucket present in the cache namespace.
    async fn all_bucket_keys(&self) -> Result<Vec<String>, StoreError>;

    async fn clear_cache(&self) -> Result<(), StoreError>;

    async fn clear_timestamps(&self) -> Result<(), StoreError>;

    async fn clear_all(&self) -> Result<(), StoreError>;
}

/// Shared, failure-swallowing view of a [`PersistentStore`].
///
/// Every method degrades an `Err` into a logged warning plus the benign
/// value for its shape, so the cache path never propagates store trouble.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn PersistentStore>,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { inner: store }
    }

    pub async fn set_timestamp(&self, bucket: &str, ts: ServerTimestamp) {
        if let Err(e) = self.inner.set_timestamp(bucket, ts).await {
            warn!(bucket, error = %e, "store set_timestamp failed");
        }
    }

    pub async fn get_timestamp(&self, bucket: &str) -> Option<ServerTimestamp> {
        match self.inner.get_timestamp(bucket).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(bucket, error = %e, "store get_timestamp failed");
                None
            }
        }
    }

    pub async fn all_timestamps(&self) -> HashMap<String, ServerTimestamp> {
        match self.inner.all_timestamps().await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "store all_timestamps failed");
                HashMap::new()
            }
        }
    }

    pub async fn delete_timestamp(&self, bucket: &str) {
        if let Err(e) = self.inner.delete_timestamp(bucket).await {
            warn!(bucket, error = %e, "store delete_timestamp failed");
        }
    }

    pub async fn set_cache(&self, bucket: &str, key: &str, entry: CacheEntry) {
        if let Err(e) = self.inner.set_cache(bucket, key, entry).await {
            warn!(bucket, key, error = %e, "store set_cache failed");
        }
    }

    pub async fn get_cache(&self, bucket: &str, key: &str) -> Option<CacheEntry> {
        match self.inner.get_cache(bucket, key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(bucket, key, error = %e, "store get_cache failed");
                None
            }
        }
    }

    pub async fn get_bucket(&self, bucket: &str) -> Option<BucketMap> {
        match self.inner.get_bucket(bucket).await {
            Ok(map) => map,
            Err(e) => {
                warn!(bucket, error = %e, "store get_bucket failed");
                None
            }
        }
    }

    pub async fn delete_bucket(&self, bucket: &str) {
        if let Err(e) = self.inner.delete_bucket(bucket).await {
            warn!(bucket, error = %e, "store delete_bucket failed");
        }
    }

    pub async fn all_bucket_keys(&self) -> Vec<String> {
        match self.inner.all_bucket_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "store all_bucket_keys failed");
                Vec::new()
            }
        }
    }

    pub async fn clear_cache(&self) {
        if let Err(e) = self.inner.clear_cache().await {
            warn!(error = %e, "store clear_cache failed");
        }
    }

    pub async fn clear_timestamps(&self) {
        if let Err(e) = self.inner.clear_timestamps().await {
            warn!(error = %e, "store clear_timestamps failed");
        }
    }

    pub async fn clear_all(&self) {
        if let Err(e) = self.inner.clear_all().await {
            warn!(error = %e, "store clear_all failed");
        }
    }
}
