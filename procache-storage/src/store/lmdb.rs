//! LMDB-backed persistent store.
//!
//! Uses the heed crate (Rust bindings for LMDB) with two named databases:
//! `timestamps` (bucket → big-endian i64) and `cache` (bucket → JSON
//! bucket map). Every logical operation is one LMDB transaction, so the
//! latest-wins comparisons cannot interleave with another writer.

use std::collections::HashMap;

use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};

use procache_core::{BucketMap, CacheEntry, DbConfig, ServerTimestamp, StoreError};

use super::PersistentStore;

/// Durable [`PersistentStore`] over an LMDB environment.
pub struct LmdbStore {
    env: Env,
    timestamps: Database<Str, Bytes>,
    cache: Database<Str, Bytes>,
}

impl LmdbStore {
    /// Open (or create) the store environment described by `config`.
    pub fn open(config: &DbConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(&config.path)
        }
        .map_err(|e| StoreError::EnvOpen {
            reason: e.to_string(),
        })?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let timestamps = env
            .create_database(&mut wtxn, Some(config.timestamp_db.as_str()))
            .map_err(|e| StoreError::DbOpen {
                name: config.timestamp_db.clone(),
                reason: e.to_string(),
            })?;
        let cache = env
            .create_database(&mut wtxn, Some(config.cache_db.as_str()))
            .map_err(|e| StoreError::DbOpen {
                name: config.cache_db.clone(),
                reason: e.to_string(),
            })?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            timestamps,
            cache,
        })
    }

    fn decode_map(bucket: &str, bytes: &[u8]) -> Result<BucketMap, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization {
            bucket: bucket.to_string(),
            reason: e.to_string(),
        })
    }

    fn encode_map(bucket: &str, map: &BucketMap) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(map).map_err(|e| StoreError::Serialization {
            bucket: bucket.to_string(),
            reason: e.to_string(),
        })
    }
}

fn txn_err(e: heed::Error) -> StoreError {
    StoreError::Transaction {
        reason: e.to_string(),
    }
}

fn decode_ts(bytes: &[u8]) -> Option<ServerTimestamp> {
    bytes.try_into().ok().map(i64::from_be_bytes)
}

#[async_trait]
impl PersistentStore for LmdbStore {
    async fn set_timestamp(&self, bucket: &str, ts: ServerTimestamp) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let current = self
            .timestamps
            .get(&wtxn, bucket)
            .map_err(txn_err)?
            .and_then(decode_ts);
        match current {
            Some(c) if ts <= c => Ok(()),
            _ => {
                self.timestamps
                    .put(&mut wtxn, bucket, &ts.to_be_bytes())
                    .map_err(txn_err)?;
                wtxn.commit().map_err(txn_err)
            }
        }
    }

    async fn get_timestamp(&self, bucket: &str) -> Result<Option<ServerTimestamp>, StoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        Ok(self
            .timestamps
            .get(&rtxn, bucket)
            .map_err(txn_err)?
            .and_then(decode_ts))
    }

    async fn all_timestamps(&self) -> Result<HashMap<String, ServerTimestamp>, StoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut out = HashMap::new();
        for item in self.timestamps.iter(&rtxn).map_err(txn_err)? {
            let (bucket, bytes) = item.map_err(txn_err)?;
            if let Some(ts) = decode_ts(bytes) {
                out.insert(bucket.to_string(), ts);
            }
        }
        Ok(out)
    }

    async fn delete_timestamp(&self, bucket: &str) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.timestamps.delete(&mut wtxn, bucket).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)
    }

    async fn set_cache(
        &self,
        bucket: &str,
        key: &str,
        entry: CacheEntry,
    ) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut map = match self.cache.get(&wtxn, bucket).map_err(txn_err)? {
            Some(bytes) => Self::decode_map(bucket, bytes)?,
            None => BucketMap::new(),
        };
        match map.get(key) {
            Some(existing) if !entry.supersedes(existing) => {
                // A newer entry is already stored; keep it.
                return Ok(());
            }
            _ => {
                map.insert(key.to_string(), entry);
            }
        }
        let encoded = Self::encode_map(bucket, &map)?;
        self.cache
            .put(&mut wtxn, bucket, &encoded)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)
    }

    async fn get_cache(&self, bucket: &str, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.get_bucket(bucket).await?.and_then(|mut m| m.remove(key)))
    }

    async fn get_bucket(&self, bucket: &str) -> Result<Option<BucketMap>, StoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.cache.get(&rtxn, bucket).map_err(txn_err)? {
            Some(bytes) => Ok(Some(Self::decode_map(bucket, bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.cache.delete(&mut wtxn, bucket).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)
    }

    async fn all_bucket_keys(&self) -> Result<Vec<String>, StoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut out = Vec::new();
        for item in self.cache.iter(&rtxn).map_err(txn_err)? {
            let (bucket, _) = item.map_err(txn_err)?;
            out.push(bucket.to_string());
        }
        Ok(out)
    }

    async fn clear_cache(&self) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.cache.clear(&mut wtxn).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)
    }

    async fn clear_timestamps(&self) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.timestamps.clear(&mut wtxn).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.cache.clear(&mut wtxn).map_err(txn_err)?;
        self.timestamps.clear(&mut wtxn).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)
    }
}
