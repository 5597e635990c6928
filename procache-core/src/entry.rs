//! Cache entry and bucket types.
//!
//! The cache key space is two-level: a *bucket* (route pattern, e.g.
//! `/users/{id}`) maps specific keys (concrete URLs) to entries. Buckets are
//! the unit of invalidation; specific keys are the unit of lookup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::time::{now_ms, ServerTimestamp};

/// A single cached value with its staleness metadata.
///
/// `timestamp` is the server-authoritative ordering key: a write only
/// replaces an existing entry when its timestamp is at least as new.
/// `expires_at` is the local TTL horizon in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cached payload. Any JSON value except `null` (the cache refuses
    /// to store nulls).
    pub data: serde_json::Value,
    /// Absolute expiry in epoch milliseconds.
    pub expires_at: i64,
    /// Server-authoritative timestamp in epoch milliseconds.
    pub timestamp: ServerTimestamp,
}

impl CacheEntry {
    /// Build an entry expiring `ttl_seconds` from now.
    pub fn new(data: serde_json::Value, ttl_seconds: u32, timestamp: ServerTimestamp) -> Self {
        Self {
            data,
            expires_at: now_ms() + i64::from(ttl_seconds) * 1000,
            timestamp,
        }
    }

    /// Whether the entry's TTL horizon has passed at `now` (epoch ms).
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// Whether the entry's TTL horizon has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Latest-wins comparison: does this entry replace `existing`?
    ///
    /// Equal timestamps replace (a re-fetch of the same server state is
    /// allowed to refresh the expiry); strictly older timestamps never do.
    pub fn supersedes(&self, existing: &CacheEntry) -> bool {
        self.timestamp >= existing.timestamp
    }
}

/// The specific-key map held by one bucket.
pub type BucketMap = HashMap<String, CacheEntry>;

/// A full cache dump exchanged during peer hydration: one element per
/// bucket, carrying that bucket's specific-key map.
pub type BucketDump = Vec<(String, BucketMap)>;
