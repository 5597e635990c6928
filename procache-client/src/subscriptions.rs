//! Subscriber registry with focus-aware dispatch.
//!
//! Two registries: per-key callbacks (keyed by bucket or specific key)
//! and global-invalidation callbacks. Notification is focus-aware: a
//! focused peer fires immediately; an unfocused one first waits for
//! focus, for another peer to refill the cache, or for a bounded delay,
//! and then fires. Background peers thereby avoid stampeding the network
//! and usually read the focused peer's fresh entry for free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use procache_core::Signal;
use procache_storage::CacheManager;

/// Callback invoked when a subscribed key (or everything) is invalidated.
pub type NotifyCallback = Arc<dyn Fn() + Send + Sync>;

/// Shared subscriber registry for one peer.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<SubsInner>,
}

struct SubsInner {
    per_key: Mutex<HashMap<String, Vec<Entry>>>,
    global: Mutex<Vec<Entry>>,
    route_delays: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
    focus: Signal<bool>,
    cache: CacheManager,
    poll_interval: Duration,
    default_max_wait: Duration,
}

struct Entry {
    id: u64,
    callback: NotifyCallback,
}

/// Handle returned by registration; `unsubscribe` removes exactly the
/// registration it came from, leaving duplicates of the same callback
/// untouched.
pub struct SubscriptionHandle {
    registry: Weak<SubsInner>,
    target: Target,
    id: u64,
}

enum Target {
    Key(String),
    Global,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        match &self.target {
            Target::Key(key) => {
                let mut per_key = inner.per_key.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entries) = per_key.get_mut(key) {
                    entries.retain(|e| e.id != self.id);
                    if entries.is_empty() {
                        per_key.remove(key);
                    }
                }
            }
            Target::Global => {
                inner
                    .global
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|e| e.id != self.id);
            }
        }
    }
}

impl SubscriptionRegistry {
    pub fn new(
        cache: CacheManager,
        focus: Signal<bool>,
        poll_interval: Duration,
        default_max_wait: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SubsInner {
                per_key: Mutex::new(HashMap::new()),
                global: Mutex::new(Vec::new()),
                route_delays: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                focus,
                cache,
                poll_interval,
                default_max_wait,
            }),
        }
    }

    /// Register a callback for one key (bucket or specific URL).
    pub fn subscribe(&self, key: impl Into<String>, callback: NotifyCallback) -> SubscriptionHandle {
        let key = key.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .per_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default()
            .push(Entry { id, callback });
        SubscriptionHandle {
            registry: Arc::downgrade(&self.inner),
            target: Target::Key(key),
            id,
        }
    }

    /// Register a callback for global invalidations (full purges, coming
    /// back online).
    pub fn subscribe_global(&self, callback: NotifyCallback) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .global
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Entry { id, callback });
        SubscriptionHandle {
            registry: Arc::downgrade(&self.inner),
            target: Target::Global,
            id,
        }
    }

    /// Record a per-route cap on the background wait for `key`.
    pub fn set_route_delay(&self, key: impl Into<String>, max_wait_ms: u64) {
        self.inner
            .route_delays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), max_wait_ms);
    }

    /// Notify subscribers of `key`, focus-aware: fire immediately when
    /// focused, otherwise poll in the background first.
    pub fn notify_key(&self, key: &str) {
        if self.inner.focus.get() {
            self.fire_key(key);
            return;
        }
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            inner.background_wait(&key).await;
            inner.fire_key(&key);
        });
    }

    /// Fire subscribers of `key` immediately, ignoring focus.
    pub fn fire_key(&self, key: &str) {
        self.inner.fire_key(key);
    }

    /// Fire every global-invalidation callback.
    pub fn fire_global(&self) {
        self.inner.fire_global();
    }

    /// Notify every registered key, focus-aware. Used when the server
    /// drops the whole bucket set.
    pub fn notify_all(&self) {
        let keys: Vec<String> = self
            .inner
            .per_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for key in keys {
            self.notify_key(&key);
        }
    }

    /// Number of live registrations for `key` (test support).
    pub fn key_subscriber_count(&self, key: &str) -> usize {
        self.inner
            .per_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl SubsInner {
    fn fire_key(&self, key: &str) {
        let callbacks: Vec<NotifyCallback> = {
            let per_key = self.per_key.lock().unwrap_or_else(|e| e.into_inner());
            per_key
                .get(key)
                .map(|entries| entries.iter().map(|e| Arc::clone(&e.callback)).collect())
                .unwrap_or_default()
        };
        debug!(key, count = callbacks.len(), "firing key subscribers");
        for callback in callbacks {
            callback();
        }
    }

    fn fire_global(&self) {
        let callbacks: Vec<NotifyCallback> = {
            let global = self.global.lock().unwrap_or_else(|e| e.into_inner());
            global.iter().map(|e| Arc::clone(&e.callback)).collect()
        };
        debug!(count = callbacks.len(), "firing global subscribers");
        for callback in callbacks {
            callback();
        }
    }

    fn max_wait(&self, key: &str) -> Duration {
        self.route_delays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(self.default_max_wait)
    }

    /// Wait until focus returns, the cache refills for `key`, or the
    /// per-route deadline passes, whichever happens first.
    async fn background_wait(&self, key: &str) {
        let started = Instant::now();
        let deadline = self.max_wait(key);
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if self.focus.get() {
                debug!(key, "background wait ended: focus regained");
                return;
            }
            if self.cache.find(key).await.is_some() {
                debug!(key, "background wait ended: cache refilled");
                return;
            }
            if started.elapsed() >= deadline {
                debug!(key, "background wait ended: deadline");
                return;
            }
        }
    }
}
