//! Invalidation engine: interpreting upstream messages.
//!
//! Runs on the leader when the socket delivers a frame. Full syncs
//! re-assert the server's whole bucket set (unlisted buckets are removed
//! outright), deltas advance a subset, raw string keys invalidate a
//! single bucket, and anything else is handed to custom listeners and
//! relayed to followers.
//!
//! An application can pre-empt all of this with a [`MessageMiddleware`];
//! the middleware sees a narrow [`MessageContext`] capability object
//! rather than the coordinator itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use procache_core::{
    now_ms, BroadcastBus, BusMessage, ServerMessage, ServerTimestamp, Signal,
};
use procache_storage::{CacheManager, StoreHandle};

use crate::subscriptions::SubscriptionRegistry;

/// Maps an upstream route path to the local bucket key.
pub type RouteMapper = dyn Fn(&str) -> String + Send + Sync;

/// Callback for server messages outside the invalidation protocol.
pub type CustomCallback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Decides whether an incoming bucket timestamp should invalidate local
/// state. The default compares against the stored timestamp.
#[async_trait]
pub trait InvalidationPolicy: Send + Sync {
    async fn should_invalidate(
        &self,
        bucket: &str,
        incoming: ServerTimestamp,
        store: &StoreHandle,
    ) -> bool;
}

/// Invalidate when the stored timestamp is older or absent.
pub struct DefaultInvalidationPolicy;

#[async_trait]
impl InvalidationPolicy for DefaultInvalidationPolicy {
    async fn should_invalidate(
        &self,
        bucket: &str,
        incoming: ServerTimestamp,
        store: &StoreHandle,
    ) -> bool {
        match store.get_timestamp(bucket).await {
            Some(local) => local < incoming,
            None => true,
        }
    }
}

/// Whether a middleware consumed the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareOutcome {
    /// Done; the default handling is skipped.
    Handled,
    /// Fall through to the default handling.
    Continue,
}

/// Application middleware over the upstream message path.
#[async_trait]
pub trait MessageMiddleware: Send + Sync {
    async fn handle(&self, message: &ServerMessage, ctx: &MessageContext<'_>)
        -> MiddlewareOutcome;
}

/// The capabilities exposed to middleware.
pub struct MessageContext<'a> {
    engine: &'a InvalidationEngine,
}

impl MessageContext<'_> {
    /// The persistent store (failure-swallowing view).
    pub fn store(&self) -> &StoreHandle {
        &self.engine.inner.store
    }

    /// The cache manager.
    pub fn cache(&self) -> &CacheManager {
        &self.engine.inner.cache
    }

    /// Publish a message on the coordination channel.
    pub fn broadcast(&self, message: BusMessage) {
        self.engine.inner.bus.publish(message);
    }

    /// Fire subscribers of `key` immediately.
    pub fn trigger_subscribers(&self, key: &str) {
        self.engine.inner.subs.fire_key(key);
    }

    /// Notify subscribers of `key` through the focus-aware path.
    pub fn poll_subscribers(&self, key: &str) {
        self.engine.inner.subs.notify_key(key);
    }

    /// Map an upstream route path to the local bucket key.
    pub fn route_to_cache_key(&self, path: &str) -> String {
        self.engine.map_route(path)
    }

    /// Invalidate every local bucket that is not in `valid_keys`.
    pub async fn invalidate_except(&self, valid_keys: &[String]) {
        self.engine.invalidate_except(valid_keys).await;
    }

    /// Open the cache-serving gate (honors an explicit disconnect).
    pub async fn enable_cache(&self) {
        self.engine.enable_cache();
    }

    /// Log through the engine's facility.
    pub fn log(&self, message: &str) {
        info!(target: "procache::middleware", "{message}");
    }

    /// Run the default handling for `message`; the middleware can do
    /// work before and after.
    pub async fn default_handler(&self, message: &ServerMessage) {
        self.engine.default_handle(message).await;
    }
}

/// Shared invalidation engine for one peer.
#[derive(Clone)]
pub struct InvalidationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    cache: CacheManager,
    store: StoreHandle,
    bus: BroadcastBus,
    subs: SubscriptionRegistry,
    cache_enabled: Signal<bool>,
    explicitly_closed: Signal<bool>,
    policy: Arc<dyn InvalidationPolicy>,
    middleware: Option<Arc<dyn MessageMiddleware>>,
    route_mapper: Option<Arc<RouteMapper>>,
    custom: Mutex<Vec<(u64, CustomCallback)>>,
    next_custom_id: AtomicU64,
    last_drift: Mutex<Option<i64>>,
}

/// Handle for a registered custom-message listener.
pub struct CustomHandle {
    engine: Weak<EngineInner>,
    id: u64,
}

impl CustomHandle {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.engine.upgrade() {
            inner
                .custom
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl InvalidationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: CacheManager,
        store: StoreHandle,
        bus: BroadcastBus,
        subs: SubscriptionRegistry,
        cache_enabled: Signal<bool>,
        explicitly_closed: Signal<bool>,
        policy: Arc<dyn InvalidationPolicy>,
        middleware: Option<Arc<dyn MessageMiddleware>>,
        route_mapper: Option<Arc<RouteMapper>>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                cache,
                store,
                bus,
                subs,
                cache_enabled,
                explicitly_closed,
                policy,
                middleware,
                route_mapper,
                custom: Mutex::new(Vec::new()),
                next_custom_id: AtomicU64::new(0),
                last_drift: Mutex::new(None),
            }),
        }
    }

    /// Entry point for an upstream text frame (leader only).
    pub async fn handle_upstream(&self, text: &str) {
        let message = ServerMessage::parse(text);
        debug!(?message, "upstream message");

        if let Some(middleware) = self.inner.middleware.clone() {
            let ctx = MessageContext { engine: self };
            if middleware.handle(&message, &ctx).await == MiddlewareOutcome::Handled {
                return;
            }
        }
        self.default_handle(&message).await;
    }

    pub(crate) async fn default_handle(&self, message: &ServerMessage) {
        match message {
            ServerMessage::FullSync { data, drift_time } => {
                self.note_drift(*drift_time);
                self.full_sync(data).await;
            }
            ServerMessage::Delta { data, drift_time } => {
                self.note_drift(*drift_time);
                for (bucket, ts) in data {
                    let bucket = self.map_route(bucket);
                    self.invalidate_and_notify(&bucket, *ts).await;
                }
            }
            ServerMessage::SingleKey { key } => {
                let bucket = self.map_route(key);
                self.invalidate_and_notify(&bucket, now_ms()).await;
            }
            ServerMessage::Custom { payload } => {
                self.dispatch_custom(payload);
                self.inner.bus.publish(BusMessage::WsCustom {
                    payload: payload.clone(),
                });
            }
        }
    }

    /// Apply a full sync: the listed buckets advance (policy permitting),
    /// every unlisted local bucket is removed, and the cache gate opens.
    /// An empty listing purges everything.
    async fn full_sync(&self, data: &HashMap<String, ServerTimestamp>) {
        if data.is_empty() {
            info!("full sync with empty bucket set: purging cache");
            self.inner.cache.purge().await;
            self.inner.bus.publish(BusMessage::WsInvalidateAll);
            self.inner.subs.fire_global();
            self.enable_cache();
            return;
        }

        let mapped: HashMap<String, ServerTimestamp> = data
            .iter()
            .map(|(bucket, ts)| (self.map_route(bucket), *ts))
            .collect();

        for (bucket, ts) in &mapped {
            if self
                .inner
                .policy
                .should_invalidate(bucket, *ts, &self.inner.store)
                .await
            {
                self.invalidate_and_notify(bucket, *ts).await;
            }
        }

        // The server owns the bucket set: anything it stopped listing
        // goes away, timestamp included.
        for bucket in self.local_buckets().await {
            if !mapped.contains_key(&bucket) {
                self.remove_bucket(&bucket).await;
            }
        }

        self.enable_cache();
    }

    /// Advance a bucket's timestamp, drop its entries, tell the realm,
    /// and notify subscribers.
    pub(crate) async fn invalidate_and_notify(&self, bucket: &str, ts: ServerTimestamp) {
        self.inner.store.set_timestamp(bucket, ts).await;
        self.inner.cache.invalidate(bucket).await;
        self.inner.bus.publish(BusMessage::WsInvalidate {
            key: bucket.to_string(),
            timestamp: ts,
        });
        self.inner.subs.notify_key(bucket);
    }

    /// Remove a bucket the server no longer lists: cache entries and
    /// timestamp both.
    async fn remove_bucket(&self, bucket: &str) {
        debug!(bucket, "removing bucket dropped by server");
        self.inner.store.delete_timestamp(bucket).await;
        self.inner.cache.invalidate(bucket).await;
        self.inner.bus.publish(BusMessage::WsInvalidate {
            key: bucket.to_string(),
            timestamp: now_ms(),
        });
        self.inner.subs.notify_key(bucket);
    }

    /// Invalidate every local bucket not named in `valid_keys`.
    pub(crate) async fn invalidate_except(&self, valid_keys: &[String]) {
        for bucket in self.local_buckets().await {
            if !valid_keys.iter().any(|k| k == &bucket) {
                self.remove_bucket(&bucket).await;
            }
        }
    }

    /// Open the cache gate and mirror it to followers, unless the user
    /// explicitly disconnected in the meantime.
    pub(crate) fn enable_cache(&self) {
        if self.inner.explicitly_closed.get() {
            return;
        }
        self.inner.cache_enabled.set(true);
        self.inner.bus.publish(BusMessage::WsCacheEnabled {
            enabled: true,
            explicitly_closed: false,
        });
    }

    /// Register a listener for custom server messages.
    pub fn on_custom(&self, callback: CustomCallback) -> CustomHandle {
        let id = self.inner.next_custom_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .custom
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, callback));
        CustomHandle {
            engine: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Fire custom-message listeners (leader and follower paths).
    pub fn dispatch_custom(&self, payload: &serde_json::Value) {
        let callbacks: Vec<CustomCallback> = {
            let custom = self.inner.custom.lock().unwrap_or_else(|e| e.into_inner());
            custom.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            callback(payload);
        }
    }

    fn map_route(&self, path: &str) -> String {
        match &self.inner.route_mapper {
            Some(mapper) => mapper(path),
            None => path.to_string(),
        }
    }

    /// Union of buckets known to the store, cache namespace and
    /// timestamp namespace alike.
    async fn local_buckets(&self) -> Vec<String> {
        let mut buckets = self.inner.store.all_bucket_keys().await;
        for bucket in self.inner.store.all_timestamps().await.into_keys() {
            if !buckets.contains(&bucket) {
                buckets.push(bucket);
            }
        }
        buckets
    }

    fn note_drift(&self, drift_time: Option<i64>) {
        let Some(drift) = drift_time else { return };
        let mut last = self.inner.last_drift.lock().unwrap_or_else(|e| e.into_inner());
        if *last != Some(drift) {
            if last.is_some() {
                warn!(drift, "server clock drift marker changed");
            }
            *last = Some(drift);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procache_core::Realm;
    use procache_storage::{MemoryStore, PersistentStore};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use uuid::Uuid;

    struct Fixture {
        engine: InvalidationEngine,
        store: Arc<MemoryStore>,
        cache: CacheManager,
        subs: SubscriptionRegistry,
        realm: Realm,
    }

    fn fixture() -> Fixture {
        fixture_with(None, None)
    }

    fn fixture_with(
        middleware: Option<Arc<dyn MessageMiddleware>>,
        route_mapper: Option<Arc<RouteMapper>>,
    ) -> Fixture {
        let realm = Realm::new();
        let peer = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let handle = StoreHandle::new(Arc::clone(&store) as Arc<dyn PersistentStore>);
        let cache = CacheManager::new(
            handle.clone(),
            realm.channel("cache", peer),
            Duration::from_millis(50),
        );
        let focus = Signal::new(true);
        let subs = SubscriptionRegistry::new(
            cache.clone(),
            focus,
            Duration::from_millis(200),
            Duration::from_millis(500),
        );
        let engine = InvalidationEngine::new(
            cache.clone(),
            handle,
            realm.channel("ws", peer),
            subs.clone(),
            Signal::new(false),
            Signal::new(false),
            Arc::new(DefaultInvalidationPolicy),
            middleware,
            route_mapper,
        );
        Fixture {
            engine,
            store,
            cache,
            subs,
            realm,
        }
    }

    async fn seed(fx: &Fixture, bucket: &str, ts: ServerTimestamp) {
        fx.store.set_timestamp(bucket, ts).await.unwrap();
        fx.cache
            .set(bucket, &format!("{bucket}/1"), json!("seeded"), 60, ts)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_sync_replaces_bucket_set() {
        let fx = fixture();
        seed(&fx, "/x", 50).await;
        seed(&fx, "/y", 60).await;

        // Watch the coordination channel from another peer.
        let observer = fx.realm.channel("ws", Uuid::new_v4());
        let mut sub = observer.subscribe();

        fx.engine
            .handle_upstream(r#"{"type":"invalidate","data":{"/x":100}}"#)
            .await;

        assert_eq!(fx.store.get_timestamp("/x").await.unwrap(), Some(100));
        assert_eq!(fx.store.get_timestamp("/y").await.unwrap(), None);
        assert!(fx.store.get_bucket("/x").await.unwrap().is_none());
        assert!(fx.store.get_bucket("/y").await.unwrap().is_none());

        // Exactly two ws-invalidate broadcasts, no ws-invalidate-all.
        let mut invalidated = Vec::new();
        for _ in 0..2 {
            loop {
                match sub.recv().await {
                    Some(BusMessage::WsInvalidate { key, timestamp }) => {
                        invalidated.push((key, timestamp));
                        break;
                    }
                    Some(BusMessage::WsInvalidateAll) => panic!("unexpected ws-invalidate-all"),
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        }
        invalidated.sort();
        assert_eq!(invalidated[0].0, "/x");
        assert_eq!(invalidated[0].1, 100);
        assert_eq!(invalidated[1].0, "/y");
        assert!(invalidated[1].1 > 100);
    }

    #[tokio::test]
    async fn test_full_sync_opens_cache_gate() {
        let fx = fixture();
        assert!(!fx.engine.inner.cache_enabled.get());
        fx.engine
            .handle_upstream(r#"{"type":"invalidate","data":{"/x":100}}"#)
            .await;
        assert!(fx.engine.inner.cache_enabled.get());
    }

    #[tokio::test]
    async fn test_full_sync_gate_respects_explicit_close() {
        let fx = fixture();
        fx.engine.inner.explicitly_closed.set(true);
        fx.engine
            .handle_upstream(r#"{"type":"invalidate","data":{"/x":100}}"#)
            .await;
        assert!(!fx.engine.inner.cache_enabled.get());
    }

    #[tokio::test]
    async fn test_empty_full_sync_purges() {
        let fx = fixture();
        seed(&fx, "/x", 50).await;

        let observer = fx.realm.channel("ws", Uuid::new_v4());
        let mut sub = observer.subscribe();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_inner = Arc::clone(&fired);
        let _g = fx.subs.subscribe_global(Arc::new(move || {
            fired_inner.fetch_add(1, Ordering::SeqCst);
        }));

        fx.engine
            .handle_upstream(r#"{"type":"invalidate","data":{}}"#)
            .await;

        assert!(fx.store.all_bucket_keys().await.unwrap().is_empty());
        assert!(fx.store.all_timestamps().await.unwrap().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(fx.engine.inner.cache_enabled.get());

        loop {
            match sub.recv().await {
                Some(BusMessage::WsInvalidateAll) => break,
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_stale_full_sync_is_dropped() {
        let fx = fixture();
        seed(&fx, "/x", 100).await;

        fx.engine
            .handle_upstream(r#"{"type":"invalidate","data":{"/x":90}}"#)
            .await;

        // Policy declined: timestamp unchanged, entries intact.
        assert_eq!(fx.store.get_timestamp("/x").await.unwrap(), Some(100));
        assert!(fx.store.get_bucket("/x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delta_advances_without_removals() {
        let fx = fixture();
        seed(&fx, "/x", 50).await;
        seed(&fx, "/y", 60).await;

        fx.engine
            .handle_upstream(r#"{"type":"invalidate-delta","data":{"/x":200}}"#)
            .await;

        assert_eq!(fx.store.get_timestamp("/x").await.unwrap(), Some(200));
        assert_eq!(fx.store.get_timestamp("/y").await.unwrap(), Some(60));
        assert!(fx.store.get_bucket("/y").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_raw_string_invalidates_single_bucket() {
        let fx = fixture();
        seed(&fx, "/todos", 50).await;

        fx.engine.handle_upstream("/todos").await;

        assert!(fx.store.get_bucket("/todos").await.unwrap().is_none());
        let ts = fx.store.get_timestamp("/todos").await.unwrap().unwrap();
        assert!(ts > 50);
    }

    #[tokio::test]
    async fn test_custom_message_dispatch_and_relay() {
        let fx = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_inner = Arc::clone(&seen);
        let _h = fx.engine.on_custom(Arc::new(move |payload| {
            seen_inner
                .lock()
                .unwrap()
                .push(payload["note"].as_str().unwrap_or_default().to_string());
        }));

        let observer = fx.realm.channel("ws", Uuid::new_v4());
        let mut sub = observer.subscribe();

        fx.engine
            .handle_upstream(r#"{"type":"announcement","note":"hi"}"#)
            .await;

        assert_eq!(seen.lock().unwrap().as_slice(), ["hi"]);
        loop {
            match sub.recv().await {
                Some(BusMessage::WsCustom { payload }) => {
                    assert_eq!(payload["note"], "hi");
                    break;
                }
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_route_mapper_applied() {
        let fx = fixture_with(
            None,
            Some(Arc::new(|path: &str| format!("/api{path}")) as Arc<RouteMapper>),
        );
        fx.engine
            .handle_upstream(r#"{"type":"invalidate-delta","data":{"/todos":77}}"#)
            .await;
        assert_eq!(fx.store.get_timestamp("/api/todos").await.unwrap(), Some(77));
    }

    #[tokio::test]
    async fn test_middleware_can_preempt() {
        struct Swallow;
        #[async_trait]
        impl MessageMiddleware for Swallow {
            async fn handle(
                &self,
                message: &ServerMessage,
                _ctx: &MessageContext<'_>,
            ) -> MiddlewareOutcome {
                match message {
                    ServerMessage::Delta { .. } => MiddlewareOutcome::Handled,
                    _ => MiddlewareOutcome::Continue,
                }
            }
        }

        let fx = fixture_with(Some(Arc::new(Swallow)), None);
        seed(&fx, "/x", 50).await;

        fx.engine
            .handle_upstream(r#"{"type":"invalidate-delta","data":{"/x":200}}"#)
            .await;
        // Swallowed: nothing changed.
        assert_eq!(fx.store.get_timestamp("/x").await.unwrap(), Some(50));

        fx.engine
            .handle_upstream(r#"{"type":"invalidate","data":{"/x":300}}"#)
            .await;
        // Full sync fell through to the default handler.
        assert_eq!(fx.store.get_timestamp("/x").await.unwrap(), Some(300));
    }

    #[tokio::test]
    async fn test_middleware_invalidate_except() {
        struct KeepOnly;
        #[async_trait]
        impl MessageMiddleware for KeepOnly {
            async fn handle(
                &self,
                message: &ServerMessage,
                ctx: &MessageContext<'_>,
            ) -> MiddlewareOutcome {
                if let ServerMessage::Custom { payload } = message {
                    if payload["type"] == "keep-only" {
                        ctx.invalidate_except(&["/x".to_string()]).await;
                        return MiddlewareOutcome::Handled;
                    }
                }
                MiddlewareOutcome::Continue
            }
        }

        let fx = fixture_with(Some(Arc::new(KeepOnly)), None);
        seed(&fx, "/x", 50).await;
        seed(&fx, "/y", 60).await;

        fx.engine
            .handle_upstream(r#"{"type":"keep-only"}"#)
            .await;

        assert!(fx.store.get_bucket("/x").await.unwrap().is_some());
        assert!(fx.store.get_bucket("/y").await.unwrap().is_none());
        assert_eq!(fx.store.get_timestamp("/y").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscribers_notified_on_invalidation() {
        let fx = fixture();
        seed(&fx, "/todos", 50).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_inner = Arc::clone(&fired);
        let _h = fx.subs.subscribe(
            "/todos",
            Arc::new(move || {
                fired_inner.fetch_add(1, Ordering::SeqCst);
            }),
        );

        fx.engine
            .handle_upstream(r#"{"type":"invalidate-delta","data":{"/todos":200}}"#)
            .await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
