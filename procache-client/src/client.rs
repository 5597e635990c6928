//! Client facade: construction and the public surface.
//!
//! `CacheClient` wires the realm, store, cache manager, coordinator,
//! invalidation engine, subscription registry, and fetch orchestrator
//! together. Plain-data options come in through `ClientConfig`; behavior
//! hooks (URL providers, route mappers, policies, middleware, custom
//! timestamp extraction) attach through the builder.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use procache_core::{ClientConfig, ConfigError, PeerId, PeerRole, Realm, RouteDef, Signal, SocketStatus};
use procache_storage::{CacheManager, LmdbStore, MemoryStore, PersistentStore, StoreHandle};

use crate::coordinator::{Coordinator, CoordinatorParts, UrlProvider};
use crate::error::ClientResult;
use crate::fetch::{FetchOptions, FetchOrchestrator, FetchParts, FetchedResponse, TimestampExtractor};
use crate::invalidation::{
    CustomCallback, CustomHandle, DefaultInvalidationPolicy, InvalidationEngine,
    InvalidationPolicy, MessageMiddleware, RouteMapper,
};
use crate::subscriptions::{NotifyCallback, SubscriptionHandle, SubscriptionRegistry};

/// Hydration barrier bound when no peer answers.
const SYNC_TIMEOUT: Duration = Duration::from_millis(200);

/// The process-wide realm clients attach to unless one is injected.
fn default_realm() -> Realm {
    static DEFAULT: OnceLock<Realm> = OnceLock::new();
    DEFAULT.get_or_init(Realm::new).clone()
}

/// Builder carrying the behavior hooks `ClientConfig` cannot express.
pub struct CacheClientBuilder {
    config: ClientConfig,
    realm: Option<Realm>,
    store: Option<Arc<dyn PersistentStore>>,
    http: Option<reqwest::Client>,
    url_provider: Option<Arc<UrlProvider>>,
    route_mapper: Option<Arc<RouteMapper>>,
    policy: Option<Arc<dyn InvalidationPolicy>>,
    middleware: Option<Arc<dyn MessageMiddleware>>,
    timestamp_fn: Option<Arc<dyn Fn(&FetchedResponse) -> Option<i64> + Send + Sync>>,
}

impl CacheClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            realm: None,
            store: None,
            http: None,
            url_provider: None,
            route_mapper: None,
            policy: None,
            middleware: None,
            timestamp_fn: None,
        }
    }

    /// Attach to a specific realm instead of the process-wide default.
    pub fn realm(mut self, realm: Realm) -> Self {
        self.realm = Some(realm);
        self
    }

    /// Use this store instead of opening the configured LMDB environment.
    /// Peers of one realm should share one store instance.
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a pre-built HTTP client (custom TLS, proxies, headers).
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Compute the upstream URL at each connect, e.g. to carry a fresh
    /// auth token in the query string.
    pub fn ws_url(mut self, provider: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.url_provider = Some(Arc::new(provider));
        self
    }

    /// Normalize server route paths into local bucket keys.
    pub fn route_to_cache_key(
        mut self,
        mapper: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.route_mapper = Some(Arc::new(mapper));
        self
    }

    /// Override the timestamp comparison that gates invalidations.
    pub fn invalidation_policy(mut self, policy: Arc<dyn InvalidationPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Pre-empt upstream message handling.
    pub fn middleware(mut self, middleware: Arc<dyn MessageMiddleware>) -> Self {
        self.middleware = Some(middleware);
        self
    }

    /// Extract the server timestamp with code instead of a configured
    /// header or JSON pointer.
    pub fn timestamp_extractor(
        mut self,
        f: impl Fn(&FetchedResponse) -> Option<i64> + Send + Sync + 'static,
    ) -> Self {
        self.timestamp_fn = Some(Arc::new(f));
        self
    }

    /// Wire everything up. Must run inside a tokio runtime: the cache
    /// manager and coordinator spawn their listener tasks here.
    pub fn build(self) -> ClientResult<CacheClient> {
        self.config.validate()?;

        let enabled = self.config.enabled;

        let extractor = match (&self.timestamp_fn, &self.config.ws.timestamp_source) {
            (Some(f), _) => Some(TimestampExtractor::Custom(Arc::clone(f))),
            (None, Some(source)) => Some(TimestampExtractor::from_source(source)),
            (None, None) => None,
        };
        if enabled && extractor.is_none() {
            // Serving cached data without server timestamps would break
            // every ordering guarantee; refuse to start.
            return Err(ConfigError::MissingRequired {
                field: "ws.timestamp_source",
            }
            .into());
        }

        let url_provider: Option<Arc<UrlProvider>> = match (self.url_provider, &self.config.ws.url)
        {
            (Some(provider), _) => Some(provider),
            (None, Some(url)) => {
                let url = url.clone();
                Some(Arc::new(move || url.clone()))
            }
            (None, None) => None,
        };
        if enabled && url_provider.is_none() {
            return Err(ConfigError::MissingRequired { field: "ws.url" }.into());
        }

        let realm = self.realm.unwrap_or_else(default_realm);
        let peer_id = Uuid::new_v4();

        let store: Arc<dyn PersistentStore> = match self.store {
            Some(store) => store,
            None if enabled => match LmdbStore::open(&self.config.db) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!(error = %e, "failed to open persistent store; running memory-only");
                    Arc::new(MemoryStore::new())
                }
            },
            None => Arc::new(MemoryStore::new()),
        };
        let store = StoreHandle::new(store);

        let http = match self.http {
            Some(client) => client,
            None => reqwest::Client::builder()
                .timeout(Duration::from_millis(self.config.api.request_timeout_ms))
                .build()?,
        };

        let focus = Signal::new(true);
        let online = Signal::new(true);
        let ws_status = Signal::new(SocketStatus::Disconnected);
        let cache_enabled = Signal::new(enabled && self.config.ws.startup.enable_cache_before_socket);
        let debug_enabled = Signal::new(self.config.debug);
        // Starts "closed": the client stays out of elections until the
        // first connect().
        let explicitly_closed = Signal::new(true);

        let cache_channel = format!("{}/cache", self.config.ws.channel_name);
        let ws_channel = format!("{}/ws", self.config.ws.channel_name);

        let cache = CacheManager::new(
            store.clone(),
            realm.channel(&cache_channel, peer_id),
            SYNC_TIMEOUT,
        );

        let subs = SubscriptionRegistry::new(
            cache.clone(),
            focus.clone(),
            Duration::from_millis(self.config.ws.background_poll_interval),
            Duration::from_millis(self.config.ws.default_background_delay),
        );

        let engine = InvalidationEngine::new(
            cache.clone(),
            store.clone(),
            realm.channel(&ws_channel, peer_id),
            subs.clone(),
            cache_enabled.clone(),
            explicitly_closed.clone(),
            self.policy.unwrap_or_else(|| Arc::new(DefaultInvalidationPolicy)),
            self.middleware,
            self.route_mapper,
        );

        let coordinator = match (enabled, url_provider) {
            (true, Some(url_provider)) => Some(Coordinator::new(CoordinatorParts {
                peer_id,
                realm: realm.clone(),
                bus: realm.channel(&ws_channel, peer_id),
                cache: cache.clone(),
                engine: engine.clone(),
                subs: subs.clone(),
                ws_status: ws_status.clone(),
                cache_enabled: cache_enabled.clone(),
                debug_enabled: debug_enabled.clone(),
                online: online.clone(),
                explicitly_closed: explicitly_closed.clone(),
                enable_cache_before_socket: self.config.ws.startup.enable_cache_before_socket,
                url_provider,
            })),
            _ => None,
        };

        let fetcher = FetchOrchestrator::new(FetchParts {
            http,
            base_url: self.config.api.base_url.clone(),
            default_ttl: self.config.api.default_cache_ttl,
            enabled,
            cache_writes_offline: self.config.cache_writes_offline,
            extractor,
            cache: cache.clone(),
            store: store.clone(),
            cache_enabled: cache_enabled.clone(),
            ws_status: ws_status.clone(),
            subs: subs.clone(),
            startup: self.config.ws.startup.clone(),
        });

        Ok(CacheClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                peer_id,
                cache,
                subs,
                engine,
                coordinator,
                fetcher,
                focus,
                online,
                ws_status,
                cache_enabled,
                debug_enabled,
            }),
        })
    }
}

/// A peer's handle on the shared cache runtime. Cloning shares state.
#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    peer_id: PeerId,
    cache: CacheManager,
    subs: SubscriptionRegistry,
    engine: InvalidationEngine,
    coordinator: Option<Coordinator>,
    fetcher: FetchOrchestrator,
    focus: Signal<bool>,
    online: Signal<bool>,
    ws_status: Signal<SocketStatus>,
    cache_enabled: Signal<bool>,
    debug_enabled: Signal<bool>,
}

/// Handles for the pair of registrations a live view holds: its composed
/// URL and, when different, the route pattern.
pub struct RouteSubscription {
    handles: Vec<SubscriptionHandle>,
}

impl RouteSubscription {
    pub fn unsubscribe(self) {
        for handle in self.handles {
            handle.unsubscribe();
        }
    }
}

impl CacheClient {
    pub fn builder(config: ClientConfig) -> CacheClientBuilder {
        CacheClientBuilder::new(config)
    }

    /// Build with defaults for every hook.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        Self::builder(config).build()
    }

    /// Join the realm: elect or follow, and (as leader) open the
    /// upstream socket.
    pub async fn connect(&self) {
        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.connect().await;
        }
    }

    /// User-initiated disconnect; quiet until the next `connect`.
    pub fn disconnect(&self) {
        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.disconnect();
        }
    }

    /// Graceful leave: hand leadership off so remaining peers elect
    /// immediately.
    pub fn shutdown(&self) {
        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.shutdown();
        }
    }

    /// Fetch a route with default options.
    pub async fn fetch(&self, route: impl Into<RouteDef>) -> ClientResult<serde_json::Value> {
        self.fetch_with(route, None, None, FetchOptions::default())
            .await
    }

    /// Fetch with path params, query, and options.
    pub async fn fetch_with(
        &self,
        route: impl Into<RouteDef>,
        params: Option<&HashMap<String, String>>,
        query: Option<&[(String, String)]>,
        opts: FetchOptions,
    ) -> ClientResult<serde_json::Value> {
        self.inner.fetcher.fetch(route.into(), params, query, opts).await
    }

    /// Send an opaque payload upstream (relayed when not the leader).
    pub fn send(&self, payload: serde_json::Value) {
        match &self.inner.coordinator {
            Some(coordinator) => coordinator.send(payload),
            None => warn!("dropping send: client is disabled"),
        }
    }

    /// Subscribe to invalidations of one key.
    pub fn subscribe(&self, key: impl Into<String>, callback: NotifyCallback) -> SubscriptionHandle {
        self.inner.subs.subscribe(key, callback)
    }

    /// Subscribe the way a live view does: on the composed URL and on the
    /// route pattern when they differ.
    pub fn subscribe_route(
        &self,
        route: &RouteDef,
        params: Option<&HashMap<String, String>>,
        query: Option<&[(String, String)]>,
        callback: NotifyCallback,
    ) -> RouteSubscription {
        let specific = procache_core::build_path(&route.path, params, query);
        let mut handles = vec![self.inner.subs.subscribe(specific.clone(), Arc::clone(&callback))];
        if specific != route.path {
            handles.push(self.inner.subs.subscribe(route.path.clone(), callback));
        }
        RouteSubscription { handles }
    }

    /// Subscribe to global invalidations (purges, coming back online).
    pub fn subscribe_global(&self, callback: NotifyCallback) -> SubscriptionHandle {
        self.inner.subs.subscribe_global(callback)
    }

    /// Listen for server messages outside the invalidation protocol.
    pub fn on_custom_message(&self, callback: CustomCallback) -> CustomHandle {
        self.inner.engine.on_custom(callback)
    }

    /// Tell the runtime whether this peer's view is focused. Unfocused
    /// peers defer invalidation callbacks (see the registry docs).
    pub fn set_focus(&self, focused: bool) {
        self.inner.focus.set(focused);
    }

    /// Flip connectivity; `false` parks the socket, `true` reconnects
    /// and nudges consumers to refetch.
    pub fn set_online(&self, online: bool) {
        match &self.inner.coordinator {
            Some(coordinator) => coordinator.set_online(online),
            None => self.inner.online.set(online),
        }
    }

    /// Toggle verbose logging realm-wide.
    pub fn set_debug(&self, enabled: bool) {
        match &self.inner.coordinator {
            Some(coordinator) => coordinator.set_debug(enabled),
            None => self.inner.debug_enabled.set(enabled),
        }
    }

    /// Drop every cached bucket on this peer and in the store.
    pub async fn clear_cache(&self) {
        self.inner.cache.clear().await;
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Whether subscribers should refetch automatically on invalidation
    /// (binding-layer contract).
    pub fn auto_refetch_on_invalidation(&self) -> bool {
        self.inner.config.auto_refetch_on_invalidation
    }

    pub fn ws_status(&self) -> Signal<SocketStatus> {
        self.inner.ws_status.clone()
    }

    pub fn cache_enabled(&self) -> Signal<bool> {
        self.inner.cache_enabled.clone()
    }

    pub fn debug_enabled(&self) -> Signal<bool> {
        self.inner.debug_enabled.clone()
    }

    pub fn online(&self) -> Signal<bool> {
        self.inner.online.clone()
    }

    pub fn role(&self) -> Signal<PeerRole> {
        match &self.inner.coordinator {
            Some(coordinator) => coordinator.role(),
            None => Signal::new(PeerRole::Follower),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.inner
            .coordinator
            .as_ref()
            .is_some_and(Coordinator::is_leader)
    }

    /// Direct access to the cache layer (advanced use and tests).
    pub fn cache_manager(&self) -> &CacheManager {
        &self.inner.cache
    }
}
