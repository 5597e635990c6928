//! Cache-aware fetch orchestration.
//!
//! The read path every consumer goes through: optional one-shot startup
//! wait for the socket, hydration barrier, cache lookup, coalescing of
//! concurrent fetches per specific key, the HTTP GET itself, and the
//! timestamp-stamped write-back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use procache_core::{build_path, RouteDef, Signal, SocketStatus, StartupConfig, TimestampSource};
use procache_storage::{CacheManager, StoreHandle};

use crate::error::{ClientError, ClientResult};
use crate::subscriptions::SubscriptionRegistry;

/// Granularity of the socket wait poll.
const CONNECTION_POLL: Duration = Duration::from_millis(50);

/// A fetched HTTP response, decomposed for timestamp extraction.
pub struct FetchedResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: serde_json::Value,
}

/// Pulls the server-authoritative timestamp out of a response.
#[derive(Clone)]
pub enum TimestampExtractor {
    /// A response header holding epoch milliseconds.
    Header(String),
    /// A JSON pointer into the body.
    JsonPointer(String),
    /// Application-supplied extraction.
    Custom(Arc<dyn Fn(&FetchedResponse) -> Option<i64> + Send + Sync>),
}

impl TimestampExtractor {
    pub fn from_source(source: &TimestampSource) -> Self {
        match source {
            TimestampSource::Header { name } => Self::Header(name.clone()),
            TimestampSource::JsonPointer { pointer } => Self::JsonPointer(pointer.clone()),
        }
    }

    fn extract(&self, response: &FetchedResponse) -> Option<i64> {
        match self {
            Self::Header(name) => response
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok()),
            Self::JsonPointer(pointer) => response.body.pointer(pointer).and_then(|v| v.as_i64()),
            Self::Custom(f) => f(response),
        }
    }
}

/// Per-call options beyond the route itself.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Cache under this key instead of the composed URL.
    pub cache_key: Option<String>,
    /// Skip the cache read; the response is still written back.
    pub force: bool,
}

impl FetchOptions {
    pub fn force() -> Self {
        Self {
            cache_key: None,
            force: true,
        }
    }
}

/// Everything the orchestrator is wired to at construction.
pub(crate) struct FetchParts {
    pub http: reqwest::Client,
    pub base_url: String,
    pub default_ttl: u32,
    pub enabled: bool,
    pub cache_writes_offline: bool,
    pub extractor: Option<TimestampExtractor>,
    pub cache: CacheManager,
    pub store: StoreHandle,
    pub cache_enabled: Signal<bool>,
    pub ws_status: Signal<SocketStatus>,
    pub subs: SubscriptionRegistry,
    pub startup: StartupConfig,
}

/// Shared fetch path for one peer.
#[derive(Clone)]
pub struct FetchOrchestrator {
    inner: Arc<FetchInner>,
}

struct FetchInner {
    http: reqwest::Client,
    base_url: String,
    default_ttl: u32,
    enabled: bool,
    cache_writes_offline: bool,
    extractor: Option<TimestampExtractor>,
    cache: CacheManager,
    store: StoreHandle,
    cache_enabled: Signal<bool>,
    ws_status: Signal<SocketStatus>,
    subs: SubscriptionRegistry,
    startup: StartupConfig,
    startup_done: AtomicBool,
    pending: Mutex<HashMap<String, broadcast::Sender<Result<serde_json::Value, String>>>>,
}

/// Removes the pending-fetch entry even if the owning future is dropped
/// mid-flight, so coalesced waiters fail instead of hanging.
struct PendingGuard {
    inner: Arc<FetchInner>,
    key: String,
    armed: bool,
}

impl PendingGuard {
    fn finish(mut self, result: &ClientResult<serde_json::Value>) {
        self.armed = false;
        let tx = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
        if let Some(tx) = tx {
            let payload = match result {
                Ok(value) => Ok(value.clone()),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(payload);
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.key);
        }
    }
}

impl FetchOrchestrator {
    pub(crate) fn new(parts: FetchParts) -> Self {
        Self {
            inner: Arc::new(FetchInner {
                http: parts.http,
                base_url: parts.base_url.trim_end_matches('/').to_string(),
                default_ttl: parts.default_ttl,
                enabled: parts.enabled,
                cache_writes_offline: parts.cache_writes_offline,
                extractor: parts.extractor,
                cache: parts.cache,
                store: parts.store,
                cache_enabled: parts.cache_enabled,
                ws_status: parts.ws_status,
                subs: parts.subs,
                startup: parts.startup,
                startup_done: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Fetch a route: cache first, network on miss, one HTTP request per
    /// specific key no matter how many concurrent callers.
    pub async fn fetch(
        &self,
        route: RouteDef,
        params: Option<&HashMap<String, String>>,
        query: Option<&[(String, String)]>,
        opts: FetchOptions,
    ) -> ClientResult<serde_json::Value> {
        let url = build_path(&route.path, params, query);

        // Master switch off: plain pass-through GET, no cache machinery.
        if !self.inner.enabled {
            return self.inner.http_get(&url).await.map(|r| r.body);
        }

        let pattern = route.path;
        let specific = opts.cache_key.unwrap_or_else(|| url.clone());
        let ttl = route.cache_ttl.unwrap_or(self.inner.default_ttl);
        if let Some(delay) = route.background_delay {
            self.inner.subs.set_route_delay(specific.clone(), delay);
        }

        // One-shot: the very first fetch may hold for the socket so the
        // first paint reads warm, synced data.
        if self.inner.startup.wait_for_socket
            && !self.inner.startup_done.swap(true, Ordering::SeqCst)
            && self.inner.ws_status.get() != SocketStatus::Connected
        {
            let timeout = Duration::from_millis(self.inner.startup.socket_wait_timeout_ms);
            if !wait_for_connection(&self.inner.ws_status, timeout).await {
                warn!("startup socket wait timed out");
            }
        }

        if self.inner.cache_enabled.get() {
            self.inner.cache.wait_for_sync().await;
        }

        if !opts.force && self.inner.cache_enabled.get() && ttl > 0 {
            if let Some(hit) = self.inner.cache.get(&pattern, &specific).await {
                debug!(key = %specific, "cache hit");
                return Ok(hit);
            }
        }

        // Coalesce: subscribe onto an in-flight fetch of the same key,
        // or register as the owner.
        let waiter = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get(&specific) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    pending.insert(specific.clone(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            debug!(key = %specific, "joining in-flight fetch");
            return match rx.recv().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(ClientError::CoalescedFetch { message }),
                Err(_) => Err(ClientError::FetchAbandoned { key: specific }),
            };
        }

        let guard = PendingGuard {
            inner: Arc::clone(&self.inner),
            key: specific.clone(),
            armed: true,
        };
        let result = self
            .inner
            .perform_fetch(&pattern, &specific, &url, ttl)
            .await;
        guard.finish(&result);
        result
    }

    /// Number of keys with an in-flight fetch (test support).
    pub fn in_flight(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl FetchInner {
    async fn perform_fetch(
        &self,
        pattern: &str,
        specific: &str,
        url: &str,
        ttl: u32,
    ) -> ClientResult<serde_json::Value> {
        let response = self.http_get(url).await?;
        let data = response.body.clone();

        let should_write = self.cache_enabled.get() || self.cache_writes_offline;
        if should_write {
            match self.extractor.as_ref().and_then(|e| e.extract(&response)) {
                Some(ts) => {
                    self.store.set_timestamp(pattern, ts).await;
                    if ttl > 0 && !data.is_null() {
                        if let Err(e) =
                            self.cache.set(pattern, specific, data.clone(), ttl, ts).await
                        {
                            warn!(key = %specific, error = %e, "cache write-back failed");
                        }
                    }
                }
                None => {
                    warn!(key = %specific, "no server timestamp in response; skipping write-back");
                }
            }
        }

        Ok(data)
    }

    async fn http_get(&self, url: &str) -> ClientResult<FetchedResponse> {
        let full = format!("{}{}", self.base_url, url);
        debug!(url = %full, "fetching");
        let response = self.http.get(&full).send().await?.error_for_status()?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body: serde_json::Value = response.json().await?;
        Ok(FetchedResponse {
            status,
            headers,
            body,
        })
    }
}

/// Poll the socket status until connected; `false` on timeout.
pub(crate) async fn wait_for_connection(
    status: &Signal<SocketStatus>,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if status.get() == SocketStatus::Connected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(CONNECTION_POLL).await;
    }
}
