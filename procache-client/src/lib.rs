//! PROCACHE Client - Reactive Cache Runtime
//!
//! The client-side runtime tying the cache layers to a live upstream:
//! peer coordination (one elected leader owns the socket and relays for
//! the rest), the invalidation engine driven by server messages, the
//! focus-aware subscription registry, and the cache-aware fetch path
//! with request coalescing.
//!
//! ## Quick start
//!
//! ```ignore
//! use procache_client::CacheClient;
//! use procache_core::ClientConfig;
//!
//! let mut config = ClientConfig::new("http://localhost:8080", "/var/cache/app");
//! config.api.default_cache_ttl = 60;
//! config.ws.url = Some("ws://localhost:8080/ws".into());
//! config.ws.timestamp_source = Some(procache_core::TimestampSource::Header {
//!     name: "x-server-time".into(),
//! });
//!
//! let client = CacheClient::new(config)?;
//! client.connect().await;
//! let todos = client.fetch("/todos").await?;
//! ```

mod client;
mod coordinator;
mod error;
mod fetch;
mod invalidation;
mod socket;
mod subscriptions;

pub use client::{CacheClient, CacheClientBuilder, RouteSubscription};
pub use error::{ClientError, ClientResult};
pub use fetch::{FetchOptions, FetchOrchestrator, FetchedResponse, TimestampExtractor};
pub use invalidation::{
    CustomCallback, CustomHandle, DefaultInvalidationPolicy, InvalidationEngine,
    InvalidationPolicy, MessageContext, MessageMiddleware, MiddlewareOutcome, RouteMapper,
};
pub use subscriptions::{NotifyCallback, SubscriptionHandle, SubscriptionRegistry};

// Re-export the pieces callers need to configure and observe a client.
pub use procache_core::{
    BusMessage, CacheEntry, ClientConfig, PeerId, PeerRole, Realm, RouteDef, ServerMessage,
    Signal, SocketStatus, TimestampSource,
};
pub use procache_storage::{CacheManager, LmdbStore, MemoryStore, PersistentStore, StoreHandle};
