//! Fetch-path scenarios against a local HTTP stub.
//!
//! Covers the dedup guarantee (one wire request per specific key no
//! matter how many concurrent callers), cache hits and TTL handling,
//! force semantics, and write-back with server timestamps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use procache_client::{CacheClient, FetchOptions, MemoryStore, PersistentStore};
use procache_core::{ClientConfig, Realm, RouteDef, TimestampSource};

/// Minimal HTTP stub: every request gets the same JSON body plus an
/// `x-server-time` header; connections are counted and closed.
struct HttpStub {
    base_url: String,
    requests: Arc<AtomicUsize>,
}

async fn spawn_http_stub(body: serde_json::Value, server_time: i64, delay: Duration) -> HttpStub {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let requests = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let counter = Arc::clone(&counter);
            let body = body.to_string();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\nx-server-time: {server_time}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len(),
                );
                let _ = sock.write_all(response.as_bytes()).await;
            });
        }
    });

    HttpStub {
        base_url: format!("http://{addr}"),
        requests,
    }
}

fn shared_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// Client wired for fetch tests: cache serving enabled from the start,
/// no socket ever opened (connect is never called).
fn test_client(base_url: &str, store: Arc<MemoryStore>, ttl: u32) -> CacheClient {
    let mut config = ClientConfig::new(base_url, "/unused");
    config.api.default_cache_ttl = ttl;
    config.ws.url = Some("ws://127.0.0.1:9/ws".into());
    config.ws.timestamp_source = Some(TimestampSource::Header {
        name: "x-server-time".into(),
    });
    config.ws.startup.enable_cache_before_socket = true;
    CacheClient::builder(config)
        .realm(Realm::new())
        .store(store as Arc<dyn PersistentStore>)
        .build()
        .expect("client")
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_request() {
    let stub = spawn_http_stub(json!([1, 2, 3]), 100, Duration::from_millis(50)).await;
    let client = test_client(&stub.base_url, shared_store(), 60);

    let (a, b) = tokio::join!(client.fetch("/todos"), client.fetch("/todos"));
    let a = a.expect("first fetch");
    let b = b.expect("second fetch");

    assert_eq!(a, json!([1, 2, 3]));
    assert_eq!(a, b);
    assert_eq!(stub.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_distinct_keys_fetch_separately() {
    let stub = spawn_http_stub(json!({"ok": true}), 100, Duration::from_millis(10)).await;
    let client = test_client(&stub.base_url, shared_store(), 60);

    let (a, b) = tokio::join!(client.fetch("/todos"), client.fetch("/users"));
    a.expect("todos");
    b.expect("users");
    assert_eq!(stub.requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_second_fetch_hits_cache() {
    let stub = spawn_http_stub(json!({"n": 1}), 100, Duration::ZERO).await;
    let client = test_client(&stub.base_url, shared_store(), 60);

    client.fetch("/todos").await.expect("first");
    client.fetch("/todos").await.expect("second");
    assert_eq!(stub.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_zero_ttl_never_caches() {
    let stub = spawn_http_stub(json!(1), 100, Duration::ZERO).await;
    let client = test_client(&stub.base_url, shared_store(), 0);

    client.fetch("/todos").await.expect("first");
    client.fetch("/todos").await.expect("second");
    assert_eq!(stub.requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_force_bypasses_cache_read_but_writes_back() {
    let stub = spawn_http_stub(json!("fresh"), 200, Duration::ZERO).await;
    let store = shared_store();
    let client = test_client(&stub.base_url, Arc::clone(&store), 60);

    client.fetch("/todos").await.expect("warm");
    let forced = client
        .fetch_with(RouteDef::new("/todos"), None, None, FetchOptions::force())
        .await
        .expect("forced");
    assert_eq!(forced, json!("fresh"));
    assert_eq!(stub.requests.load(Ordering::SeqCst), 2);

    // The forced response still landed in the cache.
    let entry = store.get_cache("/todos", "/todos").await.unwrap().unwrap();
    assert_eq!(entry.data, json!("fresh"));
    assert_eq!(entry.timestamp, 200);
}

#[tokio::test]
async fn test_write_back_records_bucket_timestamp() {
    let stub = spawn_http_stub(json!({"id": 1}), 321, Duration::ZERO).await;
    let store = shared_store();
    let client = test_client(&stub.base_url, Arc::clone(&store), 60);

    let mut params = HashMap::new();
    params.insert("id".to_string(), "1".to_string());
    let route = RouteDef::new("/users/{id}");
    client
        .fetch_with(route, Some(&params), None, FetchOptions::default())
        .await
        .expect("fetch");

    // Bucket = pattern, specific key = composed URL.
    assert_eq!(store.get_timestamp("/users/{id}").await.unwrap(), Some(321));
    assert!(store
        .get_cache("/users/{id}", "/users/1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_cache_key_override() {
    let stub = spawn_http_stub(json!(7), 100, Duration::ZERO).await;
    let store = shared_store();
    let client = test_client(&stub.base_url, Arc::clone(&store), 60);

    let opts = FetchOptions {
        cache_key: Some("custom-key".into()),
        force: false,
    };
    client
        .fetch_with(RouteDef::new("/todos"), None, None, opts)
        .await
        .expect("fetch");
    assert!(store.get_cache("/todos", "custom-key").await.unwrap().is_some());
}

#[tokio::test]
async fn test_disabled_client_passes_through() {
    let stub = spawn_http_stub(json!({"raw": true}), 100, Duration::ZERO).await;
    let store = shared_store();

    let mut config = ClientConfig::new(stub.base_url.as_str(), "");
    config.enabled = false;
    let client = CacheClient::builder(config)
        .realm(Realm::new())
        .store(Arc::clone(&store) as Arc<dyn PersistentStore>)
        .build()
        .expect("client");

    let data = client.fetch("/todos").await.expect("fetch");
    assert_eq!(data, json!({"raw": true}));
    client.fetch("/todos").await.expect("fetch again");

    // No cache machinery at all: two wire requests, nothing stored.
    assert_eq!(stub.requests.load(Ordering::SeqCst), 2);
    assert!(store.all_bucket_keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_http_failure_propagates_without_cache_mutation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let response =
                    "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
                let _ = sock.write_all(response.as_bytes()).await;
            });
        }
    });

    let store = shared_store();
    let client = test_client(&format!("http://{addr}"), Arc::clone(&store), 60);

    let result = client.fetch("/todos").await;
    assert!(result.is_err());
    assert!(store.all_bucket_keys().await.unwrap().is_empty());
    assert_eq!(store.get_timestamp("/todos").await.unwrap(), None);
}

#[tokio::test]
async fn test_missing_timestamp_skips_write_back() {
    // Stub without the timestamp header.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let body = "{\"ok\":true}";
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len(),
                );
                let _ = sock.write_all(response.as_bytes()).await;
            });
        }
    });

    let store = shared_store();
    let client = test_client(&format!("http://{addr}"), Arc::clone(&store), 60);

    let data = client.fetch("/todos").await.expect("fetch");
    assert_eq!(data, json!({"ok": true}));
    // Without an authoritative timestamp nothing may enter the cache.
    assert!(store.get_cache("/todos", "/todos").await.unwrap().is_none());
}

#[tokio::test]
async fn test_default_store_persists_write_backs() {
    let stub = spawn_http_stub(json!({"kept": true}), 111, Duration::ZERO).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let mut config = ClientConfig::new(stub.base_url.as_str(), dir.path());
    config.api.default_cache_ttl = 60;
    config.ws.url = Some("ws://127.0.0.1:9/ws".into());
    config.ws.timestamp_source = Some(TimestampSource::Header {
        name: "x-server-time".into(),
    });
    config.ws.startup.enable_cache_before_socket = true;

    // No injected store: the builder opens the LMDB environment itself.
    let client = CacheClient::builder(config)
        .realm(Realm::new())
        .build()
        .expect("client");
    client.fetch("/todos").await.expect("fetch");

    let entry = client
        .cache_manager()
        .get("/todos", "/todos")
        .await
        .expect("cached");
    assert_eq!(entry, json!({"kept": true}));
}

#[tokio::test]
async fn test_builder_requires_timestamp_source_when_enabled() {
    let mut config = ClientConfig::new("http://127.0.0.1:9", "/unused");
    config.ws.url = Some("ws://127.0.0.1:9/ws".into());
    let result = CacheClient::builder(config)
        .realm(Realm::new())
        .store(shared_store() as Arc<dyn PersistentStore>)
        .build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_builder_requires_ws_url_when_enabled() {
    let mut config = ClientConfig::new("http://127.0.0.1:9", "/unused");
    config.ws.timestamp_source = Some(TimestampSource::Header {
        name: "x-server-time".into(),
    });
    let result = CacheClient::builder(config)
        .realm(Realm::new())
        .store(shared_store() as Arc<dyn PersistentStore>)
        .build();
    assert!(result.is_err());
}
