//! Client configuration.
//!
//! Plain-data configuration, loadable from TOML or constructed in code.
//! Behavior hooks (URL providers, route mappers, invalidation policies,
//! middleware) are code, not data: they are attached through the client
//! builder in the client crate. `validate()` rejects what it can see;
//! the builder performs the final cross-field checks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Master configuration for one cache client.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Master switch. When false: no socket, no cache, pass-through fetch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether invalidation notifications should trigger an automatic
    /// refetch in subscribers (vs. only flagging refetch-needed).
    #[serde(default)]
    pub auto_refetch_on_invalidation: bool,
    /// Keep writing fetch results to the cache while cache serving is
    /// disabled, so the cache is warm when it re-enables.
    #[serde(default)]
    pub cache_writes_offline: bool,
    /// Verbose logging. Runtime-toggleable after construction.
    #[serde(default)]
    pub debug: bool,
    pub db: DbConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub ws: WsConfig,
}

/// Persistent store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    /// Directory holding the store environment.
    pub path: PathBuf,
    /// Maximum store size in megabytes.
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: usize,
    /// Name of the bucket-timestamp database.
    #[serde(default = "default_timestamp_db")]
    pub timestamp_db: String,
    /// Name of the cache-bucket database.
    #[serde(default = "default_cache_db")]
    pub cache_db: String,
}

/// HTTP fetch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// Base URL prefixed to every route path.
    pub base_url: String,
    /// Cache TTL in seconds for routes that do not override it. Zero
    /// disables caching for such routes.
    #[serde(default)]
    pub default_cache_ttl: u32,
    /// Per-request timeout for the built-in HTTP client.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Upstream socket and realm configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WsConfig {
    /// Static upstream URL. Leave unset when the client is built with a
    /// URL provider (dynamic auth tokens).
    #[serde(default)]
    pub url: Option<String>,
    /// Realm channel namespace shared by all peers of this client.
    #[serde(default = "default_channel_name")]
    pub channel_name: String,
    /// Default cap on how long an unfocused subscriber waits for a peer
    /// to refill the cache before firing anyway, in milliseconds.
    #[serde(default = "default_background_delay")]
    pub default_background_delay: u64,
    /// Tick interval of the background wait loop, in milliseconds.
    #[serde(default = "default_background_poll_interval")]
    pub background_poll_interval: u64,
    /// How long activity indication stays on after traffic, in
    /// milliseconds. Consumed by binding layers via the activity signal.
    #[serde(default = "default_activity_indicator_duration")]
    pub activity_indicator_duration: u64,
    #[serde(default)]
    pub startup: StartupConfig,
    /// Where the server's authoritative timestamp lives in a fetch
    /// response. Required while `enabled` is true.
    #[serde(default)]
    pub timestamp_source: Option<TimestampSource>,
}

/// Boot-time gating of cache and fetch against the socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartupConfig {
    /// Serve from cache before the first full sync completes. Off by
    /// default: a server restart must not let stale data through.
    #[serde(default)]
    pub enable_cache_before_socket: bool,
    /// Block the first fetch until the socket connects (or the timeout
    /// lapses). At most once per client lifetime.
    #[serde(default)]
    pub wait_for_socket: bool,
    /// Timeout for that first-fetch wait, in milliseconds.
    #[serde(default = "default_socket_wait_timeout_ms")]
    pub socket_wait_timeout_ms: u64,
}

/// Where to find the server's authoritative timestamp in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimestampSource {
    /// A response header holding epoch milliseconds.
    Header { name: String },
    /// A JSON pointer into the response body, e.g. `/meta/server_time`.
    JsonPointer { pointer: String },
}

fn default_true() -> bool {
    true
}

fn default_max_size_mb() -> usize {
    64
}

fn default_timestamp_db() -> String {
    "timestamps".to_string()
}

fn default_cache_db() -> String {
    "cache".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_channel_name() -> String {
    "procache".to_string()
}

fn default_background_delay() -> u64 {
    500
}

fn default_background_poll_interval() -> u64 {
    200
}

fn default_activity_indicator_duration() -> u64 {
    300
}

fn default_socket_wait_timeout_ms() -> u64 {
    5000
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: None,
            channel_name: default_channel_name(),
            default_background_delay: default_background_delay(),
            background_poll_interval: default_background_poll_interval(),
            activity_indicator_duration: default_activity_indicator_duration(),
            startup: StartupConfig::default(),
            timestamp_source: None,
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            enable_cache_before_socket: false,
            wait_for_socket: false,
            socket_wait_timeout_ms: default_socket_wait_timeout_ms(),
        }
    }
}

impl ClientConfig {
    /// Minimal programmatic construction; everything else at defaults.
    pub fn new(base_url: impl Into<String>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            auto_refetch_on_invalidation: false,
            cache_writes_offline: false,
            debug: false,
            db: DbConfig {
                path: db_path.into(),
                max_size_mb: default_max_size_mb(),
                timestamp_db: default_timestamp_db(),
                cache_db: default_cache_db(),
            },
            api: ApiConfig {
                base_url: base_url.into(),
                default_cache_ttl: 0,
                request_timeout_ms: default_request_timeout_ms(),
            },
            ws: WsConfig::default(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api.base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.api.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.enabled && self.db.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "db.path",
                reason: "must not be empty while the client is enabled".to_string(),
            });
        }
        if self.db.max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "db.max_size_mb",
                reason: "must be > 0".to_string(),
            });
        }
        if self.db.timestamp_db.trim().is_empty() || self.db.cache_db.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "db.timestamp_db",
                reason: "database names must not be empty".to_string(),
            });
        }
        if self.db.timestamp_db == self.db.cache_db {
            return Err(ConfigError::InvalidValue {
                field: "db.cache_db",
                reason: "timestamp and cache databases must differ".to_string(),
            });
        }
        if self.ws.channel_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ws.channel_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.ws.background_poll_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ws.background_poll_interval",
                reason: "must be > 0".to_string(),
            });
        }
        if self.ws.startup.wait_for_socket && self.ws.startup.socket_wait_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ws.startup.socket_wait_timeout_ms",
                reason: "must be > 0 when wait_for_socket is set".to_string(),
            });
        }
        if let Some(TimestampSource::Header { name }) = &self.ws.timestamp_source {
            if name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "ws.timestamp_source",
                    reason: "header name must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config_toml() -> &'static str {
        r#"
[db]
path = "/tmp/procache"

[api]
base_url = "http://localhost:8080"
default_cache_ttl = 60

[ws]
url = "ws://localhost:8080/ws"

[ws.timestamp_source]
kind = "header"
name = "x-server-time"
"#
    }

    #[test]
    fn test_parse_valid_config() {
        let config: ClientConfig = toml::from_str(valid_config_toml()).unwrap();
        assert!(config.enabled);
        assert_eq!(config.api.base_url, "http://localhost:8080");
        assert_eq!(config.api.default_cache_ttl, 60);
        assert_eq!(config.ws.channel_name, "procache");
        assert_eq!(config.ws.default_background_delay, 500);
        assert_eq!(config.ws.background_poll_interval, 200);
        assert!(!config.ws.startup.wait_for_socket);
        assert_eq!(
            config.ws.timestamp_source,
            Some(TimestampSource::Header {
                name: "x-server-time".to_string()
            })
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let toml = r#"
surprise = true

[db]
path = "/tmp/procache"

[api]
base_url = "http://localhost:8080"
"#;
        assert!(toml::from_str::<ClientConfig>(toml).is_err());
    }

    #[test]
    fn test_validate_empty_base_url() {
        let mut config = ClientConfig::new("  ", "/tmp/procache");
        config.ws.url = Some("ws://localhost/ws".into());
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "api.base_url",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_empty_db_path_enabled() {
        let config = ClientConfig::new("http://localhost", "");
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { field: "db.path", .. }
        ));
    }

    #[test]
    fn test_validate_empty_db_path_disabled_ok() {
        let mut config = ClientConfig::new("http://localhost", "");
        config.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_colliding_db_names() {
        let mut config = ClientConfig::new("http://localhost", "/tmp/procache");
        config.db.timestamp_db = "same".into();
        config.db.cache_db = "same".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "db.cache_db",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_zero_poll_interval() {
        let mut config = ClientConfig::new("http://localhost", "/tmp/procache");
        config.ws.background_poll_interval = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "ws.background_poll_interval",
                ..
            }
        ));
    }

    #[test]
    fn test_json_pointer_source_parses() {
        let toml = r#"
[db]
path = "/tmp/procache"

[api]
base_url = "http://localhost:8080"

[ws.timestamp_source]
kind = "json_pointer"
pointer = "/meta/server_time"
"#;
        let config: ClientConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.ws.timestamp_source,
            Some(TimestampSource::JsonPointer {
                pointer: "/meta/server_time".to_string()
            })
        );
    }
}
