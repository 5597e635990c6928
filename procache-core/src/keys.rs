//! Route definitions and URL/key construction.
//!
//! A route definition names a route pattern (`/users/{id}`) plus optional
//! per-route cache TTL and background-delay overrides. The composed URL
//! (pattern with placeholders substituted and the query string appended) is
//! the specific key; the pattern itself is the bucket.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A fetchable route: pattern plus per-route cache overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDef {
    /// Route pattern with `{name}` placeholders, e.g. `/users/{id}`.
    pub path: String,
    /// Cache TTL in seconds. Falls back to the client's default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<u32>,
    /// Maximum background-poll wait in milliseconds for subscribers of this
    /// route's keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_delay: Option<u64>,
}

impl RouteDef {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cache_ttl: None,
            background_delay: None,
        }
    }

    pub fn with_cache_ttl(mut self, seconds: u32) -> Self {
        self.cache_ttl = Some(seconds);
        self
    }

    pub fn with_background_delay(mut self, millis: u64) -> Self {
        self.background_delay = Some(millis);
        self
    }
}

impl From<&str> for RouteDef {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Substitute `{name}` placeholders and append a query string.
///
/// Placeholders with no matching param are left untouched, so the caller
/// notices the malformed URL instead of silently fetching a different
/// resource. Query pairs are percent-encoded and appended in the order
/// given; an existing `?` in the path switches the separator to `&`.
pub fn build_path(
    path: &str,
    params: Option<&HashMap<String, String>>,
    query: Option<&[(String, String)]>,
) -> String {
    let mut url = path.to_string();
    if let Some(params) = params {
        for (name, value) in params {
            url = url.replace(&format!("{{{name}}}"), value);
        }
    }
    if let Some(query) = query {
        if !query.is_empty() {
            let encoded: String = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str(&encoded);
        }
    }
    url
}
