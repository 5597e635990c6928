//! Bus and upstream message types.
//!
//! `BusMessage` is the realm-internal protocol between peers (cache
//! mirroring, leader election, upstream relay). `ServerMessage` is the
//! decoded form of what the upstream socket delivers; its parser accepts
//! the three wire shapes the server emits: a tagged JSON object, a bare
//! JSON map (the initial sync), and a raw string key.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entry::BucketDump;
use crate::realm::PeerId;
use crate::time::ServerTimestamp;

/// Upstream socket state, as observed by every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
    Offline,
}

impl SocketStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, SocketStatus::Connected)
    }
}

/// Peer role in the realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Holds the upstream socket and relays for everyone else.
    Leader,
    /// Forwards sends through the leader, mirrors its status.
    Follower,
    /// Transient state during an election window.
    #[default]
    Electing,
}

/// Cross-peer messages carried over the realm bus.
///
/// Tag and field names are the wire protocol; they stay stable across
/// versions so mixed-version peers keep interoperating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BusMessage {
    /// A peer wrote an entry; others mirror it (latest-wins, no rebroadcast).
    CacheSet {
        bucket: String,
        key: String,
        data: serde_json::Value,
        /// Absolute expiry in epoch milliseconds.
        expiry: i64,
        timestamp: ServerTimestamp,
    },
    /// A peer dropped a bucket; others drop it locally (no rebroadcast).
    CacheInvalidate { bucket: String },
    /// A freshly started peer asks others for their cache contents.
    CacheRequest { request_id: PeerId },
    /// Reply to `CacheRequest` with a full dump.
    CacheResponse {
        request_id: PeerId,
        dump: BucketDump,
    },
    /// Periodic leader heartbeat and election claim.
    LeaderClaim { peer_id: PeerId },
    /// Ask the current leader to rebroadcast its status.
    LeaderQuery,
    /// The leader is going away; elect immediately instead of timing out.
    LeaderStepdown { old_leader_id: PeerId },
    /// Leader-applied invalidation notice: fire subscribers, focus-aware.
    WsInvalidate {
        key: String,
        timestamp: ServerTimestamp,
    },
    /// Server re-asserted an empty bucket set; drop everything.
    WsInvalidateAll,
    /// Leader's socket status, adopted by followers.
    #[serde(rename = "ws-status")]
    WsStatusChanged { status: SocketStatus },
    /// Follower → leader: write this payload to the socket.
    WsUpstream { payload: serde_json::Value },
    /// Leader → followers: a server message outside the invalidation protocol.
    WsCustom { payload: serde_json::Value },
    /// Leader's cache-serving gate, adopted by followers.
    WsCacheEnabled {
        enabled: bool,
        explicitly_closed: bool,
    },
    /// Leader's debug-logging toggle, adopted by followers.
    WsDebugEnabled { enabled: bool },
    NetworkOnline,
    NetworkOffline,
}

impl BusMessage {
    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::CacheSet { .. } => "cache-set",
            BusMessage::CacheInvalidate { .. } => "cache-invalidate",
            BusMessage::CacheRequest { .. } => "cache-request",
            BusMessage::CacheResponse { .. } => "cache-response",
            BusMessage::LeaderClaim { .. } => "leader-claim",
            BusMessage::LeaderQuery => "leader-query",
            BusMessage::LeaderStepdown { .. } => "leader-stepdown",
            BusMessage::WsInvalidate { .. } => "ws-invalidate",
            BusMessage::WsInvalidateAll => "ws-invalidate-all",
            BusMessage::WsStatusChanged { .. } => "ws-status",
            BusMessage::WsUpstream { .. } => "ws-upstream",
            BusMessage::WsCustom { .. } => "ws-custom",
            BusMessage::WsCacheEnabled { .. } => "ws-cache-enabled",
            BusMessage::WsDebugEnabled { .. } => "ws-debug-enabled",
            BusMessage::NetworkOnline => "network-online",
            BusMessage::NetworkOffline => "network-offline",
        }
    }
}

/// A decoded upstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `{type:"invalidate", data:{bucket: ts, ...}}` or a bare JSON map.
    /// The server is authoritative over the whole bucket set; empty `data`
    /// means purge everything.
    FullSync {
        data: HashMap<String, ServerTimestamp>,
        drift_time: Option<i64>,
    },
    /// `{type:"invalidate-delta", data:{bucket: ts, ...}}`: advance the
    /// listed buckets, leave the rest alone.
    Delta {
        data: HashMap<String, ServerTimestamp>,
        drift_time: Option<i64>,
    },
    /// `{type:"invalidate", key:"..."}` or a raw non-JSON string: a single
    /// bucket invalidated at receipt time.
    SingleKey { key: String },
    /// Any other `type`: handed to custom-message listeners and relayed to
    /// followers verbatim.
    Custom { payload: serde_json::Value },
}

impl ServerMessage {
    /// Decode an upstream text frame.
    ///
    /// Accepted shapes, in order:
    /// 1. JSON object with `type: "invalidate"`: full sync from `data`,
    ///    unless the object carries a `key` instead (single-bucket form).
    /// 2. JSON object with `type: "invalidate-delta"`: delta from `data`.
    /// 3. JSON object with any other `type`: custom.
    /// 4. JSON object without `type`: the initial sync map `{bucket: ts}`.
    /// 5. Anything else: the raw text is a single bucket key.
    pub fn parse(text: &str) -> ServerMessage {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                return ServerMessage::SingleKey {
                    key: text.to_string(),
                }
            }
        };

        let map = match value {
            serde_json::Value::Object(map) => map,
            // A JSON string payload is still an opaque key.
            serde_json::Value::String(key) => return ServerMessage::SingleKey { key },
            other => return ServerMessage::Custom { payload: other },
        };

        let drift_time = map.get("driftTime").or_else(|| map.get("drift_time")).and_then(|v| v.as_i64());

        match map.get("type").and_then(|t| t.as_str()) {
            Some("invalidate") => {
                if let Some(key) = map.get("key").and_then(|k| k.as_str()) {
                    return ServerMessage::SingleKey {
                        key: key.to_string(),
                    };
                }
                ServerMessage::FullSync {
                    data: timestamp_map(map.get("data")),
                    drift_time,
                }
            }
            Some("invalidate-delta") => ServerMessage::Delta {
                data: timestamp_map(map.get("data")),
                drift_time,
            },
            Some(_) => ServerMessage::Custom {
                payload: serde_json::Value::Object(map),
            },
            // The server's initial sync is a bare {bucket: ts} map.
            None => ServerMessage::FullSync {
                data: bare_timestamp_map(&map),
                drift_time,
            },
        }
    }
}

fn timestamp_map(data: Option<&serde_json::Value>) -> HashMap<String, ServerTimestamp> {
    match data.and_then(|d| d.as_object()) {
        Some(map) => bare_timestamp_map(map),
        None => HashMap::new(),
    }
}

fn bare_timestamp_map(
    map: &serde_json::Map<String, serde_json::Value>,
) -> HashMap<String, ServerTimestamp> {
    map.iter()
        .filter_map(|(k, v)| v.as_i64().map(|ts| (k.clone(), ts)))
        .collect()
}
