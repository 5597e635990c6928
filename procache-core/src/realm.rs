//! The realm: shared slots and broadcast channels connecting peers.
//!
//! A realm is the process-wide context that peer clients of one application
//! attach to. It provides:
//!
//! - named broadcast channels (best-effort fan-out, per-sender ordering
//!   only) used for cache mirroring and coordination traffic;
//! - shared string slots with synchronous access, used for the leader
//!   claim and its heartbeat.
//!
//! A peer never receives its own messages: every publication is wrapped in
//! an envelope carrying the sender id and subscriptions filter it out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::messages::BusMessage;

/// Random per-peer identifier.
pub type PeerId = Uuid;

/// Buffered messages per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Shared context for all peers of one application instance.
#[derive(Clone, Default)]
pub struct Realm {
    inner: Arc<RealmInner>,
}

#[derive(Default)]
struct RealmInner {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    slots: RwLock<HashMap<String, String>>,
}

/// A published message with its sender.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: PeerId,
    pub message: BusMessage,
}

impl Realm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to a named channel as `peer`. Creating the same name twice
    /// yields handles on the same channel.
    pub fn channel(&self, name: &str, peer: PeerId) -> BroadcastBus {
        let mut channels = self.inner.channels.lock().unwrap_or_else(|e| e.into_inner());
        let tx = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        BroadcastBus {
            name: name.to_string(),
            peer,
            tx,
        }
    }

    /// Read a shared slot.
    pub fn slot_get(&self, key: &str) -> Option<String> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Write a shared slot (last writer wins).
    pub fn slot_set(&self, key: &str, value: impl Into<String>) {
        self.inner
            .slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.into());
    }

    /// Remove a shared slot.
    pub fn slot_remove(&self, key: &str) {
        self.inner
            .slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Write `value` only while the slot still holds `expected` (`None`
    /// for absent). Returns whether the write happened.
    pub fn slot_compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: impl Into<String>,
    ) -> bool {
        let mut slots = self.inner.slots.write().unwrap_or_else(|e| e.into_inner());
        if slots.get(key).map(String::as_str) != expected {
            return false;
        }
        slots.insert(key.to_string(), value.into());
        true
    }
}

/// Handle on a named realm channel for one peer.
#[derive(Clone)]
pub struct BroadcastBus {
    name: String,
    peer: PeerId,
    tx: broadcast::Sender<Envelope>,
}

impl BroadcastBus {
    /// The peer this handle publishes as.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fan a message out to every other peer. Best-effort: with no
    /// subscribers the message is dropped.
    pub fn publish(&self, message: BusMessage) {
        debug!(channel = %self.name, kind = message.kind(), "bus publish");
        let _ = self.tx.send(Envelope {
            sender: self.peer,
            message,
        });
    }

    /// Subscribe to messages from other peers on this channel.
    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            peer: self.peer,
            rx: self.tx.subscribe(),
        }
    }
}

/// A filtered receiver: skips the subscriber's own messages and keeps
/// going after lag.
pub struct BusSubscription {
    peer: PeerId,
    rx: broadcast::Receiver<Envelope>,
}

impl BusSubscription {
    /// Next message from another peer, or `None` once the channel closes.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if envelope.sender == self.peer {
                        continue;
                    }
                    return Some(envelope.message);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
