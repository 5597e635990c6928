//! Peer coordination: election, heartbeat, handoff, and the upstream
//! socket.
//!
//! Exactly one peer in a realm is the leader; it owns the upstream socket
//! and relays for everyone else. Election works over the realm's shared
//! slot plus `leader-claim`/`leader-query` traffic: a starting peer adopts
//! a live leader immediately, otherwise it waits out a short election
//! window and claims the slot if nobody else did. The periodic claim
//! doubles as the heartbeat; followers poll it and re-elect when it goes
//! quiet. A leaving leader broadcasts `leader-stepdown` so followers
//! elect instantly instead of waiting out the timeout.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use procache_core::{
    now_ms, BroadcastBus, BusMessage, PeerId, PeerRole, Realm, Signal, SocketStatus,
};
use procache_storage::CacheManager;

use crate::invalidation::InvalidationEngine;
use crate::socket::{self, SocketCommand};
use crate::subscriptions::SubscriptionRegistry;

/// Shared-slot key holding the current leader's peer id.
pub(crate) const LEADER_SLOT: &str = "ws-leader-peer";
/// Shared-slot key holding the leader's last heartbeat (epoch ms).
pub(crate) const HEARTBEAT_SLOT: &str = "ws-leader-heartbeat";

/// How long a starting peer listens for a competing claim.
const ELECTION_WINDOW: Duration = Duration::from_millis(150);
/// Heartbeat age beyond which the leader is presumed dead.
const LEADER_TIMEOUT_MS: i64 = 5000;
/// Leader claim/heartbeat period; also the follower poll period.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2000);
const RECONNECT_BASE_MS: u64 = 5000;
const RECONNECT_STEP_MS: u64 = 5000;
const RECONNECT_MAX_MS: u64 = 20_000;

/// Produces the upstream URL at connect time (lets tokens rotate).
pub type UrlProvider = dyn Fn() -> String + Send + Sync;

/// Everything the coordinator is wired to at construction.
pub(crate) struct CoordinatorParts {
    pub peer_id: PeerId,
    pub realm: Realm,
    pub bus: BroadcastBus,
    pub cache: CacheManager,
    pub engine: InvalidationEngine,
    pub subs: SubscriptionRegistry,
    pub ws_status: Signal<SocketStatus>,
    pub cache_enabled: Signal<bool>,
    pub debug_enabled: Signal<bool>,
    pub online: Signal<bool>,
    pub explicitly_closed: Signal<bool>,
    pub enable_cache_before_socket: bool,
    pub url_provider: Arc<UrlProvider>,
}

/// Shared coordinator for one peer.
#[derive(Clone)]
pub(crate) struct Coordinator {
    inner: Arc<CoordInner>,
}

pub(crate) struct CoordInner {
    peer_id: PeerId,
    realm: Realm,
    bus: BroadcastBus,
    cache: CacheManager,
    engine: InvalidationEngine,
    subs: SubscriptionRegistry,
    role: Signal<PeerRole>,
    ws_status: Signal<SocketStatus>,
    cache_enabled: Signal<bool>,
    debug_enabled: Signal<bool>,
    online: Signal<bool>,
    explicitly_closed: Signal<bool>,
    enable_cache_before_socket: bool,
    url_provider: Arc<UrlProvider>,
    last_heartbeat: AtomicI64,
    reconnect_attempts: AtomicU32,
    socket_tx: Mutex<Option<mpsc::UnboundedSender<SocketCommand>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        let inner = Arc::new(CoordInner {
            peer_id: parts.peer_id,
            realm: parts.realm,
            bus: parts.bus.clone(),
            cache: parts.cache,
            engine: parts.engine,
            subs: parts.subs,
            role: Signal::new(PeerRole::Electing),
            ws_status: parts.ws_status,
            cache_enabled: parts.cache_enabled,
            debug_enabled: parts.debug_enabled,
            online: parts.online,
            explicitly_closed: parts.explicitly_closed,
            enable_cache_before_socket: parts.enable_cache_before_socket,
            url_provider: parts.url_provider,
            last_heartbeat: AtomicI64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            socket_tx: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
            watchdog_task: Mutex::new(None),
            reconnect_task: Mutex::new(None),
        });

        let listener = Arc::clone(&inner);
        let mut sub = parts.bus.subscribe();
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                listener.handle_bus_message(msg).await;
            }
        });

        Self { inner }
    }

    /// Join the realm: adopt the live leader or run an election. Resolves
    /// once a role is settled.
    pub async fn connect(&self) {
        self.inner.explicitly_closed.set(false);
        self.inner.elect().await;
    }

    /// User-initiated disconnect: closes the socket, stops reconnects,
    /// and keeps the client quiet until the next `connect`.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Graceful leave (process going away): hand leadership off without
    /// marking the realm explicitly closed.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Send an opaque payload upstream, relaying through the leader when
    /// this peer is a follower.
    pub fn send(&self, payload: serde_json::Value) {
        self.inner.send(payload);
    }

    /// Flip this peer's connectivity state.
    pub fn set_online(&self, online: bool) {
        self.inner.apply_online(online, true);
    }

    /// Toggle verbose logging realm-wide (leader broadcasts it).
    pub fn set_debug(&self, enabled: bool) {
        self.inner.debug_enabled.set(enabled);
        if self.inner.role.get() == PeerRole::Leader {
            self.inner
                .bus
                .publish(BusMessage::WsDebugEnabled { enabled });
        }
    }

    pub fn role(&self) -> Signal<PeerRole> {
        self.inner.role.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.role.get() == PeerRole::Leader
    }
}

impl CoordInner {
    fn read_leader_slot(&self) -> Option<(PeerId, i64)> {
        let leader = self.realm.slot_get(LEADER_SLOT)?.parse().ok()?;
        let heartbeat = self.realm.slot_get(HEARTBEAT_SLOT)?.parse().ok()?;
        Some((leader, heartbeat))
    }

    async fn elect(self: &Arc<Self>) {
        if self.explicitly_closed.get() {
            return;
        }

        // A live leader elsewhere wins immediately.
        if let Some((leader, heartbeat)) = self.read_leader_slot() {
            if leader != self.peer_id && now_ms() - heartbeat < LEADER_TIMEOUT_MS {
                debug!(%leader, "adopting existing leader");
                self.become_follower(heartbeat);
                self.bus.publish(BusMessage::LeaderQuery);
                return;
            }
        }

        // Election window: anyone claiming during it wins.
        self.role.set(PeerRole::Electing);
        self.bus.publish(BusMessage::LeaderQuery);
        tokio::time::sleep(ELECTION_WINDOW).await;
        if self.role.get() != PeerRole::Electing {
            return;
        }

        // Double-check the slot: a racing peer may have claimed it while
        // we slept without us seeing the claim yet.
        let expected = self.realm.slot_get(LEADER_SLOT);
        if let Some((leader, heartbeat)) = self.read_leader_slot() {
            if leader != self.peer_id && now_ms() - heartbeat < LEADER_TIMEOUT_MS {
                debug!(%leader, "lost election to slot holder");
                self.become_follower(heartbeat);
                return;
            }
        }

        // Claim atomically; simultaneous coups cannot both win.
        if self.realm.slot_compare_and_set(
            LEADER_SLOT,
            expected.as_deref(),
            self.peer_id.to_string(),
        ) {
            self.become_leader();
        } else if let Some((_, heartbeat)) = self.read_leader_slot() {
            debug!("lost election race at the slot");
            self.become_follower(heartbeat);
        } else {
            self.become_follower(now_ms());
        }
    }

    fn become_follower(self: &Arc<Self>, heartbeat: i64) {
        self.last_heartbeat.store(heartbeat, Ordering::SeqCst);
        let was_leader = self.role.get() == PeerRole::Leader;
        self.role.set(PeerRole::Follower);
        if was_leader {
            // A follower holding a socket is a defect; release it now.
            self.stop_heartbeat();
            self.close_socket();
        }
        self.ensure_watchdog();
    }

    fn become_leader(self: &Arc<Self>) {
        info!(peer = %self.peer_id, "assuming leadership");
        self.realm.slot_set(LEADER_SLOT, self.peer_id.to_string());
        self.realm.slot_set(HEARTBEAT_SLOT, now_ms().to_string());
        self.role.set(PeerRole::Leader);
        self.bus.publish(BusMessage::LeaderClaim {
            peer_id: self.peer_id,
        });
        self.start_heartbeat();
        self.connect_upstream();
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let coord = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if coord.role.get() != PeerRole::Leader {
                    break;
                }
                coord.realm.slot_set(LEADER_SLOT, coord.peer_id.to_string());
                coord.realm.slot_set(HEARTBEAT_SLOT, now_ms().to_string());
                coord.bus.publish(BusMessage::LeaderClaim {
                    peer_id: coord.peer_id,
                });
            }
        });
        if let Some(old) = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(task) = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    /// Follower-side poll: re-elect when the leader goes quiet.
    fn ensure_watchdog(self: &Arc<Self>) {
        let mut guard = self.watchdog_task.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let coord = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if coord.explicitly_closed.get() || coord.role.get() != PeerRole::Follower {
                    continue;
                }
                let mut freshest = coord.last_heartbeat.load(Ordering::SeqCst);
                if let Some((_, slot_heartbeat)) = coord.read_leader_slot() {
                    freshest = freshest.max(slot_heartbeat);
                }
                if now_ms() - freshest > LEADER_TIMEOUT_MS {
                    info!("leader heartbeat timed out; starting election");
                    coord.elect().await;
                }
            }
        }));
    }

    fn connect_upstream(self: &Arc<Self>) {
        if self.explicitly_closed.get() || self.role.get() != PeerRole::Leader {
            return;
        }
        if !self.online.get() {
            self.set_status(SocketStatus::Offline);
            return;
        }
        {
            let mut guard = self.socket_tx.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *guard = Some(tx);
            let coord = Arc::clone(self);
            tokio::spawn(async move {
                coord.run_socket(rx).await;
            });
        }
    }

    async fn run_socket(self: &Arc<Self>, mut cmd_rx: mpsc::UnboundedReceiver<SocketCommand>) {
        self.set_status(SocketStatus::Connecting);
        let url = (self.url_provider)();

        let stream = match socket::connect(&url).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "upstream connect failed");
                self.on_socket_closed(SocketStatus::Error).await;
                return;
            }
        };

        info!("upstream connected");
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_status(SocketStatus::Connected);
        // Cache serving stays gated on the first full sync unless the
        // startup config opts out of that protection.
        if self.enable_cache_before_socket {
            self.engine.enable_cache();
        }

        let (mut write, mut read) = stream.split();
        let status = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SocketCommand::Send(text)) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!(error = %e, "upstream send failed");
                            break SocketStatus::Error;
                        }
                    }
                    Some(SocketCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break SocketStatus::Disconnected;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.engine.handle_upstream(&text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break SocketStatus::Disconnected,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream read failed");
                        break SocketStatus::Error;
                    }
                },
            }
        };

        self.on_socket_closed(status).await;
    }

    async fn on_socket_closed(self: &Arc<Self>, status: SocketStatus) {
        *self.socket_tx.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let status = if self.online.get() {
            status
        } else {
            SocketStatus::Offline
        };
        self.set_status(status);
        self.set_cache_enabled(false);
        if !self.explicitly_closed.get()
            && self.role.get() == PeerRole::Leader
            && self.online.get()
        {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = (RECONNECT_BASE_MS + (u64::from(attempt) / 4) * RECONNECT_STEP_MS)
            .min(RECONNECT_MAX_MS);
        info!(attempt = attempt + 1, delay_ms = delay, "scheduling reconnect");
        let coord = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if !coord.explicitly_closed.get()
                && coord.role.get() == PeerRole::Leader
                && coord.online.get()
            {
                coord.connect_upstream();
            }
        });
        if let Some(old) = self
            .reconnect_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.abort();
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self
            .reconnect_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    fn close_socket(&self) {
        if let Some(tx) = self
            .socket_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            let _ = tx.send(SocketCommand::Close);
        }
    }

    fn set_status(&self, status: SocketStatus) {
        self.ws_status.set(status);
        if self.role.get() == PeerRole::Leader {
            self.bus.publish(BusMessage::WsStatusChanged { status });
        }
    }

    fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.set(enabled);
        if self.role.get() == PeerRole::Leader {
            self.bus.publish(BusMessage::WsCacheEnabled {
                enabled,
                explicitly_closed: self.explicitly_closed.get(),
            });
        }
    }

    fn send(&self, payload: serde_json::Value) {
        match self.role.get() {
            PeerRole::Leader => self.write_upstream(payload),
            PeerRole::Follower => self.bus.publish(BusMessage::WsUpstream { payload }),
            PeerRole::Electing => warn!("dropping send: election in progress"),
        }
    }

    fn write_upstream(&self, payload: serde_json::Value) {
        let guard = self.socket_tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) if self.ws_status.get() == SocketStatus::Connected => {
                let _ = tx.send(SocketCommand::Send(socket::payload_to_text(&payload)));
            }
            _ => warn!("dropping send: socket not open"),
        }
    }

    fn apply_online(self: &Arc<Self>, online: bool, broadcast: bool) {
        let changed = self.online.get() != online;
        self.online.set(online);
        if broadcast {
            self.bus.publish(if online {
                BusMessage::NetworkOnline
            } else {
                BusMessage::NetworkOffline
            });
        }
        if !changed {
            return;
        }
        if online {
            info!("network online");
            self.reconnect_attempts.store(0, Ordering::SeqCst);
            if self.role.get() == PeerRole::Leader {
                self.connect_upstream();
            }
            // Consumers refetch whatever they missed while offline.
            self.subs.fire_global();
        } else {
            info!("network offline");
            self.cancel_reconnect();
            if self.role.get() == PeerRole::Leader {
                self.set_status(SocketStatus::Offline);
                self.set_cache_enabled(false);
                self.close_socket();
            }
        }
    }

    fn disconnect(self: &Arc<Self>) {
        info!("explicit disconnect");
        self.explicitly_closed.set(true);
        self.cancel_reconnect();
        self.close_socket();
        self.set_status(SocketStatus::Disconnected);
        self.set_cache_enabled(false);
        self.step_down();
    }

    fn shutdown(self: &Arc<Self>) {
        info!("shutting down");
        self.cancel_reconnect();
        self.close_socket();
        self.step_down();
    }

    /// Release leadership (if held) so followers elect immediately.
    fn step_down(self: &Arc<Self>) {
        if self.role.get() == PeerRole::Leader {
            self.bus.publish(BusMessage::LeaderStepdown {
                old_leader_id: self.peer_id,
            });
            self.realm.slot_remove(LEADER_SLOT);
            self.realm.slot_remove(HEARTBEAT_SLOT);
            self.stop_heartbeat();
        }
        self.role.set(PeerRole::Follower);
    }

    async fn handle_bus_message(self: &Arc<Self>, msg: BusMessage) {
        match msg {
            BusMessage::LeaderClaim { peer_id } => {
                self.last_heartbeat.store(now_ms(), Ordering::SeqCst);
                match self.role.get() {
                    PeerRole::Electing => {
                        debug!(%peer_id, "claim received during election; following");
                        self.become_follower(now_ms());
                    }
                    PeerRole::Leader => {
                        // Two leaders briefly: the shared slot arbitrates.
                        if let Some((slot_leader, _)) = self.read_leader_slot() {
                            if slot_leader == peer_id {
                                warn!(%peer_id, "yielding leadership to slot holder");
                                self.become_follower(now_ms());
                            }
                        }
                    }
                    PeerRole::Follower => {}
                }
            }
            BusMessage::LeaderQuery => {
                if self.role.get() == PeerRole::Leader {
                    self.bus.publish(BusMessage::LeaderClaim {
                        peer_id: self.peer_id,
                    });
                    self.bus.publish(BusMessage::WsStatusChanged {
                        status: self.ws_status.get(),
                    });
                    self.bus.publish(BusMessage::WsCacheEnabled {
                        enabled: self.cache_enabled.get(),
                        explicitly_closed: self.explicitly_closed.get(),
                    });
                    self.bus.publish(BusMessage::WsDebugEnabled {
                        enabled: self.debug_enabled.get(),
                    });
                }
            }
            BusMessage::LeaderStepdown { old_leader_id } => {
                debug!(%old_leader_id, "leader stepped down");
                if self.role.get() != PeerRole::Leader {
                    let coord = Arc::clone(self);
                    tokio::spawn(async move {
                        coord.elect().await;
                    });
                }
            }
            BusMessage::WsStatusChanged { status } => {
                if self.role.get() != PeerRole::Leader {
                    self.ws_status.set(status);
                }
            }
            BusMessage::WsCacheEnabled {
                enabled,
                explicitly_closed,
            } => {
                if self.role.get() != PeerRole::Leader {
                    self.cache_enabled.set(enabled);
                    self.explicitly_closed.set(explicitly_closed);
                }
            }
            BusMessage::WsDebugEnabled { enabled } => {
                if self.role.get() != PeerRole::Leader {
                    self.debug_enabled.set(enabled);
                }
            }
            BusMessage::WsUpstream { payload } => {
                if self.role.get() == PeerRole::Leader {
                    self.write_upstream(payload);
                }
            }
            BusMessage::WsCustom { payload } => {
                if self.role.get() != PeerRole::Leader {
                    self.engine.dispatch_custom(&payload);
                }
            }
            BusMessage::WsInvalidate { key, .. } => {
                // The data side already traveled on the cache channel;
                // only subscribers need a nudge here.
                if self.role.get() != PeerRole::Leader {
                    self.subs.notify_key(&key);
                }
            }
            BusMessage::WsInvalidateAll => {
                if self.role.get() != PeerRole::Leader {
                    self.cache.clear_memory().await;
                    self.subs.fire_global();
                    self.subs.notify_all();
                }
            }
            BusMessage::NetworkOnline => self.apply_online(true, false),
            BusMessage::NetworkOffline => self.apply_online(false, false),
            // Cache mirroring traffic is the cache manager's business.
            _ => {}
        }
    }
}
