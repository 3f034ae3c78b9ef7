//! # Node Orchestration
//!
//! [`Node`] wires the collaborators together: it drains the transport and
//! DHT event streams in one background loop, owns the channel registry, and
//! exposes the public peer API: connect by URI, correlated request by
//! identity, and the inbound application message stream.
//!
//! ## Registry
//!
//! Channels are indexed twice. `by_conn` keys every channel (direct and
//! virtual) by its [`ConnId`] and is the dispatch path for inbound frames.
//! `by_peer` keys handshake-completed channels by remote identity and is the
//! lookup path for outbound requests. A `waiters` table coalesces concurrent
//! dials to the same peer: the first caller dials, the rest subscribe, and a
//! per-entry timeout task fails everyone if the handshake never lands.
//!
//! ## Relay routing
//!
//! A frame whose envelope is `Relay { to, from, .. }` never reaches channel
//! dispatch. If `to` is this node, the inner envelope is delivered on a
//! virtual channel keyed by the hop peer, created on first contact so that
//! replies flow back through the same hop. Otherwise the whole frame is
//! forwarded verbatim over the direct channel to `to`: exactly one hop, a
//! relayed frame is never re-wrapped.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{AppMessage, Channel, ChannelShared, ChannelState, ConnId};
use crate::dht::{Dht, DhtEvent};
use crate::error::{Error, Result};
use crate::identity::{Identity, Keypair};
use crate::messages::{self, Advertisement, Envelope};
use crate::sync::{MutexExt, RwLockExt};
use crate::transport::{Transport, TransportConnId, TransportEvent};
use crate::uri::{parse_direct_addr, PeerUri, RELAY_SCHEME};

/// Default dial and request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

const APP_CHANNEL_CAPACITY: usize = 256;

/// Node configuration. [`Default`] yields an unusable node; set at least one
/// bind address, an advertise URI, or a relay peer.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Listener addresses (`wss://host:port`).
    pub bind: Vec<String>,
    /// Advertised transport URI. `None` advertises the first bind address;
    /// ignored when a relay peer is configured.
    pub advertise: Option<String>,
    /// Direct URI of the relay peer to route inbound traffic through.
    /// At most one entry.
    pub relay_peers: Vec<String>,
    /// Opaque application data carried in this node's advertisement.
    pub advertise_data: Vec<u8>,
    /// Persisted identity secret. `None` generates a fresh keypair.
    pub secret_key: Option<[u8; 32]>,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: Vec::new(),
            advertise: None,
            relay_peers: Vec::new(),
            advertise_data: Vec::new(),
            secret_key: None,
            dial_timeout: DEFAULT_TIMEOUT,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.relay_peers.len() > 1 {
            return Err(Error::Config(
                "multiple relay peers are not supported".into(),
            ));
        }
        if self.relay_peers.is_empty() && self.bind.is_empty() && self.advertise.is_none() {
            return Err(Error::Config(
                "node needs a bind address, an advertise uri, or a relay peer".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time counters for diagnostics and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Channels in the connection index, direct and virtual.
    pub connections: usize,
    /// Handshake-completed peers.
    pub peers: usize,
    /// Requests in flight across all channels.
    pub pending_requests: usize,
    /// Dials with callers still waiting.
    pub waiters: usize,
}

struct WaitEntry {
    /// Guards the timeout task against a newer entry for the same peer.
    token: u64,
    senders: Vec<oneshot::Sender<Result<Channel>>>,
}

#[derive(Default)]
struct Registry {
    by_conn: RwLock<HashMap<ConnId, Channel>>,
    by_peer: RwLock<HashMap<Identity, Channel>>,
    waiters: Mutex<HashMap<Identity, WaitEntry>>,
    bindings: RwLock<Vec<String>>,
}

impl Registry {
    fn ready_channel(&self, peer: &Identity) -> Option<Channel> {
        self.by_peer
            .read_guard()
            .get(peer)
            .filter(|ch| ch.state() != ChannelState::Closed)
            .cloned()
    }
}

struct NodeInner {
    /// Self-reference for tasks spawned from event handlers.
    this: Weak<NodeInner>,
    keypair: Keypair,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    dht: Arc<dyn Dht>,
    advert: Advertisement,
    shared: ChannelShared,
    registry: Registry,
    next_wait_token: AtomicU64,
    app_rx: Mutex<Option<mpsc::Receiver<AppMessage>>>,
}

/// A running peer node. Dropping the handle does not stop the event loop;
/// call [`Node::shutdown`].
pub struct Node {
    inner: Arc<NodeInner>,
    event_loop: JoinHandle<()>,
}

impl Node {
    /// Bind listeners, publish the node's own advertisement, start the event
    /// loop, and (in relay mode) establish the channel to the relay peer.
    pub async fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        dht: Arc<dyn Dht>,
    ) -> Result<Self> {
        config.validate()?;

        let keypair = match &config.secret_key {
            Some(secret) => Keypair::from_secret_key_bytes(secret),
            None => Keypair::generate(),
        };
        let identity = keypair.identity();

        let transport_rx = transport
            .take_events()
            .ok_or_else(|| Error::Transport("event stream already taken".into()))?;
        let dht_rx = dht
            .take_events()
            .ok_or_else(|| Error::Dht("event stream already taken".into()))?;

        for addr in &config.bind {
            transport.bind(addr).await?;
        }

        // Relay mode routes all inbound traffic through one relay peer and
        // advertises that fact instead of a direct address.
        let relay_hop = match config.relay_peers.first() {
            None => None,
            Some(uri) => match PeerUri::parse(uri)? {
                hop @ PeerUri::Direct { .. } => Some(hop),
                PeerUri::Relay { .. } => {
                    return Err(Error::Config(
                        "relay peer must be reachable over a direct uri".into(),
                    ))
                }
            },
        };

        let advert_uri = if let Some(hop) = &relay_hop {
            format!("{RELAY_SCHEME}://{}", hop.peer())
        } else if let Some(advertise) = &config.advertise {
            parse_direct_addr(advertise)?;
            advertise.clone()
        } else {
            // validate() guarantees at least one bind address here.
            config.bind[0].clone()
        };

        let advert = Advertisement::new(identity, advert_uri, config.advertise_data.clone());
        dht.post(DhtEvent::HoldPeer {
            advertisement: advert.clone(),
        })
        .await?;

        let (app_tx, app_rx) = mpsc::channel(APP_CHANNEL_CAPACITY);
        let shared = ChannelShared {
            dht: Arc::clone(&dht),
            local_ad: advert.clone(),
            request_timeout: config.request_timeout,
            app_tx,
        };

        let inner = Arc::new_cyclic(|this| NodeInner {
            this: this.clone(),
            keypair,
            config,
            transport,
            dht,
            advert,
            shared,
            registry: Registry::default(),
            next_wait_token: AtomicU64::new(0),
            app_rx: Mutex::new(Some(app_rx)),
        });

        let event_loop = tokio::spawn(run_event_loop(Arc::clone(&inner), transport_rx, dht_rx));

        if let Some(hop) = relay_hop {
            // The loop task pins the collaborators through `inner`; a failed
            // bootstrap must not leave it running detached.
            if let Err(e) = inner.connect_uri(&hop.to_string()).await {
                event_loop.abort();
                return Err(e);
            }
        }

        info!(
            peer = %identity.short(),
            advertise = %inner.advert.dial_uri(),
            "node started"
        );
        Ok(Self { inner, event_loop })
    }

    pub fn identity(&self) -> Identity {
        self.inner.advert.peer
    }

    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    /// Listener URIs the transport reported bound so far.
    pub fn bindings(&self) -> Vec<String> {
        self.inner
            .registry
            .bindings
            .read_guard()
            .clone()
    }

    /// This node's dialable URI, `a` parameter included.
    pub fn advertise_uri(&self) -> String {
        self.inner.advert.dial_uri()
    }

    pub fn advertisement(&self) -> Advertisement {
        self.inner.advert.clone()
    }

    /// Establish (or reuse) a channel to the peer named by `uri`. Resolves
    /// once the handshake completes.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        self.inner.connect_uri(uri).await.map(|_| ())
    }

    /// Correlated request to a peer by identity. Resolves the peer through
    /// the open-channel index or the DHT, connecting on demand.
    pub async fn request(&self, peer: &Identity, tag: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let channel = self.inner.fetch_channel(peer).await?;
        channel.request(tag, payload).await
    }

    /// Node-level publish is declared but not implemented; use
    /// [`Node::request`] or a channel-level publish instead.
    pub async fn publish(&self, _peer: &Identity, _tag: &str, _payload: Vec<u8>) -> Result<()> {
        Err(Error::Unimplemented("publish"))
    }

    /// Take the inbound application message stream. Yields `Some` exactly
    /// once.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<AppMessage>> {
        self.inner.app_rx.guard().take()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        let registry = &self.inner.registry;
        let by_conn = registry.by_conn.read_guard();
        TelemetrySnapshot {
            connections: by_conn.len(),
            peers: registry.by_peer.read_guard().len(),
            pending_requests: by_conn.values().map(Channel::pending_len).sum(),
            waiters: registry.waiters.guard().len(),
        }
    }

    /// Stop the event loop, close every channel, and fail all waiting dials.
    pub fn shutdown(&self) {
        self.event_loop.abort();
        let registry = &self.inner.registry;
        let channels: Vec<Channel> = {
            let mut by_conn = registry.by_conn.write_guard();
            by_conn.drain().map(|(_, ch)| ch).collect()
        };
        for channel in channels {
            channel.close();
        }
        registry.by_peer.write_guard().clear();
        let waiters: Vec<WaitEntry> = {
            let mut waiters = registry.waiters.guard();
            waiters.drain().map(|(_, entry)| entry).collect()
        };
        for entry in waiters {
            for tx in entry.senders {
                let _ = tx.send(Err(Error::Closed));
            }
        }
        info!(peer = %self.inner.advert.peer.short(), "node shut down");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.inner.advert.peer)
            .field("advertise", &self.inner.advert.uri)
            .finish_non_exhaustive()
    }
}

async fn run_event_loop(
    inner: Arc<NodeInner>,
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    mut dht_rx: mpsc::Receiver<DhtEvent>,
) {
    let mut transport_open = true;
    let mut dht_open = true;
    loop {
        tokio::select! {
            event = transport_rx.recv(), if transport_open => match event {
                Some(event) => inner.handle_transport_event(event).await,
                None => transport_open = false,
            },
            event = dht_rx.recv(), if dht_open => match event {
                Some(event) => inner.handle_dht_event(event).await,
                None => dht_open = false,
            },
            else => break,
        }
    }
    debug!(peer = %inner.advert.peer.short(), "event loop drained");
}

impl NodeInner {
    fn identity(&self) -> Identity {
        self.advert.peer
    }

    async fn connect_uri(&self, uri: &str) -> Result<Channel> {
        match PeerUri::parse(uri)? {
            parsed @ PeerUri::Direct { peer, .. } => {
                self.connect_direct(peer, parsed.to_string()).await
            }
            PeerUri::Relay { relay, peer } => self.connect_relay(relay, peer).await,
        }
    }

    /// Dial-coalescing direct connect: the first caller for a peer dials,
    /// later callers wait on the same entry, and a timeout task bounds the
    /// whole attempt.
    async fn connect_direct(&self, peer: Identity, uri: String) -> Result<Channel> {
        if let Some(channel) = self.registry.ready_channel(&peer) {
            return Ok(channel);
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.registry.waiters.guard();
            match waiters.entry(peer) {
                Entry::Occupied(mut entry) => entry.get_mut().senders.push(tx),
                Entry::Vacant(entry) => {
                    let token = self.next_wait_token.fetch_add(1, Ordering::Relaxed);
                    entry.insert(WaitEntry {
                        token,
                        senders: vec![tx],
                    });
                    self.spawn_dial(peer, uri, token);
                }
            }
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }

    fn spawn_dial(&self, peer: Identity, uri: String, token: u64) {
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        let timer = Arc::clone(&inner);
        tokio::spawn(async move {
            debug!(peer = %peer.short(), %uri, "dialing");
            if let Err(e) = inner.transport.dial(&uri).await {
                warn!(peer = %peer.short(), error = %e, "dial failed");
                let message = e.to_string();
                inner.fail_waiters_if(peer, token, || Error::Transport(message.clone()));
            }
        });
        let deadline = self.config.dial_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            timer.fail_waiters_if(peer, token, || Error::Timeout {
                origin: format!("dial {}", peer.short()),
            });
        });
    }

    /// Connect to `peer` through `relay`, coalescing with any attempt
    /// already in flight for the peer so concurrent callers share one
    /// virtual channel.
    async fn connect_relay(&self, relay: Identity, peer: Identity) -> Result<Channel> {
        if let Some(channel) = self.registry.ready_channel(&peer) {
            return Ok(channel);
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.registry.waiters.guard();
            match waiters.entry(peer) {
                Entry::Occupied(mut entry) => entry.get_mut().senders.push(tx),
                Entry::Vacant(entry) => {
                    let token = self.next_wait_token.fetch_add(1, Ordering::Relaxed);
                    entry.insert(WaitEntry {
                        token,
                        senders: vec![tx],
                    });
                    self.spawn_relay_connect(relay, peer, token);
                }
            }
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }

    fn spawn_relay_connect(&self, relay: Identity, peer: Identity, token: u64) {
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        let timer = Arc::clone(&inner);
        tokio::spawn(async move {
            if let Err(e) = inner.establish_relay(relay, peer).await {
                warn!(
                    relay = %relay.short(),
                    peer = %peer.short(),
                    error = %e,
                    "relay connect failed"
                );
                inner.fail_waiters_if(peer, token, || e.replicate());
            }
        });
        let deadline = self.config.dial_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            timer.fail_waiters_if(peer, token, || Error::Timeout {
                origin: format!("relay connect {}", peer.short()),
            });
        });
    }

    /// Resolve the hop, register the virtual channel, and drive its
    /// handshake, which releases the waiting dials. The hop channel must be
    /// direct; one virtual channel exists per hop, so targeting a different
    /// peer through the same relay replaces the previous virtual channel.
    async fn establish_relay(&self, relay: Identity, peer: Identity) -> Result<Channel> {
        if let Some(channel) = self.registry.ready_channel(&peer) {
            self.resolve_waiters(peer, channel.clone());
            return Ok(channel);
        }
        let hop = self.fetch_channel(&relay).await?;
        if !hop.is_direct() {
            return Err(Error::RelayTopology);
        }

        let conn = ConnId::Relay(relay);
        let existing = {
            let by_conn = self.registry.by_conn.read_guard();
            by_conn.get(&conn).cloned()
        };
        if let Some(existing) = existing {
            if existing.state() == ChannelState::Ready && existing.expected_peer() == Some(peer) {
                self.resolve_waiters(peer, existing.clone());
                return Ok(existing);
            }
            warn!(
                relay = %relay.short(),
                peer = %peer.short(),
                "replacing virtual channel through relay"
            );
            self.remove_connection(&conn);
        }

        let channel = Channel::new_relay(&hop, peer, self.shared.clone())?;
        self.registry
            .by_conn
            .write_guard()
            .insert(conn, channel.clone());
        self.finish_handshake(channel.clone()).await?;
        Ok(channel)
    }

    /// Channel to a peer by identity: open channel first, then DHT lookup
    /// plus connect.
    async fn fetch_channel(&self, peer: &Identity) -> Result<Channel> {
        if let Some(channel) = self.registry.ready_channel(peer) {
            return Ok(channel);
        }
        match self.dht.fetch_peer(peer).await? {
            Some(ad) => Box::pin(self.connect_uri(&ad.dial_uri())).await,
            None => Err(Error::NotFound(peer.to_hex())),
        }
    }

    /// Drive the handshake on a freshly registered channel, then index it by
    /// peer and release any waiting dials.
    async fn finish_handshake(&self, channel: Channel) -> Result<Advertisement> {
        match channel.handshake().await {
            Ok(ad) => {
                let previous = self
                    .registry
                    .by_peer
                    .write_guard()
                    .insert(ad.peer, channel.clone());
                if let Some(previous) = previous {
                    if !previous.same(&channel) {
                        debug!(peer = %ad.peer.short(), "superseding previous channel to peer");
                    }
                }
                self.resolve_waiters(ad.peer, channel);
                Ok(ad)
            }
            Err(e) => {
                warn!(conn = %channel.conn_id(), error = %e, "handshake failed");
                self.remove_channel(&channel);
                Err(e)
            }
        }
    }

    /// Tear down `channel` only if it is still the one indexed under its
    /// conn id; a replacement registered in the meantime stays untouched.
    fn remove_channel(&self, channel: &Channel) {
        let conn = channel.conn_id().clone();
        let indexed = {
            let by_conn = self.registry.by_conn.read_guard();
            by_conn.get(&conn).is_some_and(|ch| ch.same(channel))
        };
        if indexed {
            self.remove_connection(&conn);
        } else {
            channel.close();
        }
    }

    fn spawn_handshake(&self, channel: Channel) {
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            // finish_handshake already logged and cleaned up on failure.
            let _ = inner.finish_handshake(channel).await;
        });
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Bound { addrs } => {
                let mut bindings = self.registry.bindings.write_guard();
                for addr in addrs {
                    if !bindings.contains(&addr) {
                        bindings.push(addr);
                    }
                }
            }
            TransportEvent::Accepted { conn } | TransportEvent::Dialed { conn } => {
                let channel =
                    Channel::new_direct(conn.clone(), Arc::clone(&self.transport), self.shared.clone());
                self.registry
                    .by_conn
                    .write_guard()
                    .insert(ConnId::Direct(conn), channel.clone());
                self.spawn_handshake(channel);
            }
            TransportEvent::Message { conn, frame } => self.dispatch_frame(conn, frame).await,
            TransportEvent::Closed { conn } => {
                self.remove_connection(&ConnId::Direct(conn));
            }
            TransportEvent::Error { message } => {
                error!(%message, "transport error");
            }
            TransportEvent::ConnectionError { conn, message } => {
                warn!(%conn, %message, "connection error");
                self.remove_connection(&ConnId::Direct(conn));
            }
        }
    }

    async fn dispatch_frame(&self, conn: TransportConnId, frame: Vec<u8>) {
        let conn_id = ConnId::Direct(conn);
        let channel = {
            let by_conn = self.registry.by_conn.read_guard();
            by_conn.get(&conn_id).cloned()
        };
        let Some(channel) = channel else {
            warn!(conn = %conn_id, "frame for unknown connection, dropping");
            return;
        };
        let envelope: Envelope = match messages::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                // A peer speaking garbage loses its channel, nothing more.
                warn!(conn = %conn_id, error = %e, "undecodable frame, closing channel");
                self.remove_connection(&conn_id);
                return;
            }
        };
        debug!(conn = %conn_id, kind = envelope.kind(), "inbound frame");
        match envelope {
            Envelope::Relay { to, from, payload } => {
                self.handle_relay(channel, to, from, payload, frame).await;
            }
            envelope => {
                if let Err(e) = channel.handle_envelope(envelope).await {
                    warn!(conn = %conn_id, error = %e, "channel dispatch failed, closing channel");
                    self.remove_connection(&conn_id);
                }
            }
        }
    }

    /// Route a relay envelope: deliver locally on the hop's virtual channel
    /// when we are the destination, otherwise forward the original frame
    /// verbatim over the direct channel to the destination.
    async fn handle_relay(
        &self,
        channel: Channel,
        to: Identity,
        from: Identity,
        payload: Vec<u8>,
        frame: Vec<u8>,
    ) {
        if to != self.identity() {
            let dest = self.registry.ready_channel(&to);
            let Some(dest) = dest else {
                warn!(
                    to = %to.short(),
                    from = %from.short(),
                    "trying to relay, but no connection to target; dropping"
                );
                return;
            };
            if let Err(e) = dest.forward_frame(frame).await {
                warn!(to = %to.short(), error = %e, "relay forward failed");
            }
            return;
        }

        let Some(hop_peer) = channel.remote_peer() else {
            warn!(conn = %channel.conn_id(), "relay frame before hop handshake, dropping");
            return;
        };

        let conn = ConnId::Relay(hop_peer);
        let virtual_channel = {
            let by_conn = self.registry.by_conn.read_guard();
            by_conn.get(&conn).cloned()
        };
        let virtual_channel = match virtual_channel {
            Some(existing) => {
                if existing.expected_peer() != Some(from) {
                    warn!(
                        hop = %hop_peer.short(),
                        from = %from.short(),
                        "relay frame from unexpected origin, dropping"
                    );
                    return;
                }
                existing
            }
            None => {
                // First contact from `from` through this hop: build the
                // reflected virtual channel and handshake back.
                let created = match Channel::new_relay(&channel, from, self.shared.clone()) {
                    Ok(created) => created,
                    Err(e) => {
                        warn!(hop = %hop_peer.short(), error = %e, "cannot reflect relay channel");
                        return;
                    }
                };
                self.registry
                    .by_conn
                    .write_guard()
                    .insert(conn.clone(), created.clone());
                self.spawn_handshake(created.clone());
                created
            }
        };

        let inner: Envelope = match messages::decode(&payload) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(conn = %conn, error = %e, "undecodable relayed envelope, dropping");
                return;
            }
        };
        if matches!(inner, Envelope::Relay { .. }) {
            warn!(conn = %conn, "chained relay envelope, dropping");
            return;
        }
        if let Err(e) = virtual_channel.handle_envelope(inner).await {
            warn!(conn = %conn, error = %e, "relayed dispatch failed, closing channel");
            self.remove_connection(&conn);
        }
    }

    async fn handle_dht_event(&self, event: DhtEvent) {
        match event {
            DhtEvent::GossipTo { peers, bundle } => {
                let Some(inner) = self.this.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    for peer in peers {
                        if peer == inner.identity() {
                            continue;
                        }
                        match inner.fetch_channel(&peer).await {
                            Ok(channel) => {
                                if let Err(e) = channel.gossip(bundle.clone()).await {
                                    warn!(peer = %peer.short(), error = %e, "gossip send failed");
                                }
                            }
                            Err(e) => {
                                debug!(peer = %peer.short(), error = %e, "gossip target unreachable");
                            }
                        }
                    }
                });
            }
            DhtEvent::HoldPeer { advertisement } => {
                // Record content is not vetted here; the backend owns its
                // own acceptance policy.
                if let Err(e) = self.dht.post(DhtEvent::HoldPeer { advertisement }).await {
                    warn!(error = %e, "hold re-post failed");
                }
            }
            DhtEvent::RemoteGossip { from, .. } => {
                debug!(from = %from.short(), "ignoring remote gossip event from backend");
            }
        }
    }

    /// Tear down a channel: drop both indexes and fail its in-flight
    /// requests. When a direct channel to a relay peer dies, the virtual
    /// channel tunnelled through it dies with it. Waiting dials are failed
    /// by the attempt that registered them, not here.
    fn remove_connection(&self, conn: &ConnId) {
        let channel = {
            let mut by_conn = self.registry.by_conn.write_guard();
            by_conn.remove(conn)
        };
        let Some(channel) = channel else {
            return;
        };
        channel.close();
        debug!(conn = %conn, "connection removed");

        if let Some(peer) = channel.expected_peer() {
            {
                let mut by_peer = self.registry.by_peer.write_guard();
                if by_peer.get(&peer).is_some_and(|ch| ch.same(&channel)) {
                    by_peer.remove(&peer);
                }
            }
            if matches!(conn, ConnId::Direct(_)) {
                self.remove_connection(&ConnId::Relay(peer));
            }
        }
    }

    fn resolve_waiters(&self, peer: Identity, channel: Channel) {
        let entry = {
            let mut waiters = self.registry.waiters.guard();
            waiters.remove(&peer)
        };
        if let Some(entry) = entry {
            for tx in entry.senders {
                let _ = tx.send(Ok(channel.clone()));
            }
        }
    }

    /// Fail waiters only if the entry is still the one the caller created.
    /// A stale timeout task must not kill a newer dial to the same peer.
    fn fail_waiters_if(&self, peer: Identity, token: u64, make: impl Fn() -> Error) {
        let entry = {
            let mut waiters = self.registry.waiters.guard();
            match waiters.get(&peer) {
                Some(entry) if entry.token == token => waiters.remove(&peer),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            for tx in entry.senders {
                let _ = tx.send(Err(make()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_rejected() {
        let err = NodeConfig::default().validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn single_bind_address_is_enough() {
        let config = NodeConfig {
            bind: vec!["wss://127.0.0.1:9000".into()],
            ..NodeConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn multiple_relay_peers_are_rejected() {
        let config = NodeConfig {
            relay_peers: vec!["wss://a:1?a=00".into(), "wss://b:2?a=00".into()],
            ..NodeConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
