//! # Per-Peer Channel
//!
//! A [`Channel`] is one logical RPC channel to a remote peer, layered over
//! an injected byte sink: either a transport connection or a relay wrapper
//! that tunnels frames through another (direct) channel. The channel owns
//! the framing protocol (handshake, correlated request/response, gossip and
//! fire-and-forget publishes) and a pending-request table that completes
//! each request exactly once, by reply, timeout, or close.
//!
//! ## Lifecycle
//!
//! `Dialing → Connected → Ready → Closed`. The dialing phase is tracked by
//! the node's waiter table; a `Channel` exists from the moment the
//! underlying connection does, in `Connected` (awaiting handshake). The
//! `$id$` handshake round trip moves it to `Ready`, at which point the node
//! indexes it by the remote peer's identity. Close is terminal: a closed
//! channel is never redialed, a fresh one is created instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::dht::{Dht, DhtEvent};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::messages::{self, Advertisement, Envelope};
use crate::sync::RwLockExt;
use crate::tracker::RequestTracker;
use crate::transport::{Transport, TransportConnId};

/// Namespaced key of a channel in the node's connection-state index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnId {
    /// Transport-originated connection.
    Direct(TransportConnId),
    /// Virtual channel tunnelled through the named relay peer.
    Relay(Identity),
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnId::Direct(conn) => write!(f, "direct:{conn}"),
            ConnId::Relay(peer) => write!(f, "relay:{peer}"),
        }
    }
}

/// Channel lifecycle state. See module docs for the transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Underlying connection up, handshake not yet completed.
    Connected,
    /// Handshake done; indexed by remote peer and usable for requests.
    Ready,
    /// Terminal. In-flight requests have been failed.
    Closed,
}

/// Inbound application message surfaced to the node's consumer.
pub struct AppMessage {
    /// Sender identity, when the handshake on the originating channel has
    /// completed.
    pub from: Option<Identity>,
    pub tag: String,
    pub payload: Vec<u8>,
    pub responder: Responder,
}

impl std::fmt::Debug for AppMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppMessage")
            .field("from", &self.from)
            .field("tag", &self.tag)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Reply handle for an inbound application message.
pub struct Responder {
    channel: Channel,
    id: Option<u64>,
}

impl Responder {
    /// Reply under the originating request id. Fails with `Protocol` if the
    /// inbound message was fire-and-forget.
    pub async fn respond(&self, payload: Vec<u8>) -> Result<()> {
        match self.id {
            Some(id) => self.channel.reply(id, payload).await,
            None => Err(Error::Protocol(
                "cannot respond to a message without a request id".into(),
            )),
        }
    }
}

/// Dependencies every channel shares with its owning node.
#[derive(Clone)]
pub(crate) struct ChannelShared {
    pub dht: Arc<dyn Dht>,
    /// This node's own advertisement, served in handshake replies.
    pub local_ad: Advertisement,
    pub request_timeout: Duration,
    pub app_tx: mpsc::Sender<AppMessage>,
}

/// Injected byte-send primitive: the one thing a channel knows about how
/// its frames reach the peer.
enum Sink {
    Direct {
        transport: Arc<dyn Transport>,
        conn: TransportConnId,
    },
    Relay {
        /// The (direct) channel to the relay peer.
        hop: Channel,
        /// Destination peer behind the relay.
        to: Identity,
        /// Our own identity, stamped on the wrapper for reply routing.
        from: Identity,
    },
}

impl Sink {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        match self {
            Sink::Direct { transport, conn } => transport.send(&[conn.clone()], frame).await,
            Sink::Relay { hop, to, from } => {
                let wrapped = messages::encode(&Envelope::Relay {
                    to: *to,
                    from: *from,
                    payload: frame,
                })?;
                // One hop only: the relay channel itself must sit on a
                // direct connection.
                match &hop.inner.sink {
                    Sink::Direct { transport, conn } => {
                        transport.send(&[conn.clone()], wrapped).await
                    }
                    Sink::Relay { .. } => Err(Error::RelayTopology),
                }
            }
        }
    }
}

/// One logical peer channel. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    conn: ConnId,
    sink: Sink,
    shared: ChannelShared,
    next_id: AtomicU64,
    pending: RequestTracker<Vec<u8>>,
    remote: RwLock<Option<Advertisement>>,
    state: RwLock<ChannelState>,
}

impl Channel {
    pub(crate) fn new_direct(
        conn: TransportConnId,
        transport: Arc<dyn Transport>,
        shared: ChannelShared,
    ) -> Self {
        Self::new(
            ConnId::Direct(conn.clone()),
            Sink::Direct { transport, conn },
            shared,
        )
    }

    /// Build a virtual channel to `to` tunnelled through `hop`. Fails with
    /// `RelayTopology` if `hop` is itself relay-derived.
    pub(crate) fn new_relay(hop: &Channel, to: Identity, shared: ChannelShared) -> Result<Self> {
        let relay_peer = match &hop.inner.conn {
            ConnId::Direct(_) => hop
                .remote_peer()
                .ok_or_else(|| Error::Protocol("relay hop has not completed handshake".into()))?,
            ConnId::Relay(_) => return Err(Error::RelayTopology),
        };
        let from = shared.local_ad.peer;
        Ok(Self::new(
            ConnId::Relay(relay_peer),
            Sink::Relay {
                hop: hop.clone(),
                to,
                from,
            },
            shared,
        ))
    }

    fn new(conn: ConnId, sink: Sink, shared: ChannelShared) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                conn,
                sink,
                shared,
                next_id: AtomicU64::new(1),
                pending: RequestTracker::new(),
                remote: RwLock::new(None),
                state: RwLock::new(ChannelState::Connected),
            }),
        }
    }

    pub fn conn_id(&self) -> &ConnId {
        &self.inner.conn
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.read_guard()
    }

    /// The remote peer's advertisement, after a successful handshake.
    pub fn remote(&self) -> Option<Advertisement> {
        self.inner.remote.read_guard().clone()
    }

    pub fn remote_peer(&self) -> Option<Identity> {
        self.inner
            .remote
            .read_guard()
            .as_ref()
            .map(|ad| ad.peer)
    }

    /// The peer this channel is meant for: the handshaked remote, or the
    /// relay destination it was constructed toward.
    pub(crate) fn expected_peer(&self) -> Option<Identity> {
        if let Some(peer) = self.remote_peer() {
            return Some(peer);
        }
        match &self.inner.sink {
            Sink::Relay { to, .. } => Some(*to),
            Sink::Direct { .. } => None,
        }
    }

    pub(crate) fn is_direct(&self) -> bool {
        matches!(self.inner.conn, ConnId::Direct(_))
    }

    pub(crate) fn same(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    /// Run the `$id$` exchange: request the remote's advertisement, record
    /// it, move to `Ready`, and hand the record to the DHT. Index
    /// registration and waiter release are the caller's (node's) job.
    pub(crate) async fn handshake(&self) -> Result<Advertisement> {
        let payload = self
            .round_trip(Envelope::Handshake { id: 0 }, "handshake")
            .await?;
        let ad: Advertisement = messages::decode(&payload)?;
        if let Sink::Relay { to, .. } = &self.inner.sink {
            if ad.peer != *to {
                return Err(Error::Protocol(format!(
                    "relay handshake answered by {} instead of {}",
                    ad.peer.short(),
                    to.short()
                )));
            }
        }
        *self.inner.remote.write_guard() = Some(ad.clone());
        {
            let mut state = self.inner.state.write_guard();
            if *state == ChannelState::Closed {
                return Err(Error::Closed);
            }
            *state = ChannelState::Ready;
        }
        self.inner
            .shared
            .dht
            .post(DhtEvent::HoldPeer {
                advertisement: ad.clone(),
            })
            .await?;
        debug!(conn = %self.inner.conn, peer = %ad.peer.short(), "handshake complete");
        Ok(ad)
    }

    /// Correlated request: send `tag`/`payload`, suspend until the matching
    /// reply or the request timeout. A timed-out request leaves no entry in
    /// the pending table.
    pub async fn request(&self, tag: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.round_trip(
            Envelope::Application {
                tag: tag.to_string(),
                id: Some(0),
                payload,
            },
            tag,
        )
        .await
    }

    /// Fire-and-forget send; no reply is expected or correlated.
    pub async fn publish(&self, tag: &str, payload: Vec<u8>) -> Result<()> {
        self.send_envelope(&Envelope::Application {
            tag: tag.to_string(),
            id: None,
            payload,
        })
        .await
    }

    pub(crate) async fn gossip(&self, bundle: Vec<u8>) -> Result<()> {
        self.send_envelope(&Envelope::Gossip { payload: bundle }).await
    }

    pub(crate) async fn reply(&self, id: u64, payload: Vec<u8>) -> Result<()> {
        self.send_envelope(&Envelope::Reply { id, payload }).await
    }

    /// Send an already-encoded frame over the underlying direct connection,
    /// unchanged. Relay forwarding path; refuses non-direct channels.
    pub(crate) async fn forward_frame(&self, frame: Vec<u8>) -> Result<()> {
        if self.state() == ChannelState::Closed {
            return Err(Error::Closed);
        }
        match &self.inner.sink {
            Sink::Direct { transport, conn } => transport.send(&[conn.clone()], frame).await,
            Sink::Relay { .. } => Err(Error::RelayTopology),
        }
    }

    /// Decode-once dispatch for every non-relay envelope. Relay envelopes
    /// carry routing decisions that need the node's indexes and are handled
    /// there.
    pub(crate) async fn handle_envelope(&self, envelope: Envelope) -> Result<()> {
        match envelope {
            Envelope::Reply { id, payload } => {
                if !self.inner.pending.resolve(id, payload) {
                    debug!(conn = %self.inner.conn, id, "reply for unknown or completed request");
                }
                Ok(())
            }
            Envelope::Handshake { id } => {
                let ad = messages::encode(&self.inner.shared.local_ad)?;
                self.reply(id, ad).await
            }
            Envelope::Gossip { payload } => match self.remote_peer() {
                Some(from) => {
                    self.inner
                        .shared
                        .dht
                        .post(DhtEvent::RemoteGossip {
                            from,
                            bundle: payload,
                        })
                        .await
                }
                None => {
                    warn!(conn = %self.inner.conn, "gossip before handshake, dropping");
                    Ok(())
                }
            },
            Envelope::Relay { .. } => Err(Error::Protocol(
                "relay envelope routed to channel dispatch".into(),
            )),
            Envelope::Application { tag, id, payload } => {
                let message = AppMessage {
                    from: self.remote_peer(),
                    tag,
                    payload,
                    responder: Responder {
                        channel: self.clone(),
                        id,
                    },
                };
                match self.inner.shared.app_tx.try_send(message) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(m)) => {
                        warn!(conn = %self.inner.conn, tag = %m.tag, "application queue full, dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(conn = %self.inner.conn, "no application consumer, dropping message");
                    }
                }
                Ok(())
            }
        }
    }

    /// Terminal: fail all in-flight requests and refuse further sends.
    pub(crate) fn close(&self) {
        {
            let mut state = self.inner.state.write_guard();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        self.inner.pending.drain(|| Error::Closed);
        debug!(conn = %self.inner.conn, "channel closed");
    }

    async fn round_trip(&self, mut envelope: Envelope, what: &str) -> Result<Vec<u8>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        match &mut envelope {
            Envelope::Handshake { id: slot } => *slot = id,
            Envelope::Application { id: slot, .. } => *slot = Some(id),
            _ => unreachable!("round_trip only carries request envelopes"),
        }
        let rx = self.inner.pending.track(id);
        if let Err(e) = self.send_envelope(&envelope).await {
            self.inner.pending.forget(id);
            return Err(e);
        }
        match timeout(self.inner.shared.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.inner.pending.forget(id);
                Err(Error::Timeout {
                    origin: format!("{what} on {}", self.inner.conn),
                })
            }
        }
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        if self.state() == ChannelState::Closed {
            return Err(Error::Closed);
        }
        let frame = messages::encode(envelope)?;
        self.inner.sink.send(frame).await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("conn", &self.inner.conn.to_string())
            .field("state", &self.state())
            .field("remote", &self.remote_peer())
            .finish()
    }
}
