//! # DHT Collaborator
//!
//! Peer advertisements are resolved and propagated through the narrow
//! [`Dht`] trait. The backend's storage layout, replication and gossip
//! algorithm are its own business; the node only fetches records, posts
//! events, and reacts to the backend's event stream.
//!
//! [`MemoryDht`] is the in-process backend: every backend attached to the
//! same [`MemoryDhtStore`] shares one record table, which stands in for a
//! converged network in tests and local clusters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::identity::Identity;
use crate::messages::Advertisement;
use crate::sync::MutexExt;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events crossing the node/DHT boundary, in both directions.
#[derive(Clone, Debug)]
pub enum DhtEvent {
    /// Backend asks the node to fan a gossip bundle out to `peers`.
    GossipTo { peers: Vec<Identity>, bundle: Vec<u8> },
    /// Advertisement to hold. Emitted by the backend for vetting and posted
    /// back by the node (unverified; record validation is out of scope);
    /// also posted directly for self and handshake-learned advertisements.
    HoldPeer { advertisement: Advertisement },
    /// Gossip bundle received from a remote peer over a channel, handed to
    /// the backend tagged with the sender.
    RemoteGossip { from: Identity, bundle: Vec<u8> },
}

/// Contract a DHT backend must satisfy.
#[async_trait]
pub trait Dht: Send + Sync + 'static {
    /// Look up a peer's advertisement. `Ok(None)` means no record held.
    async fn fetch_peer(&self, peer: &Identity) -> Result<Option<Advertisement>>;

    /// Feed an event into the backend.
    async fn post(&self, event: DhtEvent) -> Result<()>;

    /// Take the backend's event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<DhtEvent>>;
}

/// Record table shared by the [`MemoryDht`] backends of one cluster.
pub struct MemoryDhtStore {
    records: Mutex<HashMap<Identity, Advertisement>>,
}

impl MemoryDhtStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Create a backend attached to this store.
    pub fn backend(self: &Arc<Self>) -> Arc<MemoryDht> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(MemoryDht {
            store: Arc::clone(self),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            remote_gossip: Mutex::new(Vec::new()),
        })
    }

    fn hold(&self, ad: Advertisement) {
        let mut records = self.records.guard();
        match records.get(&ad.peer) {
            // Newer records supersede; an advertisement is never mutated.
            Some(existing) if existing.timestamp_ms > ad.timestamp_ms => {}
            _ => {
                records.insert(ad.peer, ad);
            }
        }
    }

    fn fetch(&self, peer: &Identity) -> Option<Advertisement> {
        self.records.guard().get(peer).cloned()
    }
}

/// In-process DHT backend. See module docs.
pub struct MemoryDht {
    store: Arc<MemoryDhtStore>,
    events_tx: mpsc::Sender<DhtEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DhtEvent>>>,
    remote_gossip: Mutex<Vec<(Identity, Vec<u8>)>>,
}

impl MemoryDht {
    /// Ask the owning node to fan a bundle out. Test hook standing in for
    /// the backend's own gossip scheduling.
    pub async fn gossip_to(&self, peers: Vec<Identity>, bundle: Vec<u8>) {
        let _ = self
            .events_tx
            .send(DhtEvent::GossipTo { peers, bundle })
            .await;
    }

    /// Ask the owning node to vet and re-post an advertisement. Test hook
    /// standing in for hold requests arriving from the network.
    pub async fn request_hold(&self, advertisement: Advertisement) {
        let _ = self
            .events_tx
            .send(DhtEvent::HoldPeer { advertisement })
            .await;
    }

    /// Gossip bundles this backend received from remote peers. Test hook.
    pub fn remote_gossip_log(&self) -> Vec<(Identity, Vec<u8>)> {
        self.remote_gossip.guard().clone()
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn fetch_peer(&self, peer: &Identity) -> Result<Option<Advertisement>> {
        Ok(self.store.fetch(peer))
    }

    async fn post(&self, event: DhtEvent) -> Result<()> {
        match event {
            DhtEvent::HoldPeer { advertisement } => {
                debug!(peer = %advertisement.peer.short(), uri = %advertisement.uri, "holding advertisement");
                self.store.hold(advertisement);
            }
            DhtEvent::RemoteGossip { from, bundle } => {
                self.remote_gossip
                    .guard()
                    .push((from, bundle));
            }
            // Posting a fan-out request loops it back through the node.
            DhtEvent::GossipTo { peers, bundle } => {
                let _ = self
                    .events_tx
                    .send(DhtEvent::GossipTo { peers, bundle })
                    .await;
            }
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<DhtEvent>> {
        self.events_rx.guard().take()
    }
}
