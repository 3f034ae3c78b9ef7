//! # Transport Collaborator
//!
//! The raw byte transport is consumed through the narrow [`Transport`]
//! trait: bind listeners, dial direct URIs, send frames on established
//! connections, and surface lifecycle through a closed [`TransportEvent`]
//! enum. Framing bytes on the wire, reconnection policy and socket
//! internals all live behind this seam.
//!
//! [`MemoryTransport`] is the in-process backend: endpoints attached to the
//! same [`MemoryHub`] reach each other through paired event channels. It
//! backs the integration tests and local multi-node clusters without
//! touching the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sync::MutexExt;
use crate::uri::{parse_direct_addr, PeerUri};

/// Connection id as issued by the transport backend.
pub type TransportConnId = String;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle events emitted by a transport backend.
#[derive(Debug)]
pub enum TransportEvent {
    /// Listener bound; carries the bound address URIs.
    Bound { addrs: Vec<String> },
    /// Inbound connection established.
    Accepted { conn: TransportConnId },
    /// Outbound connection established.
    Dialed { conn: TransportConnId },
    /// One frame arrived on a connection.
    Message {
        conn: TransportConnId,
        frame: Vec<u8>,
    },
    /// Connection closed (either side).
    Closed { conn: TransportConnId },
    /// Backend failure not tied to one connection.
    Error { message: String },
    /// Failure on a single connection; the connection is unusable.
    ConnectionError {
        conn: TransportConnId,
        message: String,
    },
}

/// Contract a transport backend must satisfy.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bind a listener for `addr` (`wss://host:port`).
    async fn bind(&self, addr: &str) -> Result<()>;

    /// Dial a direct peer URI. Completion is reported via
    /// [`TransportEvent::Dialed`], not by this call returning.
    async fn dial(&self, uri: &str) -> Result<()>;

    /// Send one frame over each of the given connections.
    async fn send(&self, conns: &[TransportConnId], frame: Vec<u8>) -> Result<()>;

    /// Take the event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// Shared registry connecting [`MemoryTransport`] endpoints in-process.
pub struct MemoryHub {
    listeners: Mutex<HashMap<String, Weak<MemoryTransport>>>,
    next_conn: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(0),
        })
    }

    /// Create a transport endpoint attached to this hub.
    pub fn endpoint(self: &Arc<Self>) -> Arc<MemoryTransport> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|this| MemoryTransport {
            hub: Arc::clone(self),
            this: this.clone(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            conns: Mutex::new(HashMap::new()),
        })
    }

    fn fresh_conn_pair(&self) -> (TransportConnId, TransportConnId) {
        let n = self.next_conn.fetch_add(2, Ordering::Relaxed);
        (format!("mem-{n}"), format!("mem-{}", n + 1))
    }
}

struct RemoteEnd {
    /// The connection id under which the remote endpoint knows this link.
    conn: TransportConnId,
    endpoint: Weak<MemoryTransport>,
}

/// In-process transport backend. See module docs.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    this: Weak<MemoryTransport>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    conns: Mutex<HashMap<TransportConnId, RemoteEnd>>,
}

impl MemoryTransport {
    /// Close one connection, notifying both endpoints.
    pub async fn close(&self, conn: &str) {
        let remote = self.conns.guard().remove(conn);
        if remote.is_none() {
            return;
        }
        let _ = self
            .events_tx
            .send(TransportEvent::Closed {
                conn: conn.to_string(),
            })
            .await;
        if let Some(remote) = remote {
            if let Some(endpoint) = remote.endpoint.upgrade() {
                endpoint
                    .conns
                    .guard()
                    .remove(&remote.conn);
                let _ = endpoint
                    .events_tx
                    .send(TransportEvent::Closed { conn: remote.conn })
                    .await;
            }
        }
    }

    /// Close every connection on this endpoint.
    pub async fn shutdown(&self) {
        let conns: Vec<TransportConnId> = {
            let conns = self.conns.guard();
            conns.keys().cloned().collect()
        };
        for conn in conns {
            self.close(&conn).await;
        }
    }

    /// Connection ids currently open on this endpoint. Test hook.
    pub fn open_conns(&self) -> Vec<TransportConnId> {
        self.conns
            .guard()
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind(&self, addr: &str) -> Result<()> {
        let (host, port) = parse_direct_addr(addr)?;
        let key = format!("{host}:{port}");
        {
            let mut listeners = self.hub.listeners.guard();
            if listeners.get(&key).and_then(Weak::upgrade).is_some() {
                return Err(Error::Transport(format!("address in use: {key}")));
            }
            listeners.insert(key.clone(), self.this.clone());
        }
        debug!(addr = %key, "memory transport bound");
        let _ = self
            .events_tx
            .send(TransportEvent::Bound {
                addrs: vec![addr.to_string()],
            })
            .await;
        Ok(())
    }

    async fn dial(&self, uri: &str) -> Result<()> {
        let parsed = PeerUri::parse(uri)?;
        let key = parsed
            .host_port()
            .ok_or_else(|| Error::Transport("memory transport dials direct uris only".into()))?;

        let listener = {
            let listeners = self.hub.listeners.guard();
            listeners.get(&key).and_then(Weak::upgrade)
        };
        let listener = listener.ok_or_else(|| Error::Transport(format!("no listener at {key}")))?;

        let (local_conn, remote_conn) = self.hub.fresh_conn_pair();

        self.conns.guard().insert(
            local_conn.clone(),
            RemoteEnd {
                conn: remote_conn.clone(),
                endpoint: Arc::downgrade(&listener),
            },
        );
        listener.conns.guard().insert(
            remote_conn.clone(),
            RemoteEnd {
                conn: local_conn.clone(),
                endpoint: self.this.clone(),
            },
        );

        debug!(local = %local_conn, remote = %remote_conn, at = %key, "memory dial");

        let _ = self
            .events_tx
            .send(TransportEvent::Dialed { conn: local_conn })
            .await;
        let _ = listener
            .events_tx
            .send(TransportEvent::Accepted { conn: remote_conn })
            .await;
        Ok(())
    }

    async fn send(&self, conns: &[TransportConnId], frame: Vec<u8>) -> Result<()> {
        for conn in conns {
            let remote = {
                let map = self.conns.guard();
                map.get(conn)
                    .map(|r| (r.conn.clone(), r.endpoint.clone()))
            };
            let (remote_conn, endpoint) =
                remote.ok_or_else(|| Error::Transport(format!("unknown connection {conn}")))?;
            let endpoint = endpoint
                .upgrade()
                .ok_or_else(|| Error::Transport(format!("remote endpoint gone for {conn}")))?;
            // Frame delivery must not park this endpoint on a peer that is
            // not draining its queue.
            match endpoint.events_tx.try_send(TransportEvent::Message {
                conn: remote_conn,
                frame: frame.clone(),
            }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn = %conn, "remote event queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(Error::Transport("remote event queue closed".into()));
                }
            }
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.guard().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_dial_and_deliver() {
        let hub = MemoryHub::new();
        let a = hub.endpoint();
        let b = hub.endpoint();
        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();

        b.bind("wss://127.0.0.1:7001").await.unwrap();
        assert!(matches!(
            b_events.recv().await,
            Some(TransportEvent::Bound { .. })
        ));

        let peer = crate::identity::Keypair::from_secret_key_bytes(&[9u8; 32]).identity();
        a.dial(&format!("wss://127.0.0.1:7001?a={peer}"))
            .await
            .unwrap();

        let a_conn = match a_events.recv().await {
            Some(TransportEvent::Dialed { conn }) => conn,
            other => panic!("expected Dialed, got {other:?}"),
        };
        let b_conn = match b_events.recv().await {
            Some(TransportEvent::Accepted { conn }) => conn,
            other => panic!("expected Accepted, got {other:?}"),
        };

        a.send(&[a_conn.clone()], b"hello".to_vec()).await.unwrap();
        match b_events.recv().await {
            Some(TransportEvent::Message { conn, frame }) => {
                assert_eq!(conn, b_conn);
                assert_eq!(frame, b"hello");
            }
            other => panic!("expected Message, got {other:?}"),
        }

        // Close propagates to both sides.
        a.close(&a_conn).await;
        assert!(matches!(
            a_events.recv().await,
            Some(TransportEvent::Closed { .. })
        ));
        assert!(matches!(
            b_events.recv().await,
            Some(TransportEvent::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn full_remote_queue_drops_frames_instead_of_blocking() {
        let hub = MemoryHub::new();
        let a = hub.endpoint();
        let b = hub.endpoint();
        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();

        b.bind("wss://127.0.0.1:7003").await.unwrap();
        let peer = crate::identity::Keypair::from_secret_key_bytes(&[9u8; 32]).identity();
        a.dial(&format!("wss://127.0.0.1:7003?a={peer}"))
            .await
            .unwrap();
        let a_conn = match a_events.recv().await {
            Some(TransportEvent::Dialed { conn }) => conn,
            other => panic!("expected Dialed, got {other:?}"),
        };

        // Nothing drains b's queue; flooding past its capacity must neither
        // stall the sender nor error.
        for _ in 0..EVENT_CHANNEL_CAPACITY + 50 {
            a.send(&[a_conn.clone()], b"flood".to_vec()).await.unwrap();
        }

        // Bound and Accepted occupy two slots, frames fill the rest, and
        // the overflow was dropped.
        let mut delivered = 0;
        while let Ok(event) = b_events.try_recv() {
            if matches!(event, TransportEvent::Message { .. }) {
                delivered += 1;
            }
        }
        assert_eq!(delivered, EVENT_CHANNEL_CAPACITY - 2);
    }

    #[tokio::test]
    async fn dial_without_listener_fails() {
        let hub = MemoryHub::new();
        let a = hub.endpoint();
        let peer = crate::identity::Keypair::from_secret_key_bytes(&[9u8; 32]).identity();
        let err = a
            .dial(&format!("wss://127.0.0.1:7999?a={peer}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn double_bind_is_rejected() {
        let hub = MemoryHub::new();
        let a = hub.endpoint();
        let b = hub.endpoint();
        a.bind("wss://127.0.0.1:7002").await.unwrap();
        assert!(b.bind("wss://127.0.0.1:7002").await.is_err());
    }
}
