//! Integration tests for single-hop relay routing.
//!
//! Topology under test: C (direct) -> R (relay) -> D (relay-advertised).
//! D routes all inbound traffic through R and advertises `relay://<R>`; C
//! resolves that record, wraps its frames for R to forward, and replies flow
//! back through the same hop on a reflected virtual channel.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test relay_routing -- --nocapture

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::time::{timeout, Instant};
use weft::{
    Advertisement, Dht, DhtEvent, Error, Keypair, MemoryDht, MemoryDhtStore, MemoryHub,
    MemoryTransport, Node, NodeConfig, RELAY_SCHEME,
};

/// One-time tracing initialization. Use RUST_LOG=debug for verbose output.
static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Atomic port counter for unique addresses within a test.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(40000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_addr() -> String {
    format!("wss://127.0.0.1:{}", next_port())
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Cluster {
    hub: Arc<MemoryHub>,
    store: Arc<MemoryDhtStore>,
}

impl Cluster {
    fn new() -> Self {
        init_tracing();
        Self {
            hub: MemoryHub::new(),
            store: MemoryDhtStore::new(),
        }
    }

    fn transport(&self) -> Arc<MemoryTransport> {
        self.hub.endpoint()
    }

    fn dht(&self) -> Arc<MemoryDht> {
        self.store.backend()
    }

    async fn direct_node(&self) -> Node {
        let config = NodeConfig {
            bind: vec![test_addr()],
            ..NodeConfig::default()
        };
        Node::new(config, self.transport(), self.dht())
            .await
            .expect("node start failed")
    }

    /// Node that routes all inbound traffic through `relay_uri`.
    async fn relayed_node(&self, relay_uri: &str) -> Node {
        let config = NodeConfig {
            relay_peers: vec![relay_uri.to_string()],
            ..NodeConfig::default()
        };
        Node::new(config, self.transport(), self.dht())
            .await
            .expect("relayed node start failed")
    }
}

fn spawn_echo(node: &Node) {
    let mut rx = node.take_messages().expect("messages already taken");
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let _ = msg.responder.respond(msg.payload).await;
        }
    });
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while !check() {
        if start.elapsed() > TEST_TIMEOUT {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Relay node, then the destination node routing through it. Waits until
/// the relay has indexed the destination, which forwarding depends on.
async fn relay_pair(cluster: &Cluster) -> (Node, Node) {
    let r = cluster.direct_node().await;
    let d = cluster.relayed_node(&r.advertise_uri()).await;
    wait_until("relay to index the destination", || r.telemetry().peers == 1).await;
    (r, d)
}

// ============================================================================
// Advertising
// ============================================================================

#[tokio::test]
async fn relayed_node_advertises_the_relay() {
    let cluster = Cluster::new();
    let (r, d) = relay_pair(&cluster).await;

    let advertise = d.advertise_uri();
    assert_eq!(
        advertise,
        format!("{RELAY_SCHEME}://{}?a={}", r.identity(), d.identity())
    );
}

#[tokio::test]
async fn relayed_node_needs_no_listener() {
    let cluster = Cluster::new();
    let (_r, d) = relay_pair(&cluster).await;
    assert!(d.bindings().is_empty(), "relay mode binds nothing");
    // The relay channel itself is the node's single connection.
    assert_eq!(d.telemetry().connections, 1);
}

#[tokio::test]
async fn relay_peer_must_be_direct() {
    let cluster = Cluster::new();
    let (_r, d) = relay_pair(&cluster).await;

    // Chaining relays is rejected at configuration time.
    let config = NodeConfig {
        relay_peers: vec![d.advertise_uri()],
        ..NodeConfig::default()
    };
    let err = Node::new(config, cluster.transport(), cluster.dht())
        .await
        .expect_err("relay-of-relay must be rejected");
    assert!(matches!(err, Error::Config(_)), "got {err:?}");
}

// ============================================================================
// End-to-End Routing
// ============================================================================

#[tokio::test]
async fn request_round_trip_through_relay() {
    let cluster = Cluster::new();
    let (r, d) = relay_pair(&cluster).await;
    spawn_echo(&d);
    let c = cluster.direct_node().await;

    // C resolves D's relay advertisement from the DHT, connects to R, and
    // tunnels the request; the echoed reply rides the same hop back.
    let reply = timeout(
        TEST_TIMEOUT,
        c.request(&d.identity(), "ping", b"through the relay".to_vec()),
    )
    .await
    .expect("request timed out")
    .expect("relayed request failed");
    assert_eq!(reply, b"through the relay");

    let telemetry = c.telemetry();
    assert_eq!(telemetry.connections, 2, "direct to R plus virtual to D");
    assert_eq!(telemetry.peers, 2);

    // R only forwarded; it never grew a channel to a peer named in the
    // wrapped frames beyond its two direct neighbours.
    assert_eq!(r.telemetry().connections, 2);
}

#[tokio::test]
async fn concurrent_relay_connects_share_one_channel() {
    let cluster = Cluster::new();
    let (_r, d) = relay_pair(&cluster).await;
    let c = cluster.direct_node().await;

    // All callers join the same dial attempt; none of them may be failed
    // by another caller racing the virtual channel's handshake.
    let uri = d.advertise_uri();
    let (first, second, third) = tokio::join!(c.connect(&uri), c.connect(&uri), c.connect(&uri));
    first.expect("first connect failed");
    second.expect("second connect failed");
    third.expect("third connect failed");

    let telemetry = c.telemetry();
    assert_eq!(telemetry.connections, 2, "direct to R plus one virtual to D");
    assert_eq!(telemetry.waiters, 0);
}

#[tokio::test]
async fn relayed_message_carries_sender_identity() {
    let cluster = Cluster::new();
    let (_r, d) = relay_pair(&cluster).await;
    let c = cluster.direct_node().await;
    let mut d_rx = d.take_messages().expect("messages already taken");

    let responder = tokio::spawn(async move {
        let mut froms = Vec::new();
        for _ in 0..2 {
            let msg = d_rx.recv().await.expect("message stream closed");
            froms.push(msg.from);
            msg.responder.respond(msg.payload).await.expect("respond failed");
        }
        froms
    });

    // First round trip creates D's reflected channel and starts its
    // handshake back toward C; once that lands the sender is known.
    c.request(&d.identity(), "first", vec![1])
        .await
        .expect("first request failed");
    wait_until("d to handshake back to c", || d.telemetry().peers == 2).await;
    c.request(&d.identity(), "second", vec![2])
        .await
        .expect("second request failed");

    let froms = responder.await.unwrap();
    assert_eq!(froms[1], Some(c.identity()), "second message is attributed");
}

#[tokio::test]
async fn relayed_destination_can_request_back() {
    let cluster = Cluster::new();
    let (_r, d) = relay_pair(&cluster).await;
    let c = cluster.direct_node().await;
    spawn_echo(&c);
    spawn_echo(&d);

    // Establish the hop from C's side first.
    c.request(&d.identity(), "warmup", vec![])
        .await
        .expect("warmup failed");
    wait_until("d to handshake back to c", || d.telemetry().peers == 2).await;

    // D now reuses the reflected virtual channel to reach C.
    let reply = timeout(
        TEST_TIMEOUT,
        d.request(&c.identity(), "back", b"hello c".to_vec()),
    )
    .await
    .expect("request timed out")
    .expect("reverse request failed");
    assert_eq!(reply, b"hello c");
}

// ============================================================================
// Failure Modes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn relay_without_connection_to_target_drops() {
    let cluster = Cluster::new();
    let (r, _d) = relay_pair(&cluster).await;
    let c = cluster.direct_node().await;

    // A record claiming some peer is reachable through R, but R has no
    // channel to it. R drops the forwarded frames and the handshake that C
    // starts toward the phantom peer can only time out.
    let phantom = Keypair::from_secret_key_bytes(&[77u8; 32]).identity();
    let record = Advertisement::new(phantom, format!("{RELAY_SCHEME}://{}", r.identity()), vec![]);
    cluster
        .dht()
        .post(DhtEvent::HoldPeer {
            advertisement: record,
        })
        .await
        .expect("hold failed");

    let err = c
        .request(&phantom, "void", vec![])
        .await
        .expect_err("phantom peer cannot answer");
    assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn relay_hop_must_be_a_direct_channel() {
    let cluster = Cluster::new();
    let (_r, d) = relay_pair(&cluster).await;
    let c = cluster.direct_node().await;

    // D is only reachable through R, so using D itself as a relay hop
    // would require two hops.
    let behind = Keypair::from_secret_key_bytes(&[88u8; 32]).identity();
    let err = c
        .connect(&format!("{RELAY_SCHEME}://{}?a={behind}", d.identity()))
        .await
        .expect_err("two-hop relay must be rejected");
    assert!(matches!(err, Error::RelayTopology), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn failed_relay_bootstrap_stops_the_event_loop() {
    let cluster = Cluster::new();
    let transport = cluster.transport();

    // No listener at the relay address: startup fails at the bootstrap
    // connect.
    let relay = Keypair::from_secret_key_bytes(&[66u8; 32]).identity();
    let config = NodeConfig {
        relay_peers: vec![format!("wss://127.0.0.1:{}?a={relay}", next_port())],
        ..NodeConfig::default()
    };
    let err = Node::new(config, transport.clone(), cluster.dht())
        .await
        .expect_err("bootstrap connect must fail");
    assert!(matches!(err, Error::Transport(_)), "got {err:?}");

    // Startup tasks unwind and release the transport endpoint instead of
    // pinning it from a detached event loop.
    wait_until("startup tasks to unwind", || {
        Arc::strong_count(&transport) == 1
    })
    .await;
}

#[tokio::test]
async fn losing_the_relay_drops_the_virtual_channel() {
    let cluster = Cluster::new();
    let r_transport = cluster.transport();
    let r = Node::new(
        NodeConfig {
            bind: vec![test_addr()],
            ..NodeConfig::default()
        },
        r_transport.clone(),
        cluster.dht(),
    )
    .await
    .expect("relay start failed");
    let d = cluster.relayed_node(&r.advertise_uri()).await;
    wait_until("relay to index the destination", || r.telemetry().peers == 1).await;
    spawn_echo(&d);

    let c = cluster.direct_node().await;
    c.request(&d.identity(), "warmup", vec![])
        .await
        .expect("warmup failed");
    assert_eq!(c.telemetry().connections, 2);

    // Cut every link through the relay. The virtual channels die with the
    // direct channels that carried them.
    r_transport.shutdown().await;
    wait_until("c to tear down both channels", || {
        c.telemetry().connections == 0
    })
    .await;
    wait_until("d to tear down its relay channel", || {
        d.telemetry().connections == 0
    })
    .await;
}
