//! # Wire Protocol Messages
//!
//! Every transport-level frame exchanged between two channels is one
//! bincode-encoded [`Envelope`]. The envelope is a closed union decoded once
//! at the channel boundary; dispatch is an exhaustive match, so an unknown
//! variant is a deserialization error rather than a stringly-typed fallthrough.
//!
//! Deserialization is bounded to prevent memory exhaustion from hostile
//! length prefixes.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Result;
use crate::identity::Identity;

/// Maximum payload carried by a single envelope (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization; slightly larger than
/// `MAX_PAYLOAD_SIZE` to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode_options().serialize(value)?)
}

/// Decode with size bounds enforced. Always use this for remote input.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode_options().deserialize(bytes)?)
}

/// One frame on a channel.
///
/// `Reply` correlates to the request id of an earlier `Handshake` or
/// `Application` frame. `Relay` is the single-hop forwarding wrapper: the
/// relay peer unwraps it and re-delivers `payload` (itself a complete
/// envelope) to `to`'s direct channel; `from` lets the destination route
/// replies back through the same hop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Envelope {
    /// Reply to a pending request.
    Reply { id: u64, payload: Vec<u8> },
    /// Handshake request; the reply payload is the sender's [`Advertisement`].
    Handshake { id: u64 },
    /// Opaque gossip bundle for the DHT collaborator.
    Gossip { payload: Vec<u8> },
    /// Single-hop forwarding wrapper.
    Relay {
        to: Identity,
        from: Identity,
        payload: Vec<u8>,
    },
    /// Application message. `id: None` is fire-and-forget; `Some` expects a
    /// correlated `Reply`.
    Application {
        tag: String,
        id: Option<u64>,
        payload: Vec<u8>,
    },
}

impl Envelope {
    /// Variant name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Reply { .. } => "reply",
            Envelope::Handshake { .. } => "handshake",
            Envelope::Gossip { .. } => "gossip",
            Envelope::Relay { .. } => "relay",
            Envelope::Application { .. } => "application",
        }
    }
}

/// A peer's reachability record.
///
/// Produced locally for self at startup, received from peers during
/// handshake, and propagated through the DHT collaborator. Immutable once
/// constructed; a newer advertisement supersedes an older one, keyed by
/// `timestamp_ms`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub peer: Identity,
    /// Transport URI without the `a` parameter (`wss://host:port` or
    /// `relay://<relay-hex>`).
    pub uri: String,
    /// Opaque application data carried alongside the record.
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
}

impl Advertisement {
    pub fn new(peer: Identity, uri: String, data: Vec<u8>) -> Self {
        Self {
            peer,
            uri,
            data,
            timestamp_ms: now_ms(),
        }
    }

    /// Dialable form: transport URI plus the peer's `a` parameter.
    pub fn dial_uri(&self) -> String {
        format!("{}?a={}", self.uri, self.peer)
    }
}

/// Milliseconds since the Unix epoch, for advertisement freshness.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
