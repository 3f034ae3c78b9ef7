mod channel;
mod dht;
mod error;
mod identity;
mod messages;
mod node;
mod sync;
mod tracker;
mod transport;
mod uri;

pub use channel::{AppMessage, Channel, ChannelState, ConnId, Responder};
pub use dht::{Dht, DhtEvent, MemoryDht, MemoryDhtStore};
pub use error::{Error, Result};
pub use identity::{Identity, Keypair};
pub use messages::{Advertisement, Envelope, MAX_PAYLOAD_SIZE};
pub use node::{Node, NodeConfig, TelemetrySnapshot, DEFAULT_TIMEOUT};
pub use transport::{MemoryHub, MemoryTransport, Transport, TransportConnId, TransportEvent};
pub use uri::{parse_direct_addr, PeerUri, DIRECT_SCHEME, RELAY_SCHEME};
