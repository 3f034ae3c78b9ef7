//! Error types for weft.
//!
//! Every fallible operation in the crate returns [`Result`]. `Timeout` and
//! `NotFound` are recoverable at the call site; everything else indicates a
//! misuse, a protocol violation by the remote, or a collaborator failure.
//! Protocol violations are scoped to the offending channel; library code
//! never terminates the process.

use thiserror::Error;

/// Errors surfaced by nodes, channels and collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed envelope, missing URI parameter, or a reply sent for a
    /// message that carried no request id.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A dial or request deadline elapsed. `origin` names the operation and
    /// peer for diagnostics.
    #[error("timed out: {origin}")]
    Timeout { origin: String },

    /// URI scheme is neither the direct nor the relay scheme.
    #[error("unsupported uri scheme: {0}")]
    UnsupportedScheme(String),

    /// Attempted to chain relays: a relay hop must be a direct connection.
    #[error("cannot relay through a non-direct connection")]
    RelayTopology,

    /// No DHT record or no open channel for the peer.
    #[error("peer not found: {0}")]
    NotFound(String),

    /// Declared capability with no implementation (node-level publish).
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),

    /// The channel closed while a request was pending on it.
    #[error("channel closed")]
    Closed,

    /// Invalid node configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transport collaborator failure.
    #[error("transport: {0}")]
    Transport(String),

    /// DHT collaborator failure.
    #[error("dht: {0}")]
    Dht(String),

    /// Wire serialization failure.
    #[error("serialization: {0}")]
    Serialize(#[from] bincode::Error),
}

impl Error {
    /// Duplicate the error for fan-out to several waiters. `Serialize`
    /// carries a non-cloneable source and degrades to its message.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Error::Protocol(s) => Error::Protocol(s.clone()),
            Error::Timeout { origin } => Error::Timeout {
                origin: origin.clone(),
            },
            Error::UnsupportedScheme(s) => Error::UnsupportedScheme(s.clone()),
            Error::RelayTopology => Error::RelayTopology,
            Error::NotFound(s) => Error::NotFound(s.clone()),
            Error::Unimplemented(s) => Error::Unimplemented(*s),
            Error::Closed => Error::Closed,
            Error::Config(s) => Error::Config(s.clone()),
            Error::Transport(s) => Error::Transport(s.clone()),
            Error::Dht(s) => Error::Dht(s.clone()),
            Error::Serialize(e) => Error::Protocol(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
