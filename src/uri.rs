//! # Peer Transport URIs
//!
//! Two URI schemes name a peer and how to reach it:
//!
//! - direct:  `wss://<host>:<port>?a=<identity-hex>`
//! - relay:   `relay://<relay-identity-hex>?a=<identity-hex>`
//!
//! The `a` parameter carries the target peer's identity and is mandatory:
//! a channel cannot be established without knowing who is on the other end.
//! Exactly one relay hop is representable; a relay URI names the relay peer
//! by identity, never by another relay URI, so nested relaying is
//! unrepresentable by construction.

use url::Url;

use crate::error::{Error, Result};
use crate::identity::Identity;

pub const DIRECT_SCHEME: &str = "wss";
pub const RELAY_SCHEME: &str = "relay";

/// Parsed peer transport URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerUri {
    Direct {
        host: String,
        port: u16,
        peer: Identity,
    },
    Relay {
        relay: Identity,
        peer: Identity,
    },
}

impl PeerUri {
    pub fn direct(host: impl Into<String>, port: u16, peer: Identity) -> Self {
        Self::Direct {
            host: host.into(),
            port,
            peer,
        }
    }

    pub fn relay(relay: Identity, peer: Identity) -> Self {
        Self::Relay { relay, peer }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| Error::Protocol(format!("invalid peer uri {input:?}: {e}")))?;

        let peer = peer_param(&url)?;

        match url.scheme() {
            DIRECT_SCHEME => {
                let (host, port) = direct_endpoint(&url)?;
                Ok(Self::Direct { host, port, peer })
            }
            RELAY_SCHEME => {
                let host = url
                    .host_str()
                    .ok_or_else(|| Error::Protocol(format!("relay uri {input:?} has no host")))?;
                let relay = Identity::from_hex(host).map_err(|_| {
                    Error::Protocol(format!("relay uri host is not an identity: {host:?}"))
                })?;
                Ok(Self::Relay { relay, peer })
            }
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }

    /// Attach a peer identity to an advertised transport URI (which carries
    /// no `a` parameter of its own). This is how DHT advertisements are
    /// turned back into dialable URIs.
    pub fn from_advertised(uri: &str, peer: Identity) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| Error::Protocol(format!("invalid advertised uri {uri:?}: {e}")))?;
        match url.scheme() {
            DIRECT_SCHEME => {
                let (host, port) = direct_endpoint(&url)?;
                Ok(Self::Direct { host, port, peer })
            }
            RELAY_SCHEME => {
                let host = url
                    .host_str()
                    .ok_or_else(|| Error::Protocol(format!("relay uri {uri:?} has no host")))?;
                let relay = Identity::from_hex(host).map_err(|_| {
                    Error::Protocol(format!("relay uri host is not an identity: {host:?}"))
                })?;
                Ok(Self::Relay { relay, peer })
            }
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }

    /// The identity of the peer this URI ultimately addresses.
    pub fn peer(&self) -> Identity {
        match self {
            Self::Direct { peer, .. } | Self::Relay { peer, .. } => *peer,
        }
    }

    /// `host:port` of a direct URI, the key a transport listens under.
    pub fn host_port(&self) -> Option<String> {
        match self {
            Self::Direct { host, port, .. } => Some(format!("{host}:{port}")),
            Self::Relay { .. } => None,
        }
    }
}

impl std::fmt::Display for PeerUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct { host, port, peer } => {
                write!(f, "{DIRECT_SCHEME}://{host}:{port}?a={peer}")
            }
            Self::Relay { relay, peer } => write!(f, "{RELAY_SCHEME}://{relay}?a={peer}"),
        }
    }
}

/// Parse a bare direct transport address (`wss://host:port`, no `a` param),
/// as configured for binding and advertising.
pub fn parse_direct_addr(uri: &str) -> Result<(String, u16)> {
    let url =
        Url::parse(uri).map_err(|e| Error::Protocol(format!("invalid address {uri:?}: {e}")))?;
    if url.scheme() != DIRECT_SCHEME {
        return Err(Error::UnsupportedScheme(url.scheme().to_string()));
    }
    direct_endpoint(&url)
}

fn direct_endpoint(url: &Url) -> Result<(String, u16)> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Protocol(format!("uri {url} has no host")))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Protocol(format!("uri {url} has no port")))?;
    Ok((host, port))
}

fn peer_param(url: &Url) -> Result<Identity> {
    let value = url
        .query_pairs()
        .find(|(k, _)| k == "a")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| {
            Error::Protocol(format!("cannot connect to peer without an \"a\" param: {url}"))
        })?;
    Identity::from_hex(&value)
        .map_err(|_| Error::Protocol(format!("\"a\" param is not an identity: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn some_identity() -> Identity {
        Keypair::from_secret_key_bytes(&[1u8; 32]).identity()
    }

    #[test]
    fn direct_uri_round_trip() {
        let peer = some_identity();
        let uri = PeerUri::direct("127.0.0.1", 9000, peer);
        let parsed = PeerUri::parse(&uri.to_string()).unwrap();
        assert_eq!(parsed, uri);
        assert_eq!(parsed.peer(), peer);
        assert_eq!(parsed.host_port().as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn relay_uri_round_trip() {
        let relay = some_identity();
        let peer = Keypair::from_secret_key_bytes(&[2u8; 32]).identity();
        let uri = PeerUri::relay(relay, peer);
        let parsed = PeerUri::parse(&uri.to_string()).unwrap();
        assert_eq!(parsed, uri);
        assert!(parsed.host_port().is_none());
    }

    #[test]
    fn missing_peer_param_is_a_protocol_error() {
        let err = PeerUri::parse("wss://127.0.0.1:9000").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let peer = some_identity();
        let err = PeerUri::parse(&format!("ftp://127.0.0.1:9000?a={peer}")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(s) if s == "ftp"));
    }

    #[test]
    fn advertised_uri_gains_peer_param() {
        let peer = some_identity();
        let uri = PeerUri::from_advertised("wss://10.0.0.1:4040", peer).unwrap();
        assert_eq!(uri, PeerUri::direct("10.0.0.1", 4040, peer));
    }

    #[test]
    fn parse_direct_addr_requires_direct_scheme() {
        assert_eq!(
            parse_direct_addr("wss://0.0.0.0:8080").unwrap(),
            ("0.0.0.0".to_string(), 8080)
        );
        assert!(parse_direct_addr("relay://abcd").is_err());
    }
}
