use std::fmt;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use crate::error::CoreError;

// ── PeerRecord ───────────────────────────────────────────────────────────────

/// A remote node and the addresses it may be reachable on.
///
/// Records come from discovery queries or from an operator-supplied peer
/// string. They are never authoritative: a dial may fail, and a later query
/// may return a fresher record for the same peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, addresses: Vec<Multiaddr>) -> Self {
        Self { peer_id, addresses }
    }

    /// A record with no candidate addresses.
    pub fn bare(peer_id: PeerId) -> Self {
        Self { peer_id, addresses: Vec::new() }
    }

    /// Parse an operator peer string of the form `<multiaddr>/p2p/<peer-id>`.
    ///
    /// A bare `/p2p/<peer-id>` is accepted and yields a record without
    /// addresses.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let mut addr: Multiaddr =
            input.trim().parse().map_err(|e: libp2p::multiaddr::Error| {
                CoreError::InvalidPeerAddress {
                    input: input.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let Some(Protocol::P2p(peer_id)) = addr.pop() else {
            return Err(CoreError::MissingPeerId(input.to_string()));
        };

        let addresses = if addr.is_empty() { Vec::new() } else { vec![addr] };
        Ok(Self { peer_id, addresses })
    }

    pub fn has_addresses(&self) -> bool {
        !self.addresses.is_empty()
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.peer_id)?;
        for (i, addr) in self.addresses.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{addr}")?;
        }
        write!(f, "]")
    }
}

// ── Connectedness ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    NotConnected,
}

impl Connectedness {
    pub fn is_connected(self) -> bool {
        matches!(self, Connectedness::Connected)
    }
}

impl From<bool> for Connectedness {
    fn from(connected: bool) -> Self {
        if connected {
            Connectedness::Connected
        } else {
            Connectedness::NotConnected
        }
    }
}

// ── TopicMessage ─────────────────────────────────────────────────────────────

/// A message received on a pubsub topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic: String,
    /// Original author, present when the message was signed.
    pub source: Option<PeerId>,
    /// Peer that forwarded the message to us.
    pub received_from: PeerId,
    pub data: Vec<u8>,
}

impl TopicMessage {
    /// The author if known, otherwise the forwarding peer.
    pub fn sender(&self) -> PeerId {
        self.source.unwrap_or(self.received_from)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

// ── Listen addresses ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    Ip4,
    Ip6,
    Dns,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Quic,
    Other,
}

/// One address the local node listens on, classified for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenAddress {
    pub addr: Multiaddr,
    pub family: AddressFamily,
    pub transport: TransportKind,
    pub port: Option<u16>,
}

impl ListenAddress {
    pub fn classify(addr: Multiaddr) -> Self {
        let mut family = AddressFamily::Other;
        let mut transport = TransportKind::Other;
        let mut port = None;

        for proto in addr.iter() {
            match proto {
                Protocol::Ip4(_) => family = AddressFamily::Ip4,
                Protocol::Ip6(_) => family = AddressFamily::Ip6,
                Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_) => {
                    family = AddressFamily::Dns
                }
                Protocol::Tcp(p) => {
                    transport = TransportKind::Tcp;
                    port = Some(p);
                }
                Protocol::Udp(p) => port = Some(p),
                Protocol::Quic | Protocol::QuicV1 => transport = TransportKind::Quic,
                _ => {}
            }
        }

        Self { addr, family, transport, port }
    }
}

/// The set of addresses the network handle is reachable on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenDescriptor {
    pub addresses: Vec<ListenAddress>,
}

impl ListenDescriptor {
    pub fn new(addrs: impl IntoIterator<Item = Multiaddr>) -> Self {
        Self {
            addresses: addrs.into_iter().map(ListenAddress::classify).collect(),
        }
    }

    /// Full dialable strings (`<addr>/p2p/<peer-id>`) for every IPv4 address.
    pub fn dial_hints(&self, peer_id: &PeerId) -> Vec<String> {
        self.addresses
            .iter()
            .filter(|a| a.family == AddressFamily::Ip4)
            .map(|a| format!("{}/p2p/{}", a.addr, peer_id))
            .collect()
    }
}

// ── Capabilities ─────────────────────────────────────────────────────────────

/// NAT-related capabilities enabled on the network handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub hole_punching: bool,
    pub relay_service: bool,
    pub nat_service: bool,
}

impl Capabilities {
    /// Everything on, as used by bootstrap and satellite peers.
    pub fn all() -> Self {
        Self {
            hole_punching: true,
            relay_service: true,
            nat_service: true,
        }
    }
}
