use std::net::IpAddr;
use std::time::Duration;

use pleb_core::constants::{IDLE_CONNECTION_TIMEOUT, KAD_PROTOCOL_PREFIX, PROTOCOL_VERSION};
use pleb_core::Capabilities;

/// Configuration for a pleb P2P network handle.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Local listen multiaddresses (e.g. "/ip4/0.0.0.0/tcp/4001").
    pub listen_addrs: Vec<String>,
    /// Peer strings (`<multiaddr>/p2p/<peer-id>`) registered as gossip
    /// explicit peers and dialled at startup.
    pub explicit_peers: Vec<String>,
    /// Protocol version string advertised to peers.
    pub protocol_version: String,
    /// Kademlia protocol prefix; the DHT speaks `{prefix}/kad/1.0.0`.
    pub kad_protocol_prefix: String,
    /// NAT-related services to enable.
    pub capabilities: Capabilities,
    /// How long an idle connection is kept before the swarm closes it.
    pub idle_connection_timeout: Duration,
}

impl P2pConfig {
    /// Listen on TCP and QUIC on the same port. Port 0 picks an ephemeral one
    /// per transport.
    pub fn listening_on(ip: IpAddr, port: u16) -> Self {
        Self {
            listen_addrs: listen_addrs_for(ip, port),
            ..Self::default()
        }
    }

    pub fn with_explicit_peer(mut self, peer: impl Into<String>) -> Self {
        self.explicit_peers.push(peer.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// `{prefix}/kad/1.0.0`
    pub fn kad_protocol(&self) -> String {
        format!("{}/kad/1.0.0", self.kad_protocol_prefix)
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addrs: listen_addrs_for(IpAddr::from([0, 0, 0, 0]), 0),
            explicit_peers: Vec::new(),
            protocol_version: PROTOCOL_VERSION.into(),
            kad_protocol_prefix: KAD_PROTOCOL_PREFIX.into(),
            capabilities: Capabilities::default(),
            idle_connection_timeout: IDLE_CONNECTION_TIMEOUT,
        }
    }
}

fn listen_addrs_for(ip: IpAddr, port: u16) -> Vec<String> {
    let family = match ip {
        IpAddr::V4(_) => "ip4",
        IpAddr::V6(_) => "ip6",
    };
    vec![
        format!("/{family}/{ip}/tcp/{port}"),
        format!("/{family}/{ip}/udp/{port}/quic-v1"),
    ]
}
