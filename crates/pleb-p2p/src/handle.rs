//! Collaborator seams between the core loops and the network.
//!
//! The chat protocol, topic channel and rendezvous loop only ever see these
//! traits. `P2pHandle` implements all three over a libp2p swarm; the types in
//! `mock` implement them in memory for tests.
//!
//! Every method must be safe to call concurrently from independent tasks.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use pleb_core::{Connectedness, ListenDescriptor, PeerRecord, TopicMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::P2pError;

/// Dialing, stream and connectivity capabilities of the local node.
#[async_trait]
pub trait NetworkHandle: Send + Sync + 'static {
    /// Duplex byte stream handed out by `open_stream` / `accept_streams`.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn local_peer_id(&self) -> PeerId;

    /// Addresses the node is reachable on. Waits for the first listener to
    /// come up.
    async fn listen_addresses(&self) -> Result<ListenDescriptor, P2pError>;

    /// Connect to `record`. Succeeds immediately if already connected.
    async fn dial(&self, record: &PeerRecord) -> Result<(), P2pError>;

    async fn connectedness(&self, peer: PeerId) -> Result<Connectedness, P2pError>;

    /// Open a new stream to `peer`, dialing first if needed.
    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self::Stream, P2pError>;

    /// Inbound streams on `protocol`. Only one caller may accept a protocol.
    fn accept_streams(
        &self,
        protocol: StreamProtocol,
    ) -> Result<BoxStream<'static, (PeerId, Self::Stream)>, P2pError>;

    /// Remember addresses for `peer`. `None` keeps them for the process
    /// lifetime.
    async fn register_addresses(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        ttl: Option<Duration>,
    ) -> Result<(), P2pError>;
}

/// Gossip publish/subscribe service.
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// Join `topic`. Joining twice is a no-op.
    async fn join(&self, topic: &str) -> Result<(), P2pError>;

    /// Fire-and-forget publish; success only means the message was handed
    /// to the gossip layer.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), P2pError>;

    /// Start receiving messages on a joined topic. At most one live receiver
    /// per topic.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<TopicMessage>, P2pError>;
}

/// Rendezvous-style discovery backed by a DHT.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Register this node as discoverable under `namespace`.
    async fn advertise(&self, namespace: &str) -> Result<(), P2pError>;

    /// Peers currently known under `namespace`. May include this node.
    async fn find_peers(&self, namespace: &str) -> Result<Vec<PeerRecord>, P2pError>;
}
