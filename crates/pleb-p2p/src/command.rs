use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use pleb_core::{Connectedness, PeerRecord, TopicMessage};
use tokio::sync::{mpsc, oneshot};

use crate::error::P2pError;

pub type Reply<T> = oneshot::Sender<Result<T, P2pError>>;

/// Requests served by the swarm task on behalf of a `P2pHandle`.
#[derive(Debug)]
pub enum Command {
    // ── Network handle ───────────────────────────────────────────────────────
    /// Current listen addresses; deferred until at least one is known.
    ListenAddrs { reply: oneshot::Sender<Vec<Multiaddr>> },

    Dial { record: PeerRecord, reply: Reply<()> },

    Connectedness {
        peer: PeerId,
        reply: oneshot::Sender<Connectedness>,
    },

    ConnectedPeers { reply: oneshot::Sender<Vec<PeerId>> },

    RegisterAddresses {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        ttl: Option<Duration>,
        reply: oneshot::Sender<()>,
    },

    // ── PubSub ───────────────────────────────────────────────────────────────
    Join { topic: String, reply: Reply<()> },

    Publish {
        topic: String,
        data: Vec<u8>,
        reply: Reply<()>,
    },

    Subscribe {
        topic: String,
        reply: Reply<mpsc::Receiver<TopicMessage>>,
    },

    // ── Discovery ────────────────────────────────────────────────────────────
    Advertise { namespace: String, reply: Reply<()> },

    FindPeers {
        namespace: String,
        reply: Reply<Vec<PeerRecord>>,
    },
}
