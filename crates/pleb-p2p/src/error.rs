use libp2p::PeerId;
use pleb_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    // ── Construction ─────────────────────────────────────────────────────────
    #[error("failed to build network: {0}")]
    Build(String),

    #[error("cannot listen on {addr}: {reason}")]
    Listen { addr: String, reason: String },

    // ── Connectivity ─────────────────────────────────────────────────────────
    #[error("failed to connect to peer ({peer}): {reason}")]
    Dial { peer: PeerId, reason: String },

    #[error("no addresses known for peer {0}")]
    NoAddresses(PeerId),

    #[error("stream to {peer} on {protocol} failed: {reason}")]
    Stream {
        peer: PeerId,
        protocol: String,
        reason: String,
    },

    #[error("protocol {0} already has a stream handler")]
    AlreadyAccepting(String),

    // ── PubSub ───────────────────────────────────────────────────────────────
    #[error("failed to join topic {topic}: {reason}")]
    Join { topic: String, reason: String },

    #[error("publish on {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("subscription to {0} closed")]
    SubscriptionClosed(String),

    // ── Discovery ────────────────────────────────────────────────────────────
    #[error("discovery under {namespace} failed: {reason}")]
    Discovery { namespace: String, reason: String },

    // ── Lifecycle ────────────────────────────────────────────────────────────
    #[error("operation cancelled")]
    Cancelled,

    #[error("network task is no longer running")]
    NetworkClosed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}
