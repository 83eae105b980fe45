use std::time::Duration;

/// ─── Pleb Node Constants ────────────────────────────────────────────────────
///
/// Protocol identifiers, default names and loop intervals shared by every
/// crate in the workspace.

// ── Identity ─────────────────────────────────────────────────────────────────

/// Minimum number of seed bytes accepted by the identity provider.
pub const MIN_SEED_LEN: usize = 32;

/// Number of seed bytes consumed as the ed25519 secret.
pub const ED25519_SEED_LEN: usize = 32;

// ── Protocols ────────────────────────────────────────────────────────────────

/// Stream protocol for direct line-oriented chat.
pub const CHAT_PROTOCOL: &str = "/chat/1.0.0";

/// Identify protocol version advertised to peers.
pub const PROTOCOL_VERSION: &str = "/pleb/1.0.0";

/// Kademlia protocol prefix. The full protocol is `{prefix}/kad/1.0.0`.
pub const KAD_PROTOCOL_PREFIX: &str = "/plebbit/lan";

// ── Names ────────────────────────────────────────────────────────────────────

/// Default pubsub topic.
pub const DEFAULT_TOPIC: &str = "demo";

/// Default rendezvous namespace for DHT discovery.
pub const DEFAULT_NAMESPACE: &str = "plebbit";

/// Canned payload emitted by the periodic publisher.
pub const CANNED_PAYLOAD: &str = "hello from libp2p go";

/// Number of in-process satellite peers started by the bootstrap topology.
pub const DEFAULT_SATELLITES: usize = 3;

// ── Intervals ────────────────────────────────────────────────────────────────

/// Delay between two periodic publishes.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

/// Delay between two discovery ticks. Failed dials are retried on the next
/// tick; there is no backoff.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// Gossipsub heartbeat.
pub const GOSSIP_HEARTBEAT: Duration = Duration::from_secs(1);

/// Idle connections are kept open at least this long.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

// ── Channels ─────────────────────────────────────────────────────────────────

/// Capacity of the command channel into the swarm task.
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Capacity of each topic subscription channel.
pub const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the operator console broadcast.
pub const CONSOLE_CHANNEL_CAPACITY: usize = 64;
