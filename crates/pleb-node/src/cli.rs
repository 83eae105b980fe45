use std::net::IpAddr;

use clap::{Parser, Subcommand};
use pleb_core::constants::{DEFAULT_NAMESPACE, DEFAULT_SATELLITES, DEFAULT_TOPIC, MIN_SEED_LEN};
use pleb_core::{Capabilities, CoreError};
use pleb_crypto::{random_seed, NodeIdentity};
use pleb_p2p::P2pConfig;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(
    name = "pleb-node",
    version,
    about = "pleb peer-to-peer messaging node: gossip topics, direct chat, DHT rendezvous"
)]
pub struct Args {
    #[command(flatten)]
    pub node: NodeArgs,

    #[command(subcommand)]
    pub mode: Mode,
}

/// Options shared by every mode.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct NodeArgs {
    /// Listen port for TCP and QUIC. 0 picks an ephemeral port.
    #[arg(long, global = true, default_value_t = 0)]
    pub port: u16,

    /// Listen interface.
    #[arg(long, global = true, default_value = "0.0.0.0")]
    pub listen_ip: Option<IpAddr>,

    /// Peer to connect to, as `<multiaddr>/p2p/<peer-id>`.
    #[arg(long, global = true)]
    pub peer: Option<String>,

    /// Identity seed; at least 32 bytes. A random identity is used if absent.
    #[arg(long, global = true)]
    pub private_key: Option<String>,

    /// Run rendezvous discovery under this namespace.
    #[arg(long, global = true)]
    pub rendezvous: Option<String>,

    /// Enable hole punching (DCUtR).
    #[arg(long, global = true)]
    pub hole_punching: bool,

    /// Act as a circuit relay for other peers.
    #[arg(long, global = true)]
    pub relay_service: bool,

    /// Answer AutoNAT probes from other peers.
    #[arg(long, global = true)]
    pub nat_service: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Mode {
    /// Publish a canned message every 5 s and print the topic.
    Pubsub {
        #[arg(long, default_value = DEFAULT_TOPIC)]
        topic: String,
    },

    /// Publish each stdin line and print the topic.
    Console {
        #[arg(long, default_value = DEFAULT_TOPIC)]
        topic: String,
    },

    /// Direct chat. Listens without `--peer`, connects with it.
    Chat,

    /// Bootstrap node plus in-process satellite pubsub peers.
    Bootstrap {
        #[arg(long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,

        #[arg(long, default_value_t = DEFAULT_SATELLITES)]
        satellites: usize,

        #[arg(long, default_value = DEFAULT_TOPIC)]
        topic: String,
    },
}

impl NodeArgs {
    /// Seed bytes for the identity. Validated before anything else is built.
    pub fn seed(&self) -> Result<Zeroizing<Vec<u8>>, CoreError> {
        match &self.private_key {
            Some(key) if key.len() < MIN_SEED_LEN => Err(CoreError::SeedTooShort {
                min: MIN_SEED_LEN,
                got: key.len(),
            }),
            Some(key) => Ok(Zeroizing::new(key.as_bytes().to_vec())),
            None => Ok(random_seed()),
        }
    }

    pub fn identity(&self) -> Result<NodeIdentity, CoreError> {
        NodeIdentity::from_seed(&self.seed()?)
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            hole_punching: self.hole_punching,
            relay_service: self.relay_service,
            nat_service: self.nat_service,
        }
    }

    /// Network config for this node. `--peer` only becomes an explicit gossip
    /// peer when `gossip_peer` is set.
    pub fn p2p_config(&self, gossip_peer: bool) -> P2pConfig {
        let ip = self.listen_ip.unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let mut config = P2pConfig::listening_on(ip, self.port).with_capabilities(self.capabilities());
        if gossip_peer {
            if let Some(peer) = &self.peer {
                config = config.with_explicit_peer(peer.clone());
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_seed_rejected() {
        let args = NodeArgs {
            private_key: Some("too short".into()),
            ..NodeArgs::default()
        };
        assert!(matches!(args.seed(), Err(CoreError::SeedTooShort { got: 9, .. })));
    }

    #[test]
    fn same_seed_same_identity() {
        let args = NodeArgs {
            private_key: Some("x".repeat(32)),
            ..NodeArgs::default()
        };
        assert_eq!(args.identity().unwrap().peer_id(), args.identity().unwrap().peer_id());
    }

    #[test]
    fn missing_seed_is_random() {
        let args = NodeArgs::default();
        assert_ne!(args.identity().unwrap().peer_id(), args.identity().unwrap().peer_id());
    }

    #[test]
    fn global_options_parse_after_subcommand() {
        let args = Args::try_parse_from([
            "pleb-node",
            "pubsub",
            "--topic",
            "news",
            "--port",
            "4001",
            "--hole-punching",
        ])
        .unwrap();
        assert_eq!(args.node.port, 4001);
        assert!(args.node.capabilities().hole_punching);
        assert!(matches!(args.mode, Mode::Pubsub { ref topic } if topic == "news"));
    }

    #[test]
    fn bootstrap_defaults() {
        let args = Args::try_parse_from(["pleb-node", "bootstrap"]).unwrap();
        match args.mode {
            Mode::Bootstrap {
                namespace,
                satellites,
                topic,
            } => {
                assert_eq!(namespace, "plebbit");
                assert_eq!(satellites, 3);
                assert_eq!(topic, "demo");
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn peer_is_explicit_only_for_gossip_modes() {
        let args = NodeArgs {
            peer: Some("/ip4/127.0.0.1/tcp/1/p2p/12D3KooWDDnkUmiUsQXTsRz7R3e66A4B5WGr5qg4ApeEmxrmkDB8".into()),
            ..NodeArgs::default()
        };
        assert_eq!(args.p2p_config(true).explicit_peers.len(), 1);
        assert!(args.p2p_config(false).explicit_peers.is_empty());
    }
}
