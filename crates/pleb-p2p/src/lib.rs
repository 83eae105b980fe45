//! pleb-p2p
//!
//! libp2p networking layer for pleb nodes.
//!
//! GossipSub carries topic messages between peers.
//! Kademlia DHT backs rendezvous advertise and peer lookup.
//! A raw `/chat/1.0.0` stream carries direct line-oriented chat.
//! Identify and Ping maintain connection metadata and liveness.

pub mod address_book;
pub mod chat;
pub mod command;
pub mod config;
pub mod error;
pub mod handle;
pub mod mock;
pub mod network;
pub mod rendezvous;
pub mod topic;

pub use chat::{chat_protocol, open_chat, serve_chat, spawn_chat, ChatTasks};
pub use config::P2pConfig;
pub use error::P2pError;
pub use handle::{Discovery, NetworkHandle, PubSub};
pub use network::{P2pHandle, P2pNetwork};
pub use rendezvous::{RendezvousLoop, TickReport};
pub use topic::{Subscription, TopicHandle};
