use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{DialError, NetworkBehaviour, SwarmEvent};
use libp2p::{
    autonat, dcutr, gossipsub, identify, kad, noise, ping, relay, tcp, yamux, Multiaddr, PeerId,
    StreamProtocol, Swarm,
};
use pleb_core::constants::{
    COMMAND_CHANNEL_CAPACITY, DISCOVERY_INTERVAL, GOSSIP_HEARTBEAT, SUBSCRIPTION_CHANNEL_CAPACITY,
};
use pleb_core::{Connectedness, ListenDescriptor, PeerRecord, TopicMessage};
use pleb_crypto::NodeIdentity;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address_book::{AddressBook, DISCOVERED_ADDRESS_TTL};
use crate::command::{Command, Reply};
use crate::config::P2pConfig;
use crate::error::P2pError;
use crate::handle::{Discovery, NetworkHandle, PubSub};

/// Combined libp2p network behaviour for a pleb node.
///
/// The `#[derive(NetworkBehaviour)]` macro auto-generates a
/// `PlebBehaviourEvent` enum with one variant per field.
#[derive(NetworkBehaviour)]
pub struct PlebBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub stream: libp2p_stream::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub relay: Toggle<relay::Behaviour>,
    pub dcutr: Toggle<dcutr::Behaviour>,
    pub autonat: Toggle<autonat::Behaviour>,
}

/// Application-facing handle returned from `P2pNetwork::new()`.
///
/// Cheap to clone; every clone talks to the same swarm task.
#[derive(Clone)]
pub struct P2pHandle {
    command_tx: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    local_peer_id: PeerId,
}

struct SubscriptionSlot {
    topic: String,
    tx: mpsc::Sender<TopicMessage>,
}

/// Owns the libp2p Swarm. Pass to `tokio::spawn(network.run(cancel))`.
pub struct P2pNetwork {
    swarm: Swarm<PlebBehaviour>,
    command_rx: mpsc::Receiver<Command>,
    address_book: AddressBook,
    pending_dials: HashMap<PeerId, Vec<Reply<()>>>,
    pending_finds: HashMap<kad::QueryId, (String, HashSet<PeerId>, Reply<Vec<PeerRecord>>)>,
    listen_waiters: Vec<oneshot::Sender<Vec<Multiaddr>>>,
    subscriptions: HashMap<gossipsub::TopicHash, SubscriptionSlot>,
}

impl P2pNetwork {
    /// Build the network and return `(P2pNetwork, P2pHandle)`.
    ///
    /// Listeners are opened and explicit peers are dialled here; nothing
    /// progresses until `run` is polled.
    pub fn new(
        config: &P2pConfig,
        identity: &NodeIdentity,
    ) -> Result<(Self, P2pHandle), P2pError> {
        let explicit_peers = config
            .explicit_peers
            .iter()
            .map(|s| PeerRecord::parse(s))
            .collect::<Result<Vec<_>, _>>()?;

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(identity.keypair().clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| P2pError::Build(e.to_string()))?
            .with_quic()
            .with_dns()
            .map_err(|e| P2pError::Build(e.to_string()))?
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .map_err(|e| P2pError::Build(e.to_string()))?
            .with_behaviour(|key, relay_client| build_behaviour(key, relay_client, config))
            .map_err(|e| P2pError::Build(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_connection_timeout))
            .build();

        for addr_str in &config.listen_addrs {
            let addr: Multiaddr = addr_str.parse().map_err(|e: libp2p::multiaddr::Error| {
                P2pError::Listen {
                    addr: addr_str.clone(),
                    reason: e.to_string(),
                }
            })?;
            swarm.listen_on(addr).map_err(|e| P2pError::Listen {
                addr: addr_str.clone(),
                reason: e.to_string(),
            })?;
        }

        let mut address_book = AddressBook::new();
        for record in &explicit_peers {
            let peer = record.peer_id;
            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer);
            for addr in &record.addresses {
                swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
            }
            address_book.add(peer, record.addresses.clone(), None);

            let opts = DialOpts::peer_id(peer)
                .addresses(record.addresses.clone())
                .build();
            match swarm.dial(opts) {
                Ok(()) => debug!(peer = %peer, "dialing explicit peer"),
                Err(e) => warn!(peer = %peer, error = %e, "failed to dial explicit peer"),
            }
        }

        let local_peer_id = *swarm.local_peer_id();
        let control = swarm.behaviour().stream.new_control();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let network = P2pNetwork {
            swarm,
            command_rx,
            address_book,
            pending_dials: HashMap::new(),
            pending_finds: HashMap::new(),
            listen_waiters: Vec::new(),
            subscriptions: HashMap::new(),
        };
        let handle = P2pHandle {
            command_tx,
            control,
            local_peer_id,
        };

        Ok((network, handle))
    }

    /// Drive the P2P event loop until `cancel` fires. Run in a dedicated
    /// tokio task.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("P2P event loop stopping");
                    break;
                }

                Some(cmd) = self.command_rx.recv() => self.handle_command(cmd),

                event = self.swarm.select_next_some() => self.handle_event(event),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::ListenAddrs { reply } => {
                let addrs: Vec<Multiaddr> = self.swarm.listeners().cloned().collect();
                if addrs.is_empty() {
                    self.listen_waiters.push(reply);
                } else {
                    let _ = reply.send(addrs);
                }
            }

            Command::Dial { record, reply } => self.dial(record, reply),

            Command::Connectedness { peer, reply } => {
                let _ = reply.send(Connectedness::from(self.swarm.is_connected(&peer)));
            }

            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }

            Command::RegisterAddresses {
                peer,
                addrs,
                ttl,
                reply,
            } => {
                for addr in &addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
                }
                self.address_book.add(peer, addrs, ttl);
                let _ = reply.send(());
            }

            Command::Join { topic, reply } => {
                let ident = gossipsub::IdentTopic::new(&topic);
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&ident)
                    .map(|newly| {
                        if newly {
                            info!(topic = %topic, "joined topic");
                        }
                    })
                    .map_err(|e| P2pError::Join {
                        topic: topic.clone(),
                        reason: e.to_string(),
                    });
                let _ = reply.send(result);
            }

            Command::Publish { topic, data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(gossipsub::IdentTopic::new(&topic), data)
                    .map(|_| ())
                    .map_err(|e| P2pError::Publish {
                        topic: topic.clone(),
                        reason: e.to_string(),
                    });
                let _ = reply.send(result);
            }

            Command::Subscribe { topic, reply } => {
                let hash = gossipsub::IdentTopic::new(&topic).hash();
                if let Some(slot) = self.subscriptions.get(&hash) {
                    if !slot.tx.is_closed() {
                        let _ = reply.send(Err(P2pError::Subscribe {
                            topic,
                            reason: "already subscribed".into(),
                        }));
                        return;
                    }
                }
                let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
                self.subscriptions.insert(hash, SubscriptionSlot { topic, tx });
                let _ = reply.send(Ok(rx));
            }

            Command::Advertise { namespace, reply } => {
                let key = kad::RecordKey::new(&namespace);
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(key)
                    .map(|_| debug!(namespace = %namespace, "advertising"))
                    .map_err(|e| P2pError::Discovery {
                        namespace: namespace.clone(),
                        reason: e.to_string(),
                    });
                let _ = reply.send(result);
            }

            Command::FindPeers { namespace, reply } => {
                let key = kad::RecordKey::new(&namespace);
                let id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                self.pending_finds.insert(id, (namespace, HashSet::new(), reply));
            }
        }
    }

    fn dial(&mut self, record: PeerRecord, reply: Reply<()>) {
        let peer = record.peer_id;
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }

        let mut addrs = record.addresses.clone();
        for known in self.address_book.addresses(&peer) {
            if !addrs.contains(&known) {
                addrs.push(known);
            }
        }
        for addr in &record.addresses {
            self.swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
        }

        let opts = DialOpts::peer_id(peer)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .addresses(addrs)
            .extend_addresses_through_behaviour()
            .build();

        match self.swarm.dial(opts) {
            // A dial already in flight resolves this reply too.
            Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                self.pending_dials.entry(peer).or_default().push(reply);
            }
            Err(DialError::NoAddresses) => {
                let _ = reply.send(Err(P2pError::NoAddresses(peer)));
            }
            Err(e) => {
                let _ = reply.send(Err(P2pError::Dial {
                    peer,
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<PlebBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "P2P listening on");
                if !self.listen_waiters.is_empty() {
                    let addrs: Vec<Multiaddr> = self.swarm.listeners().cloned().collect();
                    for waiter in self.listen_waiters.drain(..) {
                        let _ = waiter.send(addrs.clone());
                    }
                }
            }

            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!(peer = %peer_id, addr = %endpoint.get_remote_address(), "connection established");
                if endpoint.is_dialer() {
                    self.address_book.add(
                        peer_id,
                        [endpoint.get_remote_address().clone()],
                        Some(DISCOVERED_ADDRESS_TTL),
                    );
                }
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }

            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!(peer = %peer_id, cause = ?cause, "connection closed");
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                if self.swarm.is_connected(&peer_id) {
                    return;
                }
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    let reason = error.to_string();
                    for waiter in waiters {
                        let _ = waiter.send(Err(P2pError::Dial {
                            peer: peer_id,
                            reason: reason.clone(),
                        }));
                    }
                }
            }

            SwarmEvent::NewExternalAddrOfPeer { peer_id, address } => {
                self.address_book.add(peer_id, [address], Some(DISCOVERED_ADDRESS_TTL));
            }

            SwarmEvent::Behaviour(PlebBehaviourEvent::Gossipsub(event)) => {
                self.handle_gossip_event(event)
            }

            SwarmEvent::Behaviour(PlebBehaviourEvent::Kademlia(event)) => {
                self.handle_kad_event(event)
            }

            SwarmEvent::Behaviour(PlebBehaviourEvent::Identify(
                identify::Event::Received { peer_id, info, .. },
            )) => {
                for addr in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                self.address_book
                    .add(peer_id, info.listen_addrs, Some(DISCOVERED_ADDRESS_TTL));
            }

            SwarmEvent::Behaviour(PlebBehaviourEvent::Autonat(
                autonat::Event::StatusChanged { old, new },
            )) => {
                info!(old = ?old, new = ?new, "NAT status changed");
            }

            SwarmEvent::Behaviour(PlebBehaviourEvent::Dcutr(event)) => {
                debug!(event = ?event, "hole punching");
            }

            SwarmEvent::Behaviour(PlebBehaviourEvent::Relay(event)) => {
                debug!(event = ?event, "relay service");
            }

            _ => {}
        }
    }

    fn handle_gossip_event(&mut self, event: gossipsub::Event) {
        match event {
            gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            } => {
                let Some(slot) = self.subscriptions.get(&message.topic) else {
                    return;
                };
                let msg = TopicMessage {
                    topic: slot.topic.clone(),
                    source: message.source,
                    received_from: propagation_source,
                    data: message.data,
                };
                match slot.tx.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(topic = %slot.topic, "subscriber lagging; dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.subscriptions.remove(&message.topic);
                    }
                }
            }
            gossipsub::Event::Subscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "peer subscribed");
            }
            gossipsub::Event::Unsubscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "peer unsubscribed");
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed { id, result, .. } => match result {
                kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    if let Some((_, found, _)) = self.pending_finds.get_mut(&id) {
                        found.extend(providers);
                    }
                }
                kad::QueryResult::GetProviders(Ok(
                    kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
                )) => self.finish_find(id),
                kad::QueryResult::GetProviders(Err(e)) => {
                    debug!(error = %e, "provider query ended early");
                    self.finish_find(id);
                }
                kad::QueryResult::StartProviding(Ok(ok)) => {
                    debug!(key = ?ok.key, "provider record published");
                }
                kad::QueryResult::StartProviding(Err(e)) => {
                    warn!(error = %e, "failed to publish provider record");
                }
                _ => {}
            },
            kad::Event::RoutingUpdated { peer, .. } => {
                debug!(peer = %peer, "DHT routing table updated");
            }
            _ => {}
        }
    }

    fn finish_find(&mut self, id: kad::QueryId) {
        let Some((namespace, found, reply)) = self.pending_finds.remove(&id) else {
            return;
        };
        self.address_book.prune_at(Instant::now());
        let records: Vec<PeerRecord> = found
            .into_iter()
            .map(|peer| PeerRecord::new(peer, self.address_book.addresses(&peer)))
            .collect();
        debug!(namespace = %namespace, found = records.len(), "provider query finished");
        let _ = reply.send(Ok(records));
    }
}

fn build_behaviour(
    key: &Keypair,
    relay_client: relay::client::Behaviour,
    config: &P2pConfig,
) -> Result<PlebBehaviour, Box<dyn std::error::Error + Send + Sync>> {
    let local_peer_id = key.public().to_peer_id();

    // Seqno keeps repeated payloads from one author distinct.
    let message_id_fn = |msg: &gossipsub::Message| {
        let mut s = DefaultHasher::new();
        msg.source.hash(&mut s);
        msg.sequence_number.hash(&mut s);
        msg.data.hash(&mut s);
        gossipsub::MessageId::from(s.finish().to_string())
    };

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(GOSSIP_HEARTBEAT)
        .validation_mode(gossipsub::ValidationMode::Strict)
        .message_id_fn(message_id_fn)
        .build()?;

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(key.clone()),
        gossipsub_config,
    )?;

    let kad_protocol = StreamProtocol::try_from_owned(config.kad_protocol())
        .map_err(|e| format!("invalid kad protocol {:?}: {e:?}", config.kad_protocol()))?;
    let mut kad_config = kad::Config::new(kad_protocol);
    kad_config.set_query_timeout(DISCOVERY_INTERVAL);
    let store = kad::store::MemoryStore::new(local_peer_id);
    let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
    kademlia.set_mode(Some(kad::Mode::Server));

    let identify = identify::Behaviour::new(identify::Config::new(
        config.protocol_version.clone(),
        key.public(),
    ));

    let caps = config.capabilities;
    let relay = caps
        .relay_service
        .then(|| relay::Behaviour::new(local_peer_id, relay::Config::default()));
    let dcutr = caps.hole_punching.then(|| dcutr::Behaviour::new(local_peer_id));
    let autonat = caps
        .nat_service
        .then(|| autonat::Behaviour::new(local_peer_id, autonat::Config::default()));

    Ok(PlebBehaviour {
        gossipsub,
        kademlia,
        identify,
        ping: ping::Behaviour::default(),
        stream: libp2p_stream::Behaviour::new(),
        relay_client,
        relay: Toggle::from(relay),
        dcutr: Toggle::from(dcutr),
        autonat: Toggle::from(autonat),
    })
}

// ── Handle ───────────────────────────────────────────────────────────────────

impl P2pHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, P2pError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| P2pError::NetworkClosed)?;
        rx.await.map_err(|_| P2pError::NetworkClosed)
    }

    /// Peers with at least one open connection.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, P2pError> {
        self.request(|reply| Command::ConnectedPeers { reply }).await
    }
}

#[async_trait]
impl NetworkHandle for P2pHandle {
    type Stream = Compat<libp2p::Stream>;

    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn listen_addresses(&self) -> Result<ListenDescriptor, P2pError> {
        let addrs = self.request(|reply| Command::ListenAddrs { reply }).await?;
        Ok(ListenDescriptor::new(addrs))
    }

    async fn dial(&self, record: &PeerRecord) -> Result<(), P2pError> {
        let record = record.clone();
        self.request(|reply| Command::Dial { record, reply }).await?
    }

    async fn connectedness(&self, peer: PeerId) -> Result<Connectedness, P2pError> {
        self.request(|reply| Command::Connectedness { peer, reply }).await
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self::Stream, P2pError> {
        if !self.connectedness(peer).await?.is_connected() {
            self.dial(&PeerRecord::bare(peer)).await?;
        }
        let stream = self
            .control
            .clone()
            .open_stream(peer, protocol.clone())
            .await
            .map_err(|e| P2pError::Stream {
                peer,
                protocol: protocol.to_string(),
                reason: e.to_string(),
            })?;
        Ok(stream.compat())
    }

    fn accept_streams(
        &self,
        protocol: StreamProtocol,
    ) -> Result<BoxStream<'static, (PeerId, Self::Stream)>, P2pError> {
        let incoming = self
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|_| P2pError::AlreadyAccepting(protocol.to_string()))?;
        Ok(incoming
            .map(|(peer, stream)| (peer, stream.compat()))
            .boxed())
    }

    async fn register_addresses(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        ttl: Option<Duration>,
    ) -> Result<(), P2pError> {
        self.request(|reply| Command::RegisterAddresses {
            peer,
            addrs,
            ttl,
            reply,
        })
        .await
    }
}

#[async_trait]
impl PubSub for P2pHandle {
    async fn join(&self, topic: &str) -> Result<(), P2pError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Join { topic, reply }).await?
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), P2pError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Publish { topic, data, reply })
            .await?
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<TopicMessage>, P2pError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Subscribe { topic, reply }).await?
    }
}

#[async_trait]
impl Discovery for P2pHandle {
    async fn advertise(&self, namespace: &str) -> Result<(), P2pError> {
        let namespace = namespace.to_string();
        self.request(|reply| Command::Advertise { namespace, reply })
            .await?
    }

    async fn find_peers(&self, namespace: &str) -> Result<Vec<PeerRecord>, P2pError> {
        let namespace = namespace.to_string();
        self.request(|reply| Command::FindPeers { namespace, reply })
            .await?
    }
}
