//! In-memory collaborators for tests.
//!
//! Nodes built on the same `MockMesh` / `MockRegistry` / `MockBus` see each
//! other. Every call is recorded so tests can assert on what the core loops
//! actually did.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use pleb_core::{Connectedness, ListenDescriptor, PeerRecord, TopicMessage};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::error::P2pError;
use crate::handle::{Discovery, NetworkHandle, PubSub};

const STREAM_BUFFER: usize = 64 * 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

// ── Network ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MeshState {
    nodes: HashSet<PeerId>,
    links: HashSet<(PeerId, PeerId)>,
    unreachable: HashSet<PeerId>,
    dials: Vec<(PeerId, PeerId)>,
    acceptors: HashMap<(PeerId, StreamProtocol), mpsc::UnboundedSender<(PeerId, DuplexStream)>>,
}

/// Shared connectivity for a set of `MockNetwork`s. Links are symmetric.
#[derive(Clone, Default)]
pub struct MockMesh {
    state: Arc<Mutex<MeshState>>,
}

impl MockMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dial attempt as `(from, to)`, in order.
    pub fn dials(&self) -> Vec<(PeerId, PeerId)> {
        lock(&self.state).dials.clone()
    }

    /// Dials to `peer` fail from now on.
    pub fn set_unreachable(&self, peer: PeerId) {
        lock(&self.state).unreachable.insert(peer);
    }

    pub fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        lock(&self.state).links.contains(&link_key(a, b))
    }
}

/// One node on a `MockMesh`.
#[derive(Clone)]
pub struct MockNetwork {
    peer_id: PeerId,
    listen: Vec<Multiaddr>,
    mesh: MockMesh,
    known: Arc<Mutex<HashMap<PeerId, Vec<Multiaddr>>>>,
}

impl MockNetwork {
    pub fn new(mesh: &MockMesh, listen: Vec<Multiaddr>) -> Self {
        let peer_id = PeerId::random();
        lock(&mesh.state).nodes.insert(peer_id);
        Self {
            peer_id,
            listen,
            mesh: mesh.clone(),
            known: Arc::default(),
        }
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen.clone()
    }
}

#[async_trait]
impl NetworkHandle for MockNetwork {
    type Stream = DuplexStream;

    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn listen_addresses(&self) -> Result<ListenDescriptor, P2pError> {
        Ok(ListenDescriptor::new(self.listen.clone()))
    }

    async fn dial(&self, record: &PeerRecord) -> Result<(), P2pError> {
        let peer = record.peer_id;
        let has_addresses = record.has_addresses()
            || lock(&self.known).get(&peer).is_some_and(|a| !a.is_empty());

        let mut state = lock(&self.mesh.state);
        state.dials.push((self.peer_id, peer));
        if state.links.contains(&link_key(self.peer_id, peer)) {
            return Ok(());
        }

        if peer == self.peer_id {
            return Err(P2pError::Dial {
                peer,
                reason: "dial to self attempted".into(),
            });
        }
        if !has_addresses {
            return Err(P2pError::NoAddresses(peer));
        }
        if state.unreachable.contains(&peer) || !state.nodes.contains(&peer) {
            return Err(P2pError::Dial {
                peer,
                reason: "connection refused".into(),
            });
        }

        state.links.insert(link_key(self.peer_id, peer));
        Ok(())
    }

    async fn connectedness(&self, peer: PeerId) -> Result<Connectedness, P2pError> {
        Ok(self.mesh.is_linked(self.peer_id, peer).into())
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<DuplexStream, P2pError> {
        if !self.mesh.is_linked(self.peer_id, peer) {
            self.dial(&PeerRecord::bare(peer)).await?;
        }

        let state = lock(&self.mesh.state);
        let acceptor = state
            .acceptors
            .get(&(peer, protocol.clone()))
            .ok_or_else(|| P2pError::Stream {
                peer,
                protocol: protocol.to_string(),
                reason: "protocol not supported".into(),
            })?;

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        acceptor
            .send((self.peer_id, remote))
            .map_err(|_| P2pError::Stream {
                peer,
                protocol: protocol.to_string(),
                reason: "remote stopped accepting".into(),
            })?;
        Ok(local)
    }

    fn accept_streams(
        &self,
        protocol: StreamProtocol,
    ) -> Result<BoxStream<'static, (PeerId, DuplexStream)>, P2pError> {
        let mut state = lock(&self.mesh.state);
        let key = (self.peer_id, protocol);
        if state.acceptors.get(&key).is_some_and(|tx| !tx.is_closed()) {
            return Err(P2pError::AlreadyAccepting(key.1.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.acceptors.insert(key, tx);
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|s| (s, rx)) }).boxed())
    }

    async fn register_addresses(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        _ttl: Option<Duration>,
    ) -> Result<(), P2pError> {
        let mut known = lock(&self.known);
        let entry = known.entry(peer).or_default();
        for addr in addrs {
            if !entry.contains(&addr) {
                entry.push(addr);
            }
        }
        Ok(())
    }
}

// ── Discovery ────────────────────────────────────────────────────────────────

/// Shared namespace → records table; a perfect discovery service.
#[derive(Clone, Default)]
pub struct MockRegistry {
    namespaces: Arc<Mutex<HashMap<String, Vec<PeerRecord>>>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `record` under `namespace`, replacing any record for the same peer.
    pub fn insert(&self, namespace: &str, record: PeerRecord) {
        let mut namespaces = lock(&self.namespaces);
        let records = namespaces.entry(namespace.to_string()).or_default();
        records.retain(|r| r.peer_id != record.peer_id);
        records.push(record);
    }

    pub fn records(&self, namespace: &str) -> Vec<PeerRecord> {
        lock(&self.namespaces)
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct MockDiscovery {
    registry: MockRegistry,
    local: PeerRecord,
    failing_queries: AtomicUsize,
    queries: AtomicU64,
}

impl MockDiscovery {
    pub fn new(registry: &MockRegistry, local: PeerRecord) -> Self {
        Self {
            registry: registry.clone(),
            local,
            failing_queries: AtomicUsize::new(0),
            queries: AtomicU64::new(0),
        }
    }

    /// The next `n` queries fail.
    pub fn fail_queries(&self, n: usize) {
        self.failing_queries.store(n, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn advertise(&self, namespace: &str) -> Result<(), P2pError> {
        self.registry.insert(namespace, self.local.clone());
        Ok(())
    }

    async fn find_peers(&self, namespace: &str) -> Result<Vec<PeerRecord>, P2pError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(P2pError::Discovery {
                namespace: namespace.to_string(),
                reason: "query timed out".into(),
            });
        }
        Ok(self.registry.records(namespace))
    }
}

// ── PubSub ───────────────────────────────────────────────────────────────────

/// Topic → member → live receiver.
type Topics = HashMap<String, HashMap<PeerId, Option<mpsc::Sender<TopicMessage>>>>;

/// Shared gossip fabric. Delivery is direct and immediate.
#[derive(Clone, Default)]
pub struct MockBus {
    topics: Arc<Mutex<Topics>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes joined to `topic`.
    pub fn members(&self, topic: &str) -> usize {
        lock(&self.topics).get(topic).map_or(0, HashMap::len)
    }
}

pub struct MockPubSub {
    peer_id: PeerId,
    bus: MockBus,
    failing_publishes: AtomicUsize,
    attempts: AtomicU64,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockPubSub {
    pub fn on_bus(peer_id: PeerId, bus: &MockBus) -> Self {
        Self {
            peer_id,
            bus: bus.clone(),
            failing_publishes: AtomicUsize::new(0),
            attempts: AtomicU64::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    /// The next `n` publishes fail.
    pub fn fail_next(&self, n: usize) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    pub fn publish_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful publishes as `(topic, payload)`.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl PubSub for MockPubSub {
    async fn join(&self, topic: &str) -> Result<(), P2pError> {
        lock(&self.bus.topics)
            .entry(topic.to_string())
            .or_default()
            .entry(self.peer_id)
            .or_insert(None);
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), P2pError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(P2pError::Publish {
                topic: topic.to_string(),
                reason: "InsufficientPeers".into(),
            });
        }

        let topics = lock(&self.bus.topics);
        if let Some(members) = topics.get(topic) {
            for (peer, tx) in members {
                let Some(tx) = tx.as_ref().filter(|_| *peer != self.peer_id) else {
                    continue;
                };
                let _ = tx.try_send(TopicMessage {
                    topic: topic.to_string(),
                    source: Some(self.peer_id),
                    received_from: self.peer_id,
                    data: data.clone(),
                });
            }
        }
        drop(topics);

        lock(&self.published).push((topic.to_string(), data));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<TopicMessage>, P2pError> {
        let mut topics = lock(&self.bus.topics);
        let slot = topics
            .get_mut(topic)
            .and_then(|members| members.get_mut(&self.peer_id))
            .ok_or_else(|| P2pError::Subscribe {
                topic: topic.to_string(),
                reason: "topic not joined".into(),
            })?;

        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(P2pError::Subscribe {
                topic: topic.to_string(),
                reason: "already subscribed".into(),
            });
        }

        let (tx, rx) = mpsc::channel(pleb_core::constants::SUBSCRIPTION_CHANNEL_CAPACITY);
        *slot = Some(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_links_both_ends() {
        let mesh = MockMesh::new();
        let a = MockNetwork::new(&mesh, vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()]);
        let b = MockNetwork::new(&mesh, vec!["/ip4/127.0.0.1/tcp/2".parse().unwrap()]);

        a.dial(&PeerRecord::new(b.local_peer_id(), b.listen_addrs()))
            .await
            .unwrap();

        assert!(b.connectedness(a.local_peer_id()).await.unwrap().is_connected());
        assert_eq!(mesh.dials(), vec![(a.local_peer_id(), b.local_peer_id())]);
    }

    #[tokio::test]
    async fn redial_of_linked_peer_is_recorded() {
        let mesh = MockMesh::new();
        let a = MockNetwork::new(&mesh, vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()]);
        let b = MockNetwork::new(&mesh, vec!["/ip4/127.0.0.1/tcp/2".parse().unwrap()]);
        let record = PeerRecord::new(b.local_peer_id(), b.listen_addrs());

        a.dial(&record).await.unwrap();
        a.dial(&record).await.unwrap();

        assert_eq!(mesh.dials().len(), 2);
    }

    #[tokio::test]
    async fn registered_addresses_make_bare_dial_work() {
        let mesh = MockMesh::new();
        let a = MockNetwork::new(&mesh, Vec::new());
        let b = MockNetwork::new(&mesh, Vec::new());
        let bare = PeerRecord::bare(b.local_peer_id());

        assert!(matches!(a.dial(&bare).await, Err(P2pError::NoAddresses(_))));
        a.register_addresses(b.local_peer_id(), vec!["/ip4/10.0.0.2/tcp/1".parse().unwrap()], None)
            .await
            .unwrap();
        a.dial(&bare).await.unwrap();
    }

    #[tokio::test]
    async fn single_acceptor_per_protocol() {
        let mesh = MockMesh::new();
        let a = MockNetwork::new(&mesh, Vec::new());
        let proto = StreamProtocol::new("/chat/1.0.0");
        let _incoming = a.accept_streams(proto.clone()).unwrap();
        assert!(matches!(
            a.accept_streams(proto),
            Err(P2pError::AlreadyAccepting(_))
        ));
    }

    #[tokio::test]
    async fn subscribe_requires_join() {
        let bus = MockBus::new();
        let ps = MockPubSub::on_bus(PeerId::random(), &bus);
        assert!(ps.subscribe("demo").await.is_err());
        ps.join("demo").await.unwrap();
        assert!(ps.subscribe("demo").await.is_ok());
    }
}
