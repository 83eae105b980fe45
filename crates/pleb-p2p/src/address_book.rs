//! Address book: candidate addresses per peer with optional expiry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use libp2p::{Multiaddr, PeerId};

/// TTL for addresses learned from identify or from the DHT.
pub const DISCOVERED_ADDRESS_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct Entry {
    addr: Multiaddr,
    /// `None` never expires.
    expires: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct AddressBook {
    peers: HashMap<PeerId, Vec<Entry>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh addresses for `peer`.
    pub fn add(
        &mut self,
        peer: PeerId,
        addrs: impl IntoIterator<Item = Multiaddr>,
        ttl: Option<Duration>,
    ) {
        self.add_at(peer, addrs, ttl, Instant::now());
    }

    pub fn add_at(
        &mut self,
        peer: PeerId,
        addrs: impl IntoIterator<Item = Multiaddr>,
        ttl: Option<Duration>,
        now: Instant,
    ) {
        let expires = ttl.and_then(|t| now.checked_add(t));
        let entries = self.peers.entry(peer).or_default();

        for addr in addrs {
            match entries.iter_mut().find(|e| e.addr == addr) {
                Some(existing) => {
                    // A permanent entry stays permanent; otherwise keep the later expiry.
                    existing.expires = match (existing.expires, expires) {
                        (None, _) | (_, None) => None,
                        (Some(a), Some(b)) => Some(a.max(b)),
                    };
                }
                None => entries.push(Entry { addr, expires }),
            }
        }
    }

    /// Live addresses for `peer`, in insertion order.
    pub fn addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.addresses_at(peer, Instant::now())
    }

    pub fn addresses_at(&self, peer: &PeerId, now: Instant) -> Vec<Multiaddr> {
        self.peers
            .get(peer)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.expires.map_or(true, |t| t > now))
                    .map(|e| e.addr.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired entries and peers left with none.
    pub fn prune_at(&mut self, now: Instant) {
        self.peers.retain(|_, entries| {
            entries.retain(|e| e.expires.map_or(true, |t| t > now));
            !entries.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
