use libp2p::identity::Keypair;
use libp2p::PeerId;
use pleb_core::constants::{ED25519_SEED_LEN, MIN_SEED_LEN};
use pleb_core::CoreError;
use rand::RngCore;
use zeroize::Zeroizing;

/// The node's ed25519 identity and the PeerId derived from it.
///
/// Derivation is deterministic: the same seed always yields the same PeerId,
/// so a node keeps its address across restarts.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Derive an identity from an operator-supplied seed.
    ///
    /// The first 32 bytes are used as the ed25519 secret; anything after that
    /// is ignored. Seeds shorter than 32 bytes are rejected.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CoreError> {
        if seed.len() < MIN_SEED_LEN {
            return Err(CoreError::SeedTooShort {
                min: MIN_SEED_LEN,
                got: seed.len(),
            });
        }

        // ed25519_from_bytes zeroizes its input; hand it a scratch copy.
        let mut secret = Zeroizing::new([0u8; ED25519_SEED_LEN]);
        secret.copy_from_slice(&seed[..ED25519_SEED_LEN]);
        let keypair = Keypair::ed25519_from_bytes(&mut secret[..])
            .map_err(|e| CoreError::InvalidKey(e.to_string()))?;

        let peer_id = keypair.public().to_peer_id();
        Ok(Self { keypair, peer_id })
    }

    /// Fresh identity from a random seed.
    pub fn generate() -> Self {
        let seed = random_seed();
        Self::from_seed(&seed[..]).unwrap_or_else(|_| {
            let keypair = Keypair::generate_ed25519();
            let peer_id = keypair.public().to_peer_id();
            Self { keypair, peer_id }
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Hex of the protobuf-encoded public key, for diagnostics.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public().encode_protobuf())
    }
}

/// 32 random bytes suitable as an identity seed.
pub fn random_seed() -> Zeroizing<Vec<u8>> {
    let mut seed = Zeroizing::new(vec![0u8; MIN_SEED_LEN]);
    rand::thread_rng().fill_bytes(&mut seed[..]);
    seed
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeIdentity {{ peer_id: {} }}", self.peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn same_seed_same_peer_id() {
        let a = NodeIdentity::from_seed(SEED).unwrap();
        let b = NodeIdentity::from_seed(SEED).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
        assert_eq!(a.public_key_hex(), b.public_key_hex());
    }

    #[test]
    fn different_seeds_differ() {
        let a = NodeIdentity::from_seed(SEED).unwrap();
        let b = NodeIdentity::from_seed(b"fedcba9876543210fedcba9876543210").unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn bytes_past_32_are_ignored() {
        let mut long = SEED.to_vec();
        long.extend_from_slice(b"trailing bytes that do not matter");
        let a = NodeIdentity::from_seed(SEED).unwrap();
        let b = NodeIdentity::from_seed(&long).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn short_seed_rejected() {
        for len in [0usize, 1, 16, 31] {
            let err = NodeIdentity::from_seed(&SEED[..len]).unwrap_err();
            match err {
                CoreError::SeedTooShort { min, got } => {
                    assert_eq!(min, 32);
                    assert_eq!(got, len);
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn generated_identities_are_distinct() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn debug_hides_key_material() {
        let id = NodeIdentity::from_seed(SEED).unwrap();
        let dbg = format!("{id:?}");
        assert!(dbg.contains(&id.peer_id().to_string()));
        assert!(!dbg.contains(&id.public_key_hex()));
    }
}
