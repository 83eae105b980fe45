pub mod keypair;

pub use keypair::{random_seed, NodeIdentity};
