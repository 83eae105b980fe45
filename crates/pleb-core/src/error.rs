use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Configuration errors ─────────────────────────────────────────────────
    #[error("--private-key argument too short: need at least {min} bytes, got {got}")]
    SeedTooShort { min: usize, got: usize },

    #[error("invalid identity key material: {0}")]
    InvalidKey(String),

    // ── Operator input errors ────────────────────────────────────────────────
    #[error("invalid peer address {input:?}: {reason}")]
    InvalidPeerAddress { input: String, reason: String },

    #[error("peer address {0:?} does not end with /p2p/<peer-id>")]
    MissingPeerId(String),
}
