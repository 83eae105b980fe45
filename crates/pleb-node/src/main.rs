//! pleb-node: peer-to-peer messaging node binary.
//!
//! Startup sequence:
//!   1. Validate the identity seed (a short seed exits before anything starts)
//!   2. Derive the node identity
//!   3. Start the P2P network and the tasks of the selected mode
//!   4. Run until Ctrl-C or a fatal task error, then cancel everything

use anyhow::Context;
use clap::Parser;
use pleb_core::CoreError;
use pleb_node::{topology, Args};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pleb=debug")),
        )
        .init();

    let args = Args::parse();

    // ── Identity ──────────────────────────────────────────────────────────────
    let identity = match args.node.identity() {
        Ok(identity) => identity,
        Err(CoreError::SeedTooShort { .. }) => {
            println!("--private-key argument too short");
            return Ok(());
        }
        Err(e) => return Err(e).context("deriving node identity"),
    };
    info!(peer_id = %identity.peer_id(), public_key = %identity.public_key_hex(), "pleb node starting");

    // ── Shutdown ──────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C");
                return;
            }
            info!("Ctrl-C received; shutting down");
            cancel.cancel();
        });
    }

    topology::run(args, identity, cancel).await
}
