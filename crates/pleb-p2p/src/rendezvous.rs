//! Rendezvous discovery: advertise under a namespace, then periodically look
//! up everyone else advertising there and connect to the ones we are not yet
//! connected to.
//!
//! There is no backoff. A failed dial is retried on the next tick if the peer
//! is still listed.

use std::time::Duration;

use pleb_core::constants::DISCOVERY_INTERVAL;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::P2pError;
use crate::handle::{Discovery, NetworkHandle};

/// Outcome of one discovery tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub found: usize,
    pub skipped_self: usize,
    pub already_connected: usize,
    pub dialed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct RendezvousLoop {
    namespace: String,
    interval: Duration,
}

impl RendezvousLoop {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            interval: DISCOVERY_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One query/dial cycle. Dials run one after another; a failed dial is
    /// counted and the next record is tried.
    pub async fn tick<N, D>(&self, network: &N, discovery: &D) -> Result<TickReport, P2pError>
    where
        N: NetworkHandle,
        D: Discovery + ?Sized,
    {
        let local = network.local_peer_id();
        let records = discovery.find_peers(&self.namespace).await?;
        let mut report = TickReport {
            found: records.len(),
            ..TickReport::default()
        };

        for record in records {
            if record.peer_id == local {
                report.skipped_self += 1;
                continue;
            }
            if network.connectedness(record.peer_id).await?.is_connected() {
                report.already_connected += 1;
                continue;
            }

            report.dialed += 1;
            match network.dial(&record).await {
                Ok(()) => info!(peer = %record.peer_id, "Connected to peer"),
                Err(e) => {
                    report.failed += 1;
                    warn!(peer = %record.peer_id, error = %e, "Failed to connect to peer");
                }
            }
        }

        Ok(report)
    }

    /// Advertise once, then tick every interval until `cancel` fires. The
    /// first tick happens one interval after start.
    pub async fn run<N, D>(&self, network: &N, discovery: &D, cancel: CancellationToken)
    where
        N: NetworkHandle,
        D: Discovery + ?Sized,
    {
        match discovery.advertise(&self.namespace).await {
            Ok(()) => info!(namespace = %self.namespace, "advertising"),
            Err(e) => warn!(namespace = %self.namespace, error = %e, "advertise failed"),
        }

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.tick(network, discovery) => outcome,
            };

            match outcome {
                Ok(report) => debug!(
                    namespace = %self.namespace,
                    found = report.found,
                    connected = report.already_connected,
                    dialed = report.dialed,
                    failed = report.failed,
                    "discovery tick"
                ),
                Err(e) => warn!(namespace = %self.namespace, error = %e, "peer discovery failed"),
            }
        }

        debug!(namespace = %self.namespace, "discovery loop stopped");
    }
}
