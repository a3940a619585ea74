//! Failure Detector (spec §4.3, component C3).
//!
//! Each node runs one of these per peer set, watching keepalive
//! timestamps and racing to CAS a stale peer's daemon-state to *dead*.
//! The suspect → grace-wait → re-read → declare sequence below mirrors
//! the supervisor's crash-then-restart monitor loop, replacing "restart
//! a local child process" with "declare a remote peer dead and hand off
//! to the Fencer".

use crate::error::Result;
use hyperfence_store::StoreClient;
use hyperfence_types::{DaemonState, Node, NodeName};
use std::time::Duration;
use tracing::{info, warn};

/// Default number of missed keepalives before a peer is suspected
/// (spec §4.3: `N_miss = 6`).
pub const DEFAULT_N_MISS: u32 = 6;

async fn node_path(store: &StoreClient, name: &NodeName) -> Result<String> {
    Ok(store.resolve_path("node", name.as_str()).await?)
}

/// Outcome of one suspicion pass over a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// Peer keepalive is within the missed-tick threshold.
    Healthy,
    /// Peer was stale but advanced its keepalive during the grace wait.
    RecoveredDuringGrace,
    /// This detector won the CAS race and declared the peer dead.
    DeclaredDead,
    /// Another detector won the race first.
    LostRaceToAnotherDetector,
    /// The peer is in maintenance; detection recorded a fault but did
    /// not escalate (spec §4.3: "Maintenance mode short-circuits").
    MaintenanceShortCircuit,
}

pub struct FailureDetector {
    store: StoreClient,
    keepalive_period: Duration,
    n_miss: u32,
}

impl FailureDetector {
    pub fn new(store: StoreClient, keepalive_period: Duration, n_miss: u32) -> Self {
        Self {
            store,
            keepalive_period,
            n_miss,
        }
    }

    fn suspicion_threshold_ms(&self) -> i64 {
        (self.keepalive_period.as_millis() as i64) * i64::from(self.n_miss)
    }

    /// Checks one peer and, if stale past the grace period, attempts to
    /// declare it dead (spec §4.3).
    pub async fn check_peer(&self, peer: &NodeName, now_ms: i64) -> Result<DetectionOutcome> {
        let path = node_path(&self.store, peer).await?;
        let Some(before) = self.store.get::<Node>(&path).await? else {
            return Ok(DetectionOutcome::Healthy);
        };

        if now_ms - before.value.keepalive_timestamp_ms <= self.suspicion_threshold_ms() {
            return Ok(DetectionOutcome::Healthy);
        }

        if before.value.daemon_state == DaemonState::Flushing
            || before.value.daemon_state == DaemonState::Flushed
            || before.value.daemon_state == DaemonState::Unflushing
        {
            warn!(peer = %peer, "peer stale but in maintenance-like state, recording fault only");
            return Ok(DetectionOutcome::MaintenanceShortCircuit);
        }

        warn!(peer = %peer, "peer suspected stale, waiting out grace period");
        tokio::time::sleep(self.keepalive_period).await;

        let Some(after) = self.store.get::<Node>(&path).await? else {
            return Ok(DetectionOutcome::Healthy);
        };

        if after.value.keepalive_timestamp_ms != before.value.keepalive_timestamp_ms {
            info!(peer = %peer, "peer keepalive advanced during grace period, no longer suspect");
            return Ok(DetectionOutcome::RecoveredDuringGrace);
        }

        if after.value.daemon_state == DaemonState::Dead {
            return Ok(DetectionOutcome::LostRaceToAnotherDetector);
        }

        let mut declared = after.value.clone();
        declared.daemon_state = DaemonState::Dead;

        match self.store.cas(&path, Some(after.version), &declared).await {
            Ok(_) => {
                warn!(peer = %peer, "declared peer dead");
                Ok(DetectionOutcome::DeclaredDead)
            }
            Err(hyperfence_store::StoreError::VersionConflict { .. }) => {
                info!(peer = %peer, "lost the declare-dead cas race to another detector");
                Ok(DetectionOutcome::LostRaceToAnotherDetector)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Sweeps every peer in `peers` once.
    pub async fn sweep(
        &self,
        peers: &[NodeName],
        now_ms: i64,
    ) -> Vec<(NodeName, Result<DetectionOutcome>)> {
        let mut results = Vec::with_capacity(peers.len());
        for peer in peers {
            let outcome = self.check_peer(peer, now_ms).await;
            results.push((peer.clone(), outcome));
        }
        results
    }
}
