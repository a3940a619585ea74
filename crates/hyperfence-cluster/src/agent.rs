//! Node Agent (spec §4.2, component C2).
//!
//! On startup, ensures a `Node` record exists for this hostname, sets
//! daemon-state=init, and drives the keepalive loop until a shutdown
//! signal arrives. The keepalive loop structure (a `tokio::select!` over
//! an interval tick and a shutdown future) follows the cluster
//! supervisor's monitor loop.

use crate::error::{Error, Result};
use async_trait::async_trait;
use hyperfence_store::{Session, StoreClient};
use hyperfence_types::{DaemonState, Node, NodeName, Resources};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::info;

/// Samples the live resource figures for this host (spec §4.2 step 1).
/// A real implementation reads `/proc`, libvirt, and the storage
/// subsystem; tests inject canned values.
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self) -> Resources;
}

/// Outcome of one independent health plugin (spec §4.2 step 2: "each
/// returns a health delta and optional fault identifier").
#[derive(Debug, Clone)]
pub struct HealthCheckOutcome {
    pub healthy: bool,
    pub health_delta: u8,
    pub fault_id: Option<String>,
    pub message: Option<String>,
}

impl HealthCheckOutcome {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            health_delta: 0,
            fault_id: None,
            message: None,
        }
    }
}

/// One independent health plugin (IPMI reachability, PSU redundancy,
/// RAID, SMART, load ceiling, network link, database reachability...).
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> HealthCheckOutcome;
}

async fn node_path(store: &StoreClient, name: &NodeName) -> Result<String> {
    Ok(store.resolve_path("node", name.as_str()).await?)
}

/// The per-node agent: owns this node's `Node` record and keepalive
/// loop (spec §4.2).
pub struct NodeAgent {
    store: StoreClient,
    node_name: NodeName,
    is_coordinator: bool,
    sampler: Arc<dyn ResourceSampler>,
    health_checks: Vec<Arc<dyn HealthCheck>>,
    keepalive_interval: Duration,
}

impl NodeAgent {
    pub fn new(
        store: StoreClient,
        node_name: NodeName,
        is_coordinator: bool,
        sampler: Arc<dyn ResourceSampler>,
        health_checks: Vec<Arc<dyn HealthCheck>>,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            store,
            node_name,
            is_coordinator,
            sampler,
            health_checks,
            keepalive_interval,
        }
    }

    /// Reads static facts, ensures this node's record exists (creating
    /// it with defaults if not), and sets daemon-state=init (spec §4.2).
    /// Returns the session this agent's ephemeral state will be tied to.
    pub async fn startup(&self) -> Result<Session> {
        let session = self.store.begin_session().await;
        let path = node_path(&self.store, &self.node_name).await?;

        match self.store.get::<Node>(&path).await? {
            Some(_) => info!(node = %self.node_name, "existing node record found at startup"),
            None => {
                let node = Node::new_default(self.node_name.clone(), self.is_coordinator);
                self.store.cas(&path, None, &node).await?;
                info!(node = %self.node_name, "created node record with defaults");
            }
        }

        Ok(session)
    }

    /// Runs one keepalive tick (spec §4.2 steps 1-4). On the very first
    /// successful tick, transitions daemon-state init → run.
    pub async fn keepalive_tick(&self) -> Result<()> {
        let path = node_path(&self.store, &self.node_name).await?;
        let mut resources = self.sampler.sample().await;
        resources.round_load_average();

        let mut outcomes = Vec::with_capacity(self.health_checks.len());
        for check in &self.health_checks {
            outcomes.push((check.name().to_string(), check.check().await));
        }
        let health_score = outcomes
            .iter()
            .fold(100u8, |acc, (_, outcome)| acc.saturating_sub(outcome.health_delta));

        let current = self
            .store
            .get::<Node>(&path)
            .await?
            .ok_or_else(|| Error::NodeRecordMissing(self.node_name.clone()))?;

        let mut node = current.value;
        node.resources = resources;
        node.health_score = health_score;
        node.keepalive_counter = node.keepalive_counter.wrapping_add(1);
        node.keepalive_timestamp_ms = now_ms();
        if node.daemon_state == DaemonState::Init {
            node.daemon_state = DaemonState::Run;
        }

        self.store.cas(&path, Some(current.version), &node).await?;

        info!(
            node = %self.node_name,
            keepalive_counter = node.keepalive_counter,
            health_score,
            vm_count = node.resources.vm_count,
            free_memory_bytes = node.resources.free_memory_bytes,
            "keepalive tick complete"
        );

        Ok(())
    }

    /// Runs the keepalive loop until `shutdown` resolves, then
    /// transitions daemon-state → shutdown and ends the session (spec
    /// §4.2: "On graceful shutdown signal: → shutdown, close ephemeral
    /// session, exit").
    pub async fn run_until_shutdown(&self, session: Session, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut tick = interval(self.keepalive_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = self.keepalive_tick().await {
                        tracing::warn!(node = %self.node_name, error = %err, "keepalive tick failed");
                    }
                }
                _ = &mut shutdown => {
                    info!(node = %self.node_name, "shutdown signal received, ending session");
                    break;
                }
            }
        }

        if let Ok(path) = node_path(&self.store, &self.node_name).await {
            if let Ok(Some(current)) = self.store.get::<Node>(&path).await {
                let mut node = current.value;
                node.daemon_state = DaemonState::Shutdown;
                let _ = self.store.cas(&path, Some(current.version), &node).await;
            }
        }
        self.store.end_session(session).await;
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
