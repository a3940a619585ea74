//! Orchestration loops that wire the coordination core together.
//!
//! Each concurrent activity named in spec §5 ("keepalive timer, watch
//! dispatcher, one worker per VM controller action in flight, one
//! worker per in-flight fence, migration handshake workers, primary-
//! election watcher") runs as its own task here, all sharing one cloned
//! [`StoreClient`] handle — cross-task coordination is entirely via the
//! store, exactly as spec §5 requires of cross-node coordination.

use crate::sampler::ZeroedResourceSampler;
use crate::tasks::{self, TaskRegistry};
use anyhow::{Context, Result};
use hyperfence_cluster::{DetectionOutcome, ElectionOutcome, FailureDetector, Fencer, NodeAgent, PrimaryElector, DEFAULT_N_MISS};
use hyperfence_config::Config;
use hyperfence_drivers::mock::{FakeHypervisor, FakeOob};
use hyperfence_drivers::PowerState;
use hyperfence_placement::{Candidate, Selector};
use hyperfence_store::{Session, StoreClient, Versioned};
use hyperfence_types::{DaemonState, Node, NodeName, Vm};
use hyperfence_vm::{MigrationEngine, ReconcileOutcome, VmInstanceController};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

async fn node_path(store: &StoreClient, name: &NodeName) -> Result<String> {
    Ok(store.resolve_path("node", name.as_str()).await?)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn resolve_node_name(config: &Config) -> NodeName {
    if config.node.hostname.is_empty() {
        warn!("node.hostname not set in config, defaulting to localhost");
        NodeName::new("localhost")
    } else {
        NodeName::new(config.node.hostname.clone())
    }
}

async fn list_peers(store: &StoreClient, self_name: &NodeName) -> Result<Vec<NodeName>> {
    let root = store.resolve_root("node").await?;
    let entries: Vec<(String, Versioned<Node>)> = store.list_prefix(&format!("{root}/")).await?;
    Ok(entries
        .into_iter()
        .map(|(_, v)| v.value.name)
        .filter(|name| name != self_name)
        .collect())
}

async fn build_candidates(store: &StoreClient) -> Result<Vec<Candidate>> {
    let root = store.resolve_root("node").await?;
    let entries: Vec<(String, Versioned<Node>)> = store.list_prefix(&format!("{root}/")).await?;
    Ok(entries
        .into_iter()
        .filter(|(_, v)| v.value.daemon_state.is_placement_candidate())
        .map(|(_, v)| Candidate {
            name: v.value.name.as_str().to_string(),
            free_memory_bytes: v.value.resources.free_memory_bytes,
            provisioned_memory_bytes: v.value.resources.provisioned_memory_bytes,
            vcpu_allocated: v.value.resources.vcpu_allocated,
            load_average: v.value.resources.load_average,
            running_vm_count: v.value.resources.vm_running_count,
        })
        .collect())
}

/// Runs the node daemon until a shutdown signal arrives (spec §4.2-§4.9).
pub async fn run(config: Config) -> Result<()> {
    let node_name = resolve_node_name(&config);
    let store = StoreClient::connect_baseline();
    let hypervisor = Arc::new(FakeHypervisor::new());
    let oob = Arc::new(FakeOob::new(PowerState::On));

    let keepalive_interval = Duration::from_secs(config.fencing.intervals.keepalive_sec.max(1));
    let is_coordinator = config.coordinators.iter().any(|c| c == node_name.as_str());

    let agent = NodeAgent::new(
        store.clone(),
        node_name.clone(),
        is_coordinator,
        Arc::new(ZeroedResourceSampler),
        hyperfence_cluster::default_health_checks(),
        keepalive_interval,
    );
    let session = agent.startup().await.context("node agent startup failed")?;

    let detector = FailureDetector::new(store.clone(), keepalive_interval, DEFAULT_N_MISS);
    let fencer = Fencer::new(store.clone(), oob, node_name.to_string()).with_retry_count(config.fencing.intervals.fence_retry_count).with_backoff(
        Duration::from_secs(config.fencing.intervals.fence_retry_delays.0),
        Duration::from_secs(config.fencing.intervals.fence_retry_delays.1),
    );
    let elector = PrimaryElector::new(store.clone(), node_name.clone(), vec![]);
    let vm_controller = VmInstanceController::new(store.clone(), node_name.clone(), hypervisor.clone())
        .with_shutdown_grace(Duration::from_secs(config.timers.vm_shutdown_timeout_sec));
    let migration_engine = MigrationEngine::new(store.clone(), node_name.clone(), hypervisor, node_name.to_string())
        .with_lock_timeout(Duration::from_secs(config.timers.migration_lock_timeout_sec));

    let detector_task = tokio::spawn(detector_loop(
        store.clone(),
        node_name.clone(),
        detector,
        fencer,
        session,
        keepalive_interval,
    ));
    let election_task = tokio::spawn(election_loop(elector, session, keepalive_interval));
    let vm_task = tokio::spawn(vm_loop(store.clone(), vm_controller, migration_engine, session, keepalive_interval));

    let (intent_tx, intent_rx) = tokio::sync::mpsc::channel(64);
    let task_registry = TaskRegistry::new();
    let worker_task = tokio::spawn(tasks::worker_loop(store.clone(), task_registry.clone(), intent_rx));
    // Held open for the lifetime of the process: whatever accepts operator
    // commands (REST API / CLI, out of scope here) would clone this sender.
    let _intent_tx = intent_tx;

    info!(node = %node_name, "hyperfenced started");
    agent.run_until_shutdown(session, shutdown_signal()).await;

    detector_task.abort();
    election_task.abort();
    vm_task.abort();
    worker_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn detector_loop(
    store: StoreClient,
    self_name: NodeName,
    detector: FailureDetector,
    fencer: Fencer<FakeOob>,
    session: Session,
    period: Duration,
) {
    let mut tick = tokio::time::interval(period);
    loop {
        tick.tick().await;
        let peers = match list_peers(&store, &self_name).await {
            Ok(peers) => peers,
            Err(err) => {
                warn!(error = %err, "failed to list peers for failure detection");
                continue;
            }
        };
        if peers.is_empty() {
            continue;
        }

        let now = now_ms();
        for (peer, outcome) in detector.sweep(&peers, now).await {
            match outcome {
                Ok(DetectionOutcome::DeclaredDead) => {
                    info!(peer = %peer, "declared dead, starting fence");
                    let candidates = match build_candidates(&store).await {
                        Ok(c) => c,
                        Err(err) => {
                            warn!(peer = %peer, error = %err, "failed to build placement candidates for fence recovery");
                            continue;
                        }
                    };
                    if let Err(err) = fencer.fence(&peer, &session, &candidates, Selector::Mem).await {
                        warn!(peer = %peer, error = %err, "fence attempt ended in error");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(peer = %peer, error = %err, "failure detection check errored"),
            }
        }
    }
}

async fn election_loop(elector: PrimaryElector, session: Session, period: Duration) {
    let mut tick = tokio::time::interval(period);
    loop {
        tick.tick().await;
        match elector.try_become_primary(&session).await {
            Ok(ElectionOutcome::WonPrimary) => info!("won primary election"),
            Ok(ElectionOutcome::AlreadyHeld) => {}
            Err(err) => warn!(error = %err, "primary election attempt errored"),
        }
    }
}

async fn vm_loop(
    store: StoreClient,
    controller: VmInstanceController<FakeHypervisor>,
    engine: MigrationEngine<FakeHypervisor>,
    session: Session,
    period: Duration,
) {
    let mut tick = tokio::time::interval(period);
    loop {
        tick.tick().await;
        let vms: Vec<(String, Versioned<Vm>)> = match store.resolve_root("domain").await {
            Ok(root) => match store.list_prefix(&format!("{root}/")).await {
                Ok(vms) => vms,
                Err(err) => {
                    warn!(error = %err, "failed to list vms for reconciliation");
                    continue;
                }
            },
            Err(err) => {
                warn!(error = %err, "failed to resolve domain schema field");
                continue;
            }
        };

        for (_, versioned) in vms {
            let vm_id = versioned.value.uuid;
            match controller.reconcile(vm_id).await {
                Ok(ReconcileOutcome::EnterMigration { is_move }) => {
                    if let Err(err) = engine.migrate(&session, vm_id, is_move).await {
                        warn!(vm = %vm_id, error = %err, "migration attempt errored");
                    }
                }
                Ok(ReconcileOutcome::EnterUnmigration) => {
                    if let Err(err) = engine.unmigrate(&session, vm_id).await {
                        warn!(vm = %vm_id, error = %err, "unmigrate attempt errored");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(vm = %vm_id, error = %err, "vm reconciliation errored"),
            }
        }
    }
}

/// `node flush` (spec §4.9). Operates against a freshly-connected store
/// handle since the in-process store does not persist across process
/// invocations; in a real deployment this would attach to the same
/// external store the running daemon uses.
pub async fn flush(config: Config) -> Result<()> {
    let node_name = resolve_node_name(&config);
    let store = StoreClient::connect_baseline();
    seed_self_as_run(&store, &node_name).await?;

    let controller = hyperfence_cluster::FlushController::new(store.clone(), node_name.clone());
    let candidates = build_candidates(&store).await?;
    let stranded = controller.flush(&candidates, Selector::Mem).await?;
    if stranded.is_empty() {
        info!(node = %node_name, "flush complete, all vms migrated");
    } else {
        warn!(node = %node_name, stranded = stranded.len(), "flush complete with stranded vms lacking a placement target");
    }
    Ok(())
}

/// `node ready` (spec §4.9 unflush).
pub async fn ready(config: Config) -> Result<()> {
    let node_name = resolve_node_name(&config);
    let store = StoreClient::connect_baseline();
    seed_self_as_run(&store, &node_name).await?;

    let controller = hyperfence_cluster::FlushController::new(store.clone(), node_name.clone());
    controller.unflush().await?;
    info!(node = %node_name, "node ready, unflush complete");
    Ok(())
}

async fn seed_self_as_run(store: &StoreClient, name: &NodeName) -> Result<()> {
    let path = node_path(store, name).await?;
    if store.get::<Node>(&path).await?.is_none() {
        let mut node = Node::new_default(name.clone(), false);
        node.daemon_state = DaemonState::Run;
        store.cas(&path, None, &node).await?;
    }
    Ok(())
}
