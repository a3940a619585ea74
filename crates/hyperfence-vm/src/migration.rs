//! Migration Engine (spec §4.6, component C6).
//!
//! Live migration is a two-party handshake between the source's
//! controller and the target's controller, coordinated entirely through
//! the VM's shared record; the lock signals the target to begin the
//! receive side (spec §4.6 step 2). This module drives the source side
//! only — the target side is the ordinary VM Instance Controller
//! observing `observed=migrate` and declining to act (spec §4.6
//! Races: "only the receive side driven by the hypervisor migration
//! call instantiates it").

use crate::error::{Error, Result};
use hyperfence_drivers::{HypervisorDriver, MigrateTransport};
use hyperfence_store::StoreClient;
use hyperfence_types::{DaemonState, DesiredState, MigrationMethod, Node, NodeName, ObservedState, Vm, VmId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Migration free-memory headroom multiplier (spec §4.6 step 1: "≥ VM
/// provisioned memory × 1.05").
const MEMORY_HEADROOM: f64 = 1.05;

/// Lock timeout at daemon startup vs. steady-state (spec §4.6 step 2).
pub const LOCK_TIMEOUT_INIT: Duration = Duration::from_secs(60);
pub const LOCK_TIMEOUT_STEADY: Duration = Duration::from_secs(10);

async fn vm_path(store: &StoreClient, id: VmId) -> Result<String> {
    Ok(store.resolve_path("domain", &id.to_string()).await?)
}

async fn node_path(store: &StoreClient, name: &NodeName) -> Result<String> {
    Ok(store.resolve_path("node", name.as_str()).await?)
}

async fn vm_lock_path(store: &StoreClient, id: VmId) -> Result<String> {
    let root = store.resolve_root("lock").await?;
    Ok(format!("{root}/vm/{id}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Committed,
    Aborted,
}

pub struct MigrationEngine<D: HypervisorDriver> {
    store: StoreClient,
    self_node: NodeName,
    driver: Arc<D>,
    holder_id: String,
    lock_timeout: Duration,
}

impl<D: HypervisorDriver> MigrationEngine<D> {
    pub fn new(store: StoreClient, self_node: NodeName, driver: Arc<D>, holder_id: impl Into<String>) -> Self {
        Self {
            store,
            self_node,
            driver,
            holder_id: holder_id.into(),
            lock_timeout: LOCK_TIMEOUT_STEADY,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Drives the source side of a migration or move for `vm_id`, whose
    /// desired-state is already *migrate*/*move* and `migration_target`
    /// names the destination (spec §4.6).
    pub async fn migrate(&self, session: &hyperfence_store::Session, vm_id: VmId, is_move: bool) -> Result<MigrationOutcome> {
        let path = vm_path(&self.store, vm_id).await?;
        let current = self
            .store
            .get::<Vm>(&path)
            .await?
            .ok_or(Error::VmRecordMissing(vm_id))?;
        let vm = current.value;
        let target = vm.migration_target.clone().ok_or(Error::NoMigrationTarget(vm_id))?;

        if let Err(reason) = self.preflight(&vm, &target).await {
            self.abort(vm_id, &reason).await?;
            return Err(Error::PreflightFailed(vm_id, reason));
        }

        let lock_path = vm_lock_path(&self.store, vm_id).await?;
        let lock = self
            .store
            .lock(&lock_path, &self.holder_id, session, self.lock_timeout)
            .await?;

        let outcome = self.migrate_locked(vm_id, &target, is_move).await;
        self.store.release(lock).await;
        outcome
    }

    async fn preflight(&self, vm: &Vm, target: &NodeName) -> std::result::Result<(), String> {
        let node_path = node_path(&self.store, target).await.map_err(|e| e.to_string())?;
        let Some(target_node) = self.store.get::<Node>(&node_path).await.map_err(|e| e.to_string())? else {
            return Err(format!("target {target} has no node record"));
        };
        if target_node.value.daemon_state != DaemonState::Run {
            return Err(format!("target {target} is not in daemon-state run"));
        }
        let required = (vm.provisioned_memory_bytes as f64 * MEMORY_HEADROOM) as u64;
        if target_node.value.resources.free_memory_bytes < required {
            return Err(format!(
                "target {target} has insufficient free memory: {} < {required}",
                target_node.value.resources.free_memory_bytes
            ));
        }
        if !vm.meta.node_limit.is_empty() && !vm.meta.node_limit.contains(target) {
            return Err(format!("target {target} is excluded by node-limit"));
        }
        Ok(())
    }

    async fn migrate_locked(&self, vm_id: VmId, target: &NodeName, is_move: bool) -> Result<MigrationOutcome> {
        let path = vm_path(&self.store, vm_id).await?;
        let current = self
            .store
            .get::<Vm>(&path)
            .await?
            .ok_or(Error::VmRecordMissing(vm_id))?;
        let mut vm = current.value;
        let mut version = current.version;

        vm.observed_state = ObservedState::Migrate;
        self.store.cas(&path, Some(version), &vm).await.map(|v| version = v)?;

        let transport = match vm.meta.migration_method {
            MigrationMethod::Live => MigrateTransport::Live,
            MigrationMethod::Shutdown | MigrationMethod::None => MigrateTransport::ShutdownAndStart,
        };
        let target_uri = format!("qemu+tls://{target}/system");

        match self.driver.migrate(vm_id, &target_uri, transport).await {
            Ok(()) => {
                vm.previous_node = if is_move { None } else { Some(self.self_node.clone()) };
                vm.current_node = Some(target.clone());
                vm.migration_target = None;
                vm.desired_state = DesiredState::Start;
                vm.observed_state = ObservedState::Start;
                self.store.cas(&path, Some(version), &vm).await?;
                info!(vm = %vm_id, target = %target, "migration committed");
                Ok(MigrationOutcome::Committed)
            }
            Err(err) => {
                warn!(vm = %vm_id, error = %err, "hypervisor migration call failed, rolling back");
                vm.observed_state = ObservedState::Start;
                vm.current_node = Some(self.self_node.clone());
                vm.migration_target = None;
                vm.desired_state = DesiredState::Start;
                vm.failure_reason = Some(err.to_string());
                self.store.cas(&path, Some(version), &vm).await?;
                Ok(MigrationOutcome::Aborted)
            }
        }
    }

    async fn abort(&self, vm_id: VmId, reason: &str) -> Result<()> {
        let path = vm_path(&self.store, vm_id).await?;
        let current = self
            .store
            .get::<Vm>(&path)
            .await?
            .ok_or(Error::VmRecordMissing(vm_id))?;
        let mut vm = current.value;
        vm.desired_state = DesiredState::Start;
        vm.observed_state = ObservedState::Start;
        vm.migration_target = None;
        vm.failure_reason = Some(reason.to_string());
        self.store.cas(&path, Some(current.version), &vm).await?;
        Ok(())
    }

    /// Reverses the previous/current pair using the retained
    /// previous-node (spec §4.6: "Unmigrate reverses the previous/
    /// current pair"). Fails if previous-node is no longer *run*.
    pub async fn unmigrate(&self, session: &hyperfence_store::Session, vm_id: VmId) -> Result<MigrationOutcome> {
        let path = vm_path(&self.store, vm_id).await?;
        let current = self
            .store
            .get::<Vm>(&path)
            .await?
            .ok_or(Error::VmRecordMissing(vm_id))?;
        let mut vm = current.value;

        let Some(previous) = vm.previous_node.clone() else {
            return Err(Error::UnmigrateIneligible(vm_id, "no previous-node recorded".to_string()));
        };
        let previous_path = node_path(&self.store, &previous).await?;
        let previous_node_record = self.store.get::<Node>(&previous_path).await?;
        if !matches!(previous_node_record, Some(ref n) if n.value.daemon_state == DaemonState::Run) {
            return Err(Error::UnmigrateIneligible(vm_id, format!("{previous} is not in daemon-state run")));
        }

        vm.migration_target = Some(previous);
        vm.desired_state = DesiredState::Migrate;
        self.store.cas(&path, Some(current.version), &vm).await?;

        self.migrate(session, vm_id, false).await
    }
}
