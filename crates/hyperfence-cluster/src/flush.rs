//! Flush Controller (spec §4.9, component C9).
//!
//! `node flush` drains this node's running VMs onto other hosts for
//! maintenance; `node ready` brings it back and restarts what it
//! previously hosted. The node is ineligible for placement throughout
//! (spec §4.7: "daemon-state=*run* ∩ not in maintenance").

use crate::error::Result;
use hyperfence_placement::{select_target, Candidate, Selector};
use hyperfence_store::StoreClient;
use hyperfence_types::{DaemonState, DesiredState, Node, NodeName, ObservedState, Vm, VmId};
use std::time::Duration;
use tracing::{info, warn};

/// How often `flush` re-reads a dispatched VM's record while waiting
/// for its migration to land (spec §4.9: "wait until all VMs have
/// migrated or failed").
const MIGRATION_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Upper bound on polls per VM before giving up and counting it
/// stranded rather than waiting forever for a migration that never
/// clears `migration_target`.
const MIGRATION_POLL_ATTEMPTS: u32 = 200;

async fn node_path(store: &StoreClient, name: &NodeName) -> Result<String> {
    Ok(store.resolve_path("node", name.as_str()).await?)
}

async fn vm_path(store: &StoreClient, id: VmId) -> Result<String> {
    Ok(store.resolve_path("domain", &id.to_string()).await?)
}

pub struct FlushController {
    store: StoreClient,
    node_name: NodeName,
}

impl FlushController {
    pub fn new(store: StoreClient, node_name: NodeName) -> Self {
        Self { store, node_name }
    }

    async fn set_daemon_state(&self, state: DaemonState) -> Result<()> {
        let path = node_path(&self.store, &self.node_name).await?;
        let current = self.store.get::<Node>(&path).await?;
        if let Some(current) = current {
            let mut node = current.value;
            node.daemon_state = state;
            self.store.cas(&path, Some(current.version), &node).await?;
        }
        Ok(())
    }

    /// Drains all VMs this node currently hosts in observed=*start* onto
    /// other live nodes (spec §4.9). Blocks until every dispatched VM
    /// has either migrated away or failed before marking this node
    /// *flushed*. Returns the VMs for which no migration target could
    /// be found, or whose migration never landed.
    pub async fn flush(&self, candidates: &[Candidate], selector: Selector) -> Result<Vec<VmId>> {
        self.set_daemon_state(DaemonState::Flushing).await?;

        let root = self.store.resolve_root("domain").await?;
        let all_vms: Vec<(String, hyperfence_store::Versioned<Vm>)> =
            self.store.list_prefix(&format!("{root}/")).await?;
        let mut dispatched = Vec::new();
        let mut stranded = Vec::new();

        for (path, versioned) in all_vms {
            let mut vm = versioned.value;
            if vm.current_node.as_ref() != Some(&self.node_name) || vm.observed_state != ObservedState::Start {
                continue;
            }

            let node_limit = vm
                .meta
                .node_limit
                .iter()
                .map(|n| n.as_str().to_string())
                .collect();
            match select_target(candidates, selector, &node_limit) {
                Some(migration_target) => {
                    vm.desired_state = DesiredState::Migrate;
                    vm.migration_target = Some(NodeName::new(migration_target.clone()));
                    self.store.cas(&path, Some(versioned.version), &vm).await?;
                    info!(vm = %vm.uuid, to = %migration_target, "flush requested migration");
                    dispatched.push(vm.uuid);
                }
                None => {
                    stranded.push(vm.uuid);
                }
            }
        }

        for vm_id in dispatched {
            if !self.await_migration_settled(vm_id).await {
                stranded.push(vm_id);
            }
        }

        self.set_daemon_state(DaemonState::Flushed).await?;
        Ok(stranded)
    }

    /// Polls a dispatched VM's record until its migration clears
    /// (`migration_target` returns to `None`), then reports whether it
    /// actually left this node. Returns `false` on timeout or if the
    /// migration rolled back and the VM is still here.
    async fn await_migration_settled(&self, vm_id: VmId) -> bool {
        let path = match vm_path(&self.store, vm_id).await {
            Ok(path) => path,
            Err(err) => {
                warn!(vm = %vm_id, error = %err, "could not resolve vm path while awaiting migration");
                return false;
            }
        };

        for _ in 0..MIGRATION_POLL_ATTEMPTS {
            match self.store.get::<Vm>(&path).await {
                Ok(Some(versioned)) if versioned.value.migration_target.is_none() => {
                    return versioned.value.current_node.as_ref() != Some(&self.node_name);
                }
                Ok(Some(_)) => tokio::time::sleep(MIGRATION_POLL_INTERVAL).await,
                Ok(None) => return true,
                Err(err) => {
                    warn!(vm = %vm_id, error = %err, "error reading vm record while awaiting migration");
                    return false;
                }
            }
        }
        warn!(vm = %vm_id, "migration did not settle within the flush wait budget, counting as stranded");
        false
    }

    /// Restarts VMs this node previously hosted, by migrating them back
    /// (spec §4.9: "restart any VMs whose previous-node=self and
    /// autostart=true by setting desired=migrate back").
    pub async fn unflush(&self) -> Result<()> {
        self.set_daemon_state(DaemonState::Unflushing).await?;

        let root = self.store.resolve_root("domain").await?;
        let all_vms: Vec<(String, hyperfence_store::Versioned<Vm>)> =
            self.store.list_prefix(&format!("{root}/")).await?;
        for (path, versioned) in all_vms {
            let mut vm = versioned.value;
            if vm.previous_node.as_ref() == Some(&self.node_name) && vm.meta.autostart {
                vm.desired_state = DesiredState::Migrate;
                vm.migration_target = Some(self.node_name.clone());
                self.store.cas(&path, Some(versioned.version), &vm).await?;
                info!(vm = %vm.uuid, "unflush requested migration back");
            }
        }

        self.set_daemon_state(DaemonState::Run).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperfence_types::VmMeta;
    use std::collections::VecDeque;

    fn candidate(name: &str) -> Candidate {
        Candidate {
            name: name.to_string(),
            free_memory_bytes: 8_000_000_000,
            provisioned_memory_bytes: 0,
            vcpu_allocated: 0,
            load_average: 0.0,
            running_vm_count: 0,
        }
    }

    fn sample_vm(node: &str) -> Vm {
        Vm {
            uuid: VmId::new(uuid::Uuid::nil()),
            name: "web-01".to_string(),
            desired_state: DesiredState::Start,
            observed_state: ObservedState::Start,
            current_node: Some(NodeName::new(node)),
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

    #[tokio::test]
    async fn flush_migrates_running_vms_and_marks_node_flushed() {
        let store = StoreClient::connect_baseline();
        let node_path_str = node_path(&store, &NodeName::new("hv-01")).await.unwrap();
        store
            .cas(&node_path_str, None, &Node::new_default(NodeName::new("hv-01"), false))
            .await
            .unwrap();
        let vm = sample_vm("hv-01");
        let vm_path_str = vm_path(&store, vm.uuid).await.unwrap();
        store.cas(&vm_path_str, None, &vm).await.unwrap();

        // Nothing else in this test drives the migration engine, so fake
        // its eventual completion: once flush dispatches the migration,
        // clear migration_target and move current_node to the target.
        let store_clone = store.clone();
        let settle_path = vm_path_str.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let Some(current) = store_clone.get::<Vm>(&settle_path).await.unwrap() else {
                    continue;
                };
                if current.value.migration_target.is_some() {
                    let mut settled = current.value;
                    settled.current_node = settled.migration_target.take();
                    let _ = store_clone.cas(&settle_path, Some(current.version), &settled).await;
                    break;
                }
            }
        });

        let controller = FlushController::new(store.clone(), NodeName::new("hv-01"));
        let stranded = controller.flush(&[candidate("hv-02")], Selector::Mem).await.unwrap();
        assert!(stranded.is_empty());

        let node: Node = store.get(&node_path_str).await.unwrap().unwrap().value;
        assert_eq!(node.daemon_state, DaemonState::Flushed);

        let updated: Vm = store.get(&vm_path_str).await.unwrap().unwrap().value;
        assert_eq!(updated.current_node, Some(NodeName::new("hv-02")));
    }

    #[tokio::test]
    async fn flush_with_no_candidates_reports_stranded_vm() {
        let store = StoreClient::connect_baseline();
        let node_path_str = node_path(&store, &NodeName::new("hv-01")).await.unwrap();
        store
            .cas(&node_path_str, None, &Node::new_default(NodeName::new("hv-01"), false))
            .await
            .unwrap();
        let vm = sample_vm("hv-01");
        let vm_id = vm.uuid;
        let vm_path_str = vm_path(&store, vm_id).await.unwrap();
        store.cas(&vm_path_str, None, &vm).await.unwrap();

        let controller = FlushController::new(store.clone(), NodeName::new("hv-01"));
        let stranded = controller.flush(&[], Selector::Mem).await.unwrap();
        assert_eq!(stranded, vec![vm_id]);
    }

    #[tokio::test]
    async fn unflush_migrates_back_vms_with_matching_previous_node() {
        let store = StoreClient::connect_baseline();
        let node_path_str = node_path(&store, &NodeName::new("hv-01")).await.unwrap();
        store
            .cas(&node_path_str, None, &Node::new_default(NodeName::new("hv-01"), false))
            .await
            .unwrap();
        let mut vm = sample_vm("hv-02");
        vm.previous_node = Some(NodeName::new("hv-01"));
        vm.meta.autostart = true;
        let vm_path_str = vm_path(&store, vm.uuid).await.unwrap();
        store.cas(&vm_path_str, None, &vm).await.unwrap();

        let controller = FlushController::new(store.clone(), NodeName::new("hv-01"));
        controller.unflush().await.unwrap();

        let node: Node = store.get(&node_path_str).await.unwrap().unwrap().value;
        assert_eq!(node.daemon_state, DaemonState::Run);

        let updated: Vm = store.get(&vm_path_str).await.unwrap().unwrap().value;
        assert_eq!(updated.desired_state, DesiredState::Migrate);
    }
}
