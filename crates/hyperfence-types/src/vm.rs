//! VM (Domain) entity and its per-VM metadata (spec §3).

use crate::NodeName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Primary key for a managed guest; stable for the VM's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VmId(uuid::Uuid);

impl VmId {
    pub fn new(id: uuid::Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Desired state, written by external commands via the worker (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Start,
    Stop,
    Restart,
    Shutdown,
    Disable,
    Migrate,
    Unmigrate,
    Move,
    Provision,
}

/// Observed state, written exclusively by the VM's current-node controller
/// (spec §3, §4.5, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Start,
    Stop,
    Disable,
    Fail,
    Migrate,
    Shutdown,
    Provision,
    Restore,
    Import,
    Export,
}

/// How a migration should be carried out (spec §3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMethod {
    Live,
    Shutdown,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRef {
    pub pool: String,
    pub volume: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicRef {
    pub network_id: String,
    pub mac: String,
    pub model: String,
}

/// Per-VM policy and scheduling hints (spec §3, VM.meta).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMeta {
    pub node_limit: BTreeSet<NodeName>,
    pub node_selector: String,
    pub migration_method: MigrationMethod,
    pub autostart: bool,
    pub profile: Option<String>,
    pub tags: BTreeSet<String>,
}

impl Default for VmMeta {
    fn default() -> Self {
        Self {
            node_limit: BTreeSet::new(),
            node_selector: "none".to_string(),
            migration_method: MigrationMethod::Live,
            autostart: true,
            profile: None,
            tags: BTreeSet::new(),
        }
    }
}

/// Maximum number of lines kept in a VM's console-log ring (spec §3).
pub const CONSOLE_LOG_RING_CAPACITY: usize = 500;

/// Snapshot of a domain's runtime resource consumption, as last sampled
/// from the hypervisor driver (spec §3, §6 `stats`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainStats {
    pub cpu_time_ns: u64,
    pub memory_used_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

/// A managed guest (spec §3, VM/Domain entity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub uuid: VmId,
    pub name: String,
    pub desired_state: DesiredState,
    pub observed_state: ObservedState,
    pub current_node: Option<NodeName>,
    pub previous_node: Option<NodeName>,
    /// Host requested by an external `vm-migrate`/`vm-move` command while
    /// desired-state=*migrate*/*move*; read by the Migration Engine and
    /// cleared on commit or abort (spec §4.6).
    pub migration_target: Option<NodeName>,
    pub failure_count: u32,
    pub failure_reason: Option<String>,
    pub domain_blob: String,
    pub meta: VmMeta,
    pub disks: Vec<DiskRef>,
    pub nics: Vec<NicRef>,
    pub console_log: VecDeque<String>,
    pub provisioned_memory_bytes: u64,
    /// Last sampled runtime stats, refreshed each reconcile pass while
    /// the VM is observed running (spec §6 `stats`).
    pub runtime_stats: Option<DomainStats>,
    pub version: u64,
}

impl Vm {
    pub fn push_console_line(&mut self, line: String) {
        if self.console_log.len() >= CONSOLE_LOG_RING_CAPACITY {
            self.console_log.pop_front();
        }
        self.console_log.push_back(line);
    }

    /// Whether this VM is currently "owned" in the running sense that
    /// requires exactly one node to act on it (spec I2).
    pub fn is_running_observed(&self) -> bool {
        matches!(
            self.observed_state,
            ObservedState::Start | ObservedState::Migrate | ObservedState::Shutdown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            provisioned_memory_bytes: 2048 * 1024 * 1024,
            runtime_stats: None,
            version: 0,
        }
    }

    #[test]
    fn console_log_ring_is_bounded() {
        let mut vm = sample_vm();
        for i in 0..(CONSOLE_LOG_RING_CAPACITY + 10) {
            vm.push_console_line(format!("line {i}"));
        }
        assert_eq!(vm.console_log.len(), CONSOLE_LOG_RING_CAPACITY);
        assert_eq!(vm.console_log.front().unwrap(), "line 10");
    }

    #[test]
    fn running_observed_covers_start_migrate_shutdown_only() {
        let mut vm = sample_vm();
        for (state, expect) in [
            (ObservedState::Start, true),
            (ObservedState::Migrate, true),
            (ObservedState::Shutdown, true),
            (ObservedState::Stop, false),
            (ObservedState::Fail, false),
            (ObservedState::Disable, false),
        ] {
            vm.observed_state = state;
            assert_eq!(vm.is_running_observed(), expect, "{state:?}");
        }
    }
}
