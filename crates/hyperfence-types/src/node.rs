//! Node entity (spec §3).

use crate::NodeName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Daemon lifecycle state of a node (spec §3, §4.2, §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Init,
    Run,
    Shutdown,
    Dead,
    Fenced,
    Flushed,
    Flushing,
    Unflushing,
}

impl DaemonState {
    /// Whether a node in this state is a valid placement candidate
    /// (spec §4.7: "daemon-state=*run* ∩ not in maintenance").
    pub fn is_placement_candidate(self) -> bool {
        matches!(self, DaemonState::Run)
    }
}

/// Out-of-band management endpoint used by the Fencer (spec §4.4, §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpmiEndpoint {
    pub host: String,
    pub user: String,
    /// Reference to a credential (e.g. a secret store key), never the
    /// credential itself — the core never persists plaintext secrets.
    pub credential_ref: String,
}

/// Telemetry a node reports about itself each keepalive tick (spec §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub free_memory_bytes: u64,
    pub provisioned_memory_bytes: u64,
    pub load_average: f64,
    pub vm_count: u32,
    pub vm_running_count: u32,
    pub osd_count: u32,
    pub vcpu_allocated: u32,
}

impl Resources {
    pub fn zeroed() -> Self {
        Self {
            free_memory_bytes: 0,
            provisioned_memory_bytes: 0,
            load_average: 0.0,
            vm_count: 0,
            vm_running_count: 0,
            osd_count: 0,
            vcpu_allocated: 0,
        }
    }

    /// Rounds the load average to 2 decimals, as required by spec §4.2 step 1.
    pub fn round_load_average(&mut self) {
        self.load_average = (self.load_average * 100.0).round() / 100.0;
    }
}

/// A physical hypervisor host (spec §3, Node entity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    pub static_cpu_count: u32,
    pub static_kernel: String,
    pub static_arch: String,
    pub daemon_state: DaemonState,
    pub domain_state: BTreeSet<crate::VmId>,
    pub resources: Resources,
    /// Unix millis of the last keepalive write (spec §4.3).
    pub keepalive_timestamp_ms: i64,
    pub keepalive_counter: u64,
    pub is_coordinator: bool,
    pub health_score: u8,
    pub active_faults: Vec<crate::FaultId>,
    pub ipmi: Option<IpmiEndpoint>,
}

impl Node {
    /// Creates a freshly-registered node record (spec §4.2: "ensures a
    /// Node record exists... creates with defaults if not").
    pub fn new_default(name: NodeName, is_coordinator: bool) -> Self {
        Self {
            name,
            static_cpu_count: 0,
            static_kernel: String::new(),
            static_arch: String::new(),
            daemon_state: DaemonState::Init,
            domain_state: BTreeSet::new(),
            resources: Resources::zeroed(),
            keepalive_timestamp_ms: 0,
            keepalive_counter: 0,
            is_coordinator,
            health_score: 100,
            active_faults: Vec::new(),
            ipmi: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_node_starts_in_init_with_full_health() {
        let node = Node::new_default(NodeName::new("hv-01"), false);
        assert_eq!(node.daemon_state, DaemonState::Init);
        assert_eq!(node.health_score, 100);
        assert!(node.domain_state.is_empty());
    }

    #[test]
    fn only_run_state_is_a_placement_candidate() {
        for state in [
            DaemonState::Init,
            DaemonState::Shutdown,
            DaemonState::Dead,
            DaemonState::Fenced,
            DaemonState::Flushed,
            DaemonState::Flushing,
            DaemonState::Unflushing,
        ] {
            assert!(!state.is_placement_candidate(), "{state:?} should not be a candidate");
        }
        assert!(DaemonState::Run.is_placement_candidate());
    }

    #[test]
    fn load_average_rounds_to_two_decimals() {
        let mut r = Resources::zeroed();
        r.load_average = 1.23456;
        r.round_load_average();
        assert_eq!(r.load_average, 1.23);
    }
}
