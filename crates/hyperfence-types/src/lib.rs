//! # hyperfence-types: core entity and id types
//!
//! Shared types used across the hyperfence cluster coordination core:
//! - Entity ids ([`NodeName`], [`VmId`])
//! - Node state ([`Node`], [`DaemonState`], [`Resources`], [`IpmiEndpoint`])
//! - VM state ([`Vm`], [`DesiredState`], [`ObservedState`], [`VmMeta`])
//! - Cluster-wide records ([`Fault`], [`Task`], [`Network`])
//!
//! These types carry no behavior beyond small accessors; the state
//! machines that act on them live in `hyperfence-vm` and
//! `hyperfence-cluster`.

mod cluster;
mod fault;
mod node;
mod task;
mod vm;

pub use cluster::{Cluster, CLUSTER_PATH};
pub use fault::{Fault, FaultId, Severity};
pub use node::{DaemonState, IpmiEndpoint, Node, Resources};
pub use task::{Task, TaskId, TaskKind, TaskStatus};
pub use vm::{DesiredState, DiskRef, DomainStats, MigrationMethod, NicRef, ObservedState, Vm, VmId, VmMeta};

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Stable hostname-derived identifier for a node.
///
/// Node names are the primary key for `/nodes/{name}/*` in the store
/// schema (spec §6) and never change for the lifetime of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NodeName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Declarative description of a client network (spec §3, Network entity).
///
/// Opaque-ish to the core: the bridge/VXLAN/BGP-EVPN programming that
/// realizes a network is out of scope (spec §1); only the fields the
/// core reads (for placement / DHCP floating-service wiring) live here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub vni_or_vlan: u32,
    pub kind: NetworkKind,
    pub subnet: String,
    pub gateway: String,
    pub dhcp_range: Option<(String, String)>,
    pub dhcp_reservations: Vec<DhcpReservation>,
    pub acls: Vec<String>,
}

/// A fixed IP handed to one MAC, carved out of [`Network::dhcp_range`]
/// (spec §3, Network entity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpReservation {
    pub mac: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    Managed,
    Bridged,
    Sriov,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_name_roundtrips_through_display() {
        let name = NodeName::from("hv-03");
        assert_eq!(name.as_str(), "hv-03");
        assert_eq!(name.to_string(), "hv-03");
    }

    #[test]
    fn node_name_equality_is_by_value() {
        assert_eq!(NodeName::new("a"), NodeName::new("a"));
        assert_ne!(NodeName::new("a"), NodeName::new("b"));
    }
}
