//! Cluster singleton entity (spec §3).

use crate::FaultId;
use serde::{Deserialize, Serialize};

/// Store path the Cluster singleton is kept at.
pub const CLUSTER_PATH: &str = "/cluster";

/// Cluster-wide singleton record (spec §3: "Cluster: singleton.
/// Attributes: schema version, maintenance flag, primary-node
/// identifier..., upstream/cluster/storage network parameters..., fault
/// registry").
///
/// The primary-node identifier itself is tracked as its own ephemeral
/// key by [`crate::Node`]'s elector rather than duplicated here (spec
/// §4.8); this record carries the attributes that are not
/// session-scoped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub schema_version: u32,
    /// I7: when set, the Fencer must not act cluster-wide, though
    /// failure detection still records events.
    pub maintenance: bool,
    pub upstream_network: String,
    pub cluster_network: String,
    pub storage_network: String,
    pub bridge_mtu: u32,
    pub fault_registry: Vec<FaultId>,
}

impl Cluster {
    pub fn new_default(schema_version: u32) -> Self {
        Self {
            schema_version,
            maintenance: false,
            upstream_network: String::new(),
            cluster_network: String::new(),
            storage_network: String::new(),
            bridge_mtu: 1500,
            fault_registry: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cluster_has_maintenance_off() {
        let cluster = Cluster::new_default(1);
        assert!(!cluster.maintenance);
    }
}
