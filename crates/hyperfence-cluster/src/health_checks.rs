//! Built-in health-check plugins (spec §4.2 step 2: "IPMI reachability,
//! PSU redundancy, RAID, SMART, load ceiling, network link, database
//! reachability").
//!
//! Each plugin wraps an injectable, syscall-free probe closure so it is
//! unit-testable without real hardware. `hyperfence-daemon` wires
//! [`default_health_checks`] into the running `NodeAgent`; every probe
//! reports healthy until a real syscall/IPMI-backed probe replaces it,
//! the same stand-in role `hyperfence_drivers::mock` plays for the
//! hypervisor/IPMI boundary.

use crate::agent::{HealthCheck, HealthCheckOutcome};
use async_trait::async_trait;
use std::sync::Arc;

/// A health plugin backed by an injectable probe: `Ok(())` when
/// healthy, `Err((health_delta, message))` otherwise.
pub struct ProbeHealthCheck {
    name: &'static str,
    fault_id: &'static str,
    probe: Box<dyn Fn() -> std::result::Result<(), (u8, String)> + Send + Sync>,
}

impl ProbeHealthCheck {
    pub fn new(
        name: &'static str,
        fault_id: &'static str,
        probe: impl Fn() -> std::result::Result<(), (u8, String)> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            fault_id,
            probe: Box::new(probe),
        }
    }
}

#[async_trait]
impl HealthCheck for ProbeHealthCheck {
    fn name(&self) -> &str {
        self.name
    }

    async fn check(&self) -> HealthCheckOutcome {
        match (self.probe)() {
            Ok(()) => HealthCheckOutcome::ok(),
            Err((health_delta, message)) => HealthCheckOutcome {
                healthy: false,
                health_delta,
                fault_id: Some(self.fault_id.to_string()),
                message: Some(message),
            },
        }
    }
}

const PLUGINS: [(&str, &str); 7] = [
    ("ipmi-reachability", "ipmi-unreachable"),
    ("psu-redundancy", "psu-degraded"),
    ("raid-health", "raid-degraded"),
    ("smart-health", "smart-failure-predicted"),
    ("load-ceiling", "load-ceiling-exceeded"),
    ("network-link", "network-link-down"),
    ("db-reachability", "db-unreachable"),
];

/// Builds the seven plugins spec §4.2 step 2 names, each always-healthy
/// until wired to a real probe.
pub fn default_health_checks() -> Vec<Arc<dyn HealthCheck>> {
    PLUGINS
        .iter()
        .map(|(name, fault_id)| Arc::new(ProbeHealthCheck::new(name, fault_id, || Ok(()))) as Arc<dyn HealthCheck>)
        .collect()
}
