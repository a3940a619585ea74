//! In-memory fakes of [`HypervisorDriver`] and [`OobManagement`].
//!
//! Used across this workspace's unit tests, and wired into
//! `hyperfence-daemon` as the default driver since a real libvirt/IPMI
//! client is infrastructure, not core logic (spec §1 Non-goals) — the
//! same stand-in role [`hyperfence_store::StoreClient`] plays for the
//! external coordination store.

use crate::{
    DeviceSpec, DomainRunState, DriverError, DriverResult, HypervisorDriver,
    MigrateTransport, OobEndpoint, OobError, OobManagement, PowerState,
};
use async_trait::async_trait;
use hyperfence_types::{DomainStats, VmId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Domain {
    blob: String,
    running: bool,
}

/// A fake hypervisor connection backed by a `HashMap`. `start`/`shutdown`
/// etc. fail exactly the way a real driver would on an undefined or
/// already-running domain, so controller tests exercise the same error
/// paths as production.
#[derive(Default)]
pub struct FakeHypervisor {
    domains: Mutex<HashMap<VmId, Domain>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HypervisorDriver for FakeHypervisor {
    async fn define(&self, uuid: VmId, blob: &str) -> DriverResult<()> {
        let mut domains = self.domains.lock().await;
        domains.insert(
            uuid,
            Domain {
                blob: blob.to_string(),
                running: false,
            },
        );
        Ok(())
    }

    async fn start(&self, uuid: VmId) -> DriverResult<()> {
        let mut domains = self.domains.lock().await;
        let domain = domains.get_mut(&uuid).ok_or(DriverError::NotDefined(uuid))?;
        if domain.running {
            return Err(DriverError::AlreadyRunning(uuid));
        }
        domain.running = true;
        Ok(())
    }

    async fn shutdown(&self, uuid: VmId, _timeout: Duration) -> DriverResult<()> {
        let mut domains = self.domains.lock().await;
        let domain = domains.get_mut(&uuid).ok_or(DriverError::NotDefined(uuid))?;
        if !domain.running {
            return Err(DriverError::NotRunning(uuid));
        }
        domain.running = false;
        Ok(())
    }

    async fn destroy(&self, uuid: VmId) -> DriverResult<()> {
        let mut domains = self.domains.lock().await;
        domains.remove(&uuid).ok_or(DriverError::NotDefined(uuid))?;
        Ok(())
    }

    async fn migrate(
        &self,
        uuid: VmId,
        _target_uri: &str,
        _transport: MigrateTransport,
    ) -> DriverResult<()> {
        let mut domains = self.domains.lock().await;
        let domain = domains.get_mut(&uuid).ok_or(DriverError::NotDefined(uuid))?;
        if !domain.running {
            return Err(DriverError::NotRunning(uuid));
        }
        Ok(())
    }

    async fn attach_device(&self, uuid: VmId, _spec: &DeviceSpec) -> DriverResult<()> {
        let domains = self.domains.lock().await;
        domains.get(&uuid).ok_or(DriverError::NotDefined(uuid))?;
        Ok(())
    }

    async fn detach_device(&self, uuid: VmId, _spec: &DeviceSpec) -> DriverResult<()> {
        let domains = self.domains.lock().await;
        domains.get(&uuid).ok_or(DriverError::NotDefined(uuid))?;
        Ok(())
    }

    async fn stats(&self, uuid: VmId) -> DriverResult<DomainStats> {
        let domains = self.domains.lock().await;
        domains.get(&uuid).ok_or(DriverError::NotDefined(uuid))?;
        Ok(DomainStats::default())
    }

    async fn list(&self) -> DriverResult<Vec<(VmId, DomainRunState)>> {
        let domains = self.domains.lock().await;
        Ok(domains
            .iter()
            .map(|(id, d)| {
                (
                    *id,
                    if d.running {
                        DomainRunState::Running
                    } else {
                        DomainRunState::Stopped
                    },
                )
            })
            .collect())
    }
}

/// A fake IPMI endpoint whose power state is set directly by the test,
/// simulating an asynchronous out-of-band device.
pub struct FakeOob {
    state: Mutex<PowerState>,
}

impl FakeOob {
    pub fn new(initial: PowerState) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }

    pub async fn set_state(&self, state: PowerState) {
        *self.state.lock().await = state;
    }
}

#[async_trait]
impl OobManagement for FakeOob {
    async fn power_status(&self, _endpoint: &OobEndpoint) -> DriverResult<PowerState> {
        Ok(*self.state.lock().await)
    }

    async fn power_off(&self, _endpoint: &OobEndpoint) -> Result<(), OobError> {
        *self.state.lock().await = PowerState::Off;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> OobEndpoint {
        OobEndpoint {
            host: "bmc.local".to_string(),
            user: "admin".to_string(),
            credential: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn define_then_start_then_destroy_roundtrips() {
        let hv = FakeHypervisor::new();
        let id = VmId::new(uuid::Uuid::nil());
        hv.define(id, "<domain/>").await.unwrap();
        hv.start(id).await.unwrap();
        assert_eq!(
            hv.list().await.unwrap(),
            vec![(id, DomainRunState::Running)]
        );
        hv.destroy(id).await.unwrap();
        assert!(hv.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_on_undefined_domain_fails() {
        let hv = FakeHypervisor::new();
        let id = VmId::new(uuid::Uuid::nil());
        assert_eq!(hv.start(id).await, Err(DriverError::NotDefined(id)));
    }

    #[tokio::test]
    async fn double_start_fails_already_running() {
        let hv = FakeHypervisor::new();
        let id = VmId::new(uuid::Uuid::nil());
        hv.define(id, "<domain/>").await.unwrap();
        hv.start(id).await.unwrap();
        assert_eq!(hv.start(id).await, Err(DriverError::AlreadyRunning(id)));
    }

    #[tokio::test]
    async fn fake_oob_power_off_is_observed_via_power_status() {
        let oob = FakeOob::new(PowerState::On);
        oob.power_off(&endpoint()).await.unwrap();
        assert_eq!(oob.power_status(&endpoint()).await.unwrap(), PowerState::Off);
    }
}
