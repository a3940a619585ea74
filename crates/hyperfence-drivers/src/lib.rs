//! hyperfence-drivers: hypervisor and out-of-band management contracts.
//!
//! Spec §6 names these as external collaborators the core calls through
//! synchronous, bounded-timeout operations. We express "synchronous with
//! a bounded timeout" as an async trait method the caller wraps in
//! `tokio::time::timeout` (spec §5: "every hypervisor migration call...
//! is a suspension point").
//!
//! This crate ships no real libvirt/IPMI client — that is infrastructure,
//! not core logic — only the trait contract and an in-memory fake used
//! by the rest of the workspace's tests ([`mock`]).

pub mod mock;

use async_trait::async_trait;
use hyperfence_types::{DiskRef, DomainStats, NicRef, VmId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A device to attach/detach from a running or defined domain (spec §6,
/// §4.5 "hot attach/detach").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSpec {
    Nic(NicRef),
    Disk(DiskRef),
}

/// How the hypervisor should carry out a live migration (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateTransport {
    Live,
    ShutdownAndStart,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("domain {0} not defined")]
    NotDefined(VmId),
    #[error("domain {0} already running")]
    AlreadyRunning(VmId),
    #[error("domain {0} not running")]
    NotRunning(VmId),
    #[error("hypervisor operation on {0} timed out")]
    Timeout(VmId),
    #[error("hypervisor reported inconsistent state for {0}: {1}")]
    Inconsistent(VmId, String),
    #[error("device operation failed: {0}")]
    Device(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Whether a domain is currently running, as reported by the hypervisor
/// (used to distinguish "defined but stopped" from "unknown/undefined").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainRunState {
    Running,
    Stopped,
}

/// The external virtualization driver contract (spec §6).
///
/// The local hypervisor connection is shared across all VM controllers on
/// a node; callers are responsible for serializing access through a
/// small connection pool (spec §5: "default concurrency 3") — this trait
/// itself makes no concurrency guarantee beyond per-call atomicity.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    async fn define(&self, uuid: VmId, blob: &str) -> DriverResult<()>;
    async fn start(&self, uuid: VmId) -> DriverResult<()>;
    async fn shutdown(&self, uuid: VmId, timeout: Duration) -> DriverResult<()>;
    async fn destroy(&self, uuid: VmId) -> DriverResult<()>;
    async fn migrate(
        &self,
        uuid: VmId,
        target_uri: &str,
        transport: MigrateTransport,
    ) -> DriverResult<()>;
    async fn attach_device(&self, uuid: VmId, spec: &DeviceSpec) -> DriverResult<()>;
    async fn detach_device(&self, uuid: VmId, spec: &DeviceSpec) -> DriverResult<()>;
    async fn stats(&self, uuid: VmId) -> DriverResult<DomainStats>;
    async fn list(&self) -> DriverResult<Vec<(VmId, DomainRunState)>>;
}

/// Power state reported by out-of-band management (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OobError {
    #[error("out-of-band endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("out-of-band command rejected: {0}")]
    Rejected(String),
}

/// Out-of-band management contract used by the Fencer (spec §4.4, §6).
///
/// `power_off` must use a true power-off, never a reset, "for maximum
/// certainty of state" (spec §4.4 step 2).
#[async_trait]
pub trait OobManagement: Send + Sync {
    async fn power_status(&self, endpoint: &OobEndpoint) -> DriverResult<PowerState>;
    async fn power_off(&self, endpoint: &OobEndpoint) -> Result<(), OobError>;
}

/// A resolved out-of-band management endpoint — the credential has
/// already been read from the `Node` record by the caller (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OobEndpoint {
    pub host: String,
    pub user: String,
    pub credential: String,
}
