//! Error types shared by the node agent, detector, fencer, elector, and
//! flush controller.

use hyperfence_types::{NodeName, VmId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] hyperfence_store::StoreError),

    #[error("hypervisor driver error: {0}")]
    Driver(#[from] hyperfence_drivers::DriverError),

    #[error("out-of-band management error: {0}")]
    Oob(#[from] hyperfence_drivers::OobError),

    #[error("node {0} has no recorded IPMI endpoint; cannot fence")]
    NoIpmiEndpoint(NodeName),

    #[error("fencing {0} exhausted {1} retries without a confirmed power-off")]
    FenceExhausted(NodeName, u32),

    #[error("no placement target available for vm {0}")]
    NoPlacementTarget(VmId),

    #[error("vm {0} is not eligible for migration: {1}")]
    MigrationPreflightFailed(VmId, String),

    #[error("node {0} is not registered as a coordinator")]
    NotACoordinator(NodeName),

    #[error("node {0} has no record in the store; startup() must run first")]
    NodeRecordMissing(NodeName),
}

pub type Result<T> = std::result::Result<T, Error>;
