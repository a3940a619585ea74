//! Error types shared by the VM Instance Controller and Migration Engine.

use hyperfence_types::{NodeName, VmId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] hyperfence_store::StoreError),

    #[error("hypervisor driver error: {0}")]
    Driver(#[from] hyperfence_drivers::DriverError),

    #[error("vm {0} has no record in the store")]
    VmRecordMissing(VmId),

    #[error("vm {0} is not owned by this node; current-node is {1:?}")]
    NotOwner(VmId, Option<NodeName>),

    #[error("vm {0} has no migration target set")]
    NoMigrationTarget(VmId),

    #[error("migration preflight failed for vm {0}: {1}")]
    PreflightFailed(VmId, String),

    #[error("vm {0} is not eligible for unmigrate: {1}")]
    UnmigrateIneligible(VmId, String),
}

pub type Result<T> = std::result::Result<T, Error>;
