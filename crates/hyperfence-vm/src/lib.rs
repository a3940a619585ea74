//! VM Instance Controller and Migration Engine (spec §4.5-§4.6,
//! components C5-C6).
//!
//! The instance controller reconciles one VM's observed-state toward
//! its desired-state; when it detects desired=migrate/move with a
//! foreign target, it hands off to the migration engine rather than
//! acting on the domain directly (spec §4.6: "Live migration is a
//! two-party handshake... coordinated through the VM's shared record").

pub mod error;
pub mod instance;
pub mod migration;

pub use error::{Error, Result};
pub use instance::{ReconcileOutcome, VmInstanceController};
pub use migration::{MigrationEngine, MigrationOutcome};
