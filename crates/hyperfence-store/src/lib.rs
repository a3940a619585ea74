//! hyperfence-store: the coordination store client (spec §4.1, component C1).
//!
//! A typed façade over a hierarchical, strongly-consistent key-value
//! store: atomic CAS writes, per-path watches, ephemeral session-bound
//! keys, and advisory locks with reentrancy and timeouts. The external
//! store itself is out of scope (spec §1 non-goals); [`memory::StoreClient`]
//! is an in-process stand-in that speaks the same contract.

pub mod error;
mod memory;
pub mod schema;
pub mod session;
pub mod watch;

pub use error::{StoreError, StoreResult};
pub use memory::{LockHandle, StoreClient, Versioned};
pub use schema::{SchemaMap, SchemaRegistry};
pub use session::{Session, SessionId};
pub use watch::{ChangeEvent, ChangeKind, WatchHandle};
