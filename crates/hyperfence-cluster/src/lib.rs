//! Cluster coordination core: node agent, failure detector, fencer,
//! primary elector, and flush controller (spec §4.2-§4.4, §4.8-§4.9).
//!
//! Each module wraps a [`hyperfence_store::StoreClient`] and implements
//! one piece of the coordination protocol. They are assembled into a
//! running node by `hyperfence-daemon`; this crate only owns the
//! algorithms and their unit-level behavior.

pub mod agent;
pub mod detector;
pub mod elector;
pub mod error;
pub mod fencer;
pub mod flush;
pub mod health_checks;

pub use agent::{HealthCheck, HealthCheckOutcome, NodeAgent, ResourceSampler};
pub use detector::{DetectionOutcome, FailureDetector, DEFAULT_N_MISS};
pub use elector::{ElectionOutcome, FloatingService, PrimaryElector};
pub use error::{Error, Result};
pub use fencer::{FenceOutcome, Fencer};
pub use flush::FlushController;
pub use health_checks::{default_health_checks, ProbeHealthCheck};
