//! Fault registry entries (spec §3, §6).

use serde::{Deserialize, Serialize};

/// Stable, de-duplicated fault identifier, e.g. `ipmi_unreachable` or
/// `vm_fail_start:{uuid}` (spec §6).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FaultId(String);

impl FaultId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FaultId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A persistent, de-duplicated health record (spec §3, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub id: FaultId,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub severity: Severity,
    pub ack: bool,
    pub message: String,
    /// Subtracted from 100 to compute health percentage (spec §6).
    pub health_delta: u8,
}

impl Fault {
    /// Computes health as `max(0, 100 - sum(unacked health_delta))`,
    /// clamped to `[0, 100]` (spec §6).
    pub fn health_percentage(faults: &[Fault]) -> u8 {
        let unacked_delta: u32 = faults
            .iter()
            .filter(|f| !f.ack)
            .map(|f| u32::from(f.health_delta))
            .sum();
        100u32.saturating_sub(unacked_delta).min(100) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(delta: u8, ack: bool) -> Fault {
        Fault {
            id: FaultId::new("x"),
            first_seen_ms: 0,
            last_seen_ms: 0,
            severity: Severity::Warning,
            ack,
            message: String::new(),
            health_delta: delta,
        }
    }

    #[test]
    fn health_percentage_sums_unacked_deltas() {
        let faults = vec![fault(30, false), fault(20, false), fault(50, true)];
        assert_eq!(Fault::health_percentage(&faults), 50);
    }

    #[test]
    fn health_percentage_floors_at_zero() {
        let faults = vec![fault(90, false), fault(90, false)];
        assert_eq!(Fault::health_percentage(&faults), 0);
    }

    #[test]
    fn health_percentage_is_100_with_no_faults() {
        assert_eq!(Fault::health_percentage(&[]), 100);
    }
}
