//! hyperfence-placement: the placement selector (spec §4.7, component C7).
//!
//! A pure function over the current live node set and a VM's placement
//! hints. No I/O, no locks — callers (the Fencer, the Flush Controller,
//! the VM Instance Controller) read the current node snapshot from the
//! store and pass it in.
//!
//! # Example
//!
//! ```
//! use hyperfence_placement::{select_target, Candidate, Selector};
//! use std::collections::BTreeSet;
//!
//! let candidates = vec![
//!     Candidate { name: "hv-01".into(), free_memory_bytes: 4_000_000_000, provisioned_memory_bytes: 1_000_000_000, vcpu_allocated: 4, load_average: 1.2, running_vm_count: 3 },
//!     Candidate { name: "hv-02".into(), free_memory_bytes: 8_000_000_000, provisioned_memory_bytes: 500_000_000, vcpu_allocated: 2, load_average: 0.4, running_vm_count: 1 },
//! ];
//!
//! let target = select_target(&candidates, Selector::Mem, &BTreeSet::new());
//! assert_eq!(target.unwrap(), "hv-02");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One of the candidate nodes a VM could be placed on (spec §4.7).
///
/// Built by the caller from the current `Node` snapshot; deliberately a
/// separate, smaller type so this crate never depends on the full
/// `hyperfence-cluster` store plumbing.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub free_memory_bytes: u64,
    pub provisioned_memory_bytes: u64,
    pub vcpu_allocated: u32,
    pub load_average: f64,
    pub running_vm_count: u32,
}

/// Selector policy (spec §4.7). Comparisons on the string form are
/// case-insensitive (`FromStr`/`parse_selector`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
    Mem,
    Memprov,
    Vcpus,
    Load,
    Vms,
    /// Apply the cluster default selector; resolved by the caller before
    /// calling [`select_target`] — this crate never reads cluster config.
    None,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown placement selector: {0}")]
pub struct UnknownSelector(String);

/// Parses a selector string case-insensitively (spec §4.7: "All
/// comparisons are case-insensitive on the selector string").
pub fn parse_selector(s: &str) -> Result<Selector, UnknownSelector> {
    match s.to_ascii_lowercase().as_str() {
        "mem" => Ok(Selector::Mem),
        "memprov" => Ok(Selector::Memprov),
        "vcpus" => Ok(Selector::Vcpus),
        "load" => Ok(Selector::Load),
        "vms" => Ok(Selector::Vms),
        "none" | "" => Ok(Selector::None),
        other => Err(UnknownSelector(other.to_string())),
    }
}

/// Selects a placement target (spec §4.7).
///
/// `node_limit` intersects the candidate set when non-empty. Returns
/// `None` if no candidate remains — callers surface this as task
/// failure reason `no_target` (spec B2).
pub fn select_target(
    candidates: &[Candidate],
    selector: Selector,
    node_limit: &BTreeSet<String>,
) -> Option<String> {
    let pool: Vec<&Candidate> = if node_limit.is_empty() {
        candidates.iter().collect()
    } else {
        candidates
            .iter()
            .filter(|c| node_limit.contains(&c.name))
            .collect()
    };

    if pool.is_empty() {
        return None;
    }

    let best = match selector {
        Selector::Mem | Selector::None => pool.into_iter().min_by(|a, b| {
            // Max free memory, ties broken by fewest running VMs.
            b.free_memory_bytes
                .cmp(&a.free_memory_bytes)
                .then(a.running_vm_count.cmp(&b.running_vm_count))
        }),
        Selector::Memprov => pool
            .into_iter()
            .min_by_key(|c| c.provisioned_memory_bytes),
        Selector::Vcpus => pool.into_iter().min_by_key(|c| c.vcpu_allocated),
        Selector::Load => pool
            .into_iter()
            .min_by(|a, b| a.load_average.total_cmp(&b.load_average)),
        Selector::Vms => pool.into_iter().min_by_key(|c| c.running_vm_count),
    };

    best.map(|c| c.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, free_mem: u64, prov_mem: u64, vcpus: u32, load: f64, vms: u32) -> Candidate {
        Candidate {
            name: name.to_string(),
            free_memory_bytes: free_mem,
            provisioned_memory_bytes: prov_mem,
            vcpu_allocated: vcpus,
            load_average: load,
            running_vm_count: vms,
        }
    }

    #[test]
    fn mem_selector_picks_max_free_memory() {
        let candidates = vec![
            candidate("a", 1_000, 0, 0, 0.0, 0),
            candidate("b", 5_000, 0, 0, 0.0, 0),
            candidate("c", 3_000, 0, 0, 0.0, 0),
        ];
        assert_eq!(
            select_target(&candidates, Selector::Mem, &BTreeSet::new()),
            Some("b".to_string())
        );
    }

    #[test]
    fn mem_selector_breaks_ties_on_fewest_running_vms() {
        let candidates = vec![
            candidate("a", 5_000, 0, 0, 0.0, 4),
            candidate("b", 5_000, 0, 0, 0.0, 1),
        ];
        assert_eq!(
            select_target(&candidates, Selector::Mem, &BTreeSet::new()),
            Some("b".to_string())
        );
    }

    #[test]
    fn memprov_selector_picks_min_provisioned() {
        let candidates = vec![
            candidate("a", 0, 9_000, 0, 0.0, 0),
            candidate("b", 0, 1_000, 0, 0.0, 0),
        ];
        assert_eq!(
            select_target(&candidates, Selector::Memprov, &BTreeSet::new()),
            Some("b".to_string())
        );
    }

    #[test]
    fn vcpus_selector_picks_min_allocated() {
        let candidates = vec![candidate("a", 0, 0, 8, 0.0, 0), candidate("b", 0, 0, 2, 0.0, 0)];
        assert_eq!(
            select_target(&candidates, Selector::Vcpus, &BTreeSet::new()),
            Some("b".to_string())
        );
    }

    #[test]
    fn load_selector_picks_lowest_load_average() {
        let candidates = vec![candidate("a", 0, 0, 0, 3.5, 0), candidate("b", 0, 0, 0, 0.2, 0)];
        assert_eq!(
            select_target(&candidates, Selector::Load, &BTreeSet::new()),
            Some("b".to_string())
        );
    }

    #[test]
    fn vms_selector_picks_fewest_running() {
        let candidates = vec![candidate("a", 0, 0, 0, 0.0, 9), candidate("b", 0, 0, 0, 0.0, 1)];
        assert_eq!(
            select_target(&candidates, Selector::Vms, &BTreeSet::new()),
            Some("b".to_string())
        );
    }

    #[test]
    fn node_limit_intersects_candidate_set() {
        let candidates = vec![
            candidate("a", 9_000, 0, 0, 0.0, 0),
            candidate("b", 1_000, 0, 0, 0.0, 0),
        ];
        let limit: BTreeSet<String> = ["b".to_string()].into_iter().collect();
        assert_eq!(
            select_target(&candidates, Selector::Mem, &limit),
            Some("b".to_string())
        );
    }

    #[test]
    fn empty_candidate_set_returns_none() {
        assert_eq!(select_target(&[], Selector::Mem, &BTreeSet::new()), None);
    }

    #[test]
    fn node_limit_with_no_matching_candidates_returns_none() {
        let candidates = vec![candidate("a", 9_000, 0, 0, 0.0, 0)];
        let limit: BTreeSet<String> = ["z".to_string()].into_iter().collect();
        assert_eq!(select_target(&candidates, Selector::Mem, &limit), None);
    }

    #[test]
    fn selector_parsing_is_case_insensitive() {
        assert_eq!(parse_selector("MEM"), Ok(Selector::Mem));
        assert_eq!(parse_selector("Load"), Ok(Selector::Load));
        assert_eq!(parse_selector("VcPuS"), Ok(Selector::Vcpus));
        assert_eq!(parse_selector(""), Ok(Selector::None));
        assert!(parse_selector("bogus").is_err());
    }

    use proptest::prelude::*;

    fn arb_candidate(name: &'static str) -> impl Strategy<Value = Candidate> {
        (0u64..100_000, 0u64..100_000, 0u32..64, 0.0f64..32.0, 0u32..64).prop_map(
            move |(free_mem, prov_mem, vcpus, load, vms)| candidate(name, free_mem, prov_mem, vcpus, load, vms),
        )
    }

    proptest! {
        /// Property: whatever `select_target` returns, for any selector
        /// and any non-empty `node_limit`, must name a candidate that
        /// was actually in the limited pool (spec §4.7: node_limit
        /// intersects the candidate set).
        #[test]
        fn prop_selected_target_is_always_from_the_limited_pool(
            a in arb_candidate("a"),
            b in arb_candidate("b"),
            c in arb_candidate("c"),
            selector in prop_oneof![
                Just(Selector::Mem),
                Just(Selector::Memprov),
                Just(Selector::Vcpus),
                Just(Selector::Load),
                Just(Selector::Vms),
                Just(Selector::None),
            ],
            limit_b in any::<bool>(),
            limit_c in any::<bool>(),
        ) {
            let candidates = vec![a, b, c];
            let mut limit = BTreeSet::new();
            if limit_b { limit.insert("b".to_string()); }
            if limit_c { limit.insert("c".to_string()); }

            let result = select_target(&candidates, selector, &limit);
            if let Some(name) = result {
                if !limit.is_empty() {
                    prop_assert!(limit.contains(&name));
                } else {
                    prop_assert!(candidates.iter().any(|cand| cand.name == name));
                }
            } else {
                prop_assert!(!limit.is_empty(), "an unconstrained, non-empty pool always yields a target");
            }
        }
    }
}
