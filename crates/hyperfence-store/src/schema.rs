//! Logical-to-physical path mapping, versioned (spec §4.1, §6 schema root).
//!
//! The client keeps an in-memory map of `version -> {logical -> physical}`.
//! On startup it reads the store's declared schema version and loads the
//! matching map; an unrecognized version fails startup loudly rather than
//! guessing a layout.

use crate::error::{StoreError, StoreResult};
use std::collections::BTreeMap;

/// The logical field names this binary knows how to address, for one
/// schema version (spec §6: `/nodes/{name}/*`, `/domains/{uuid}/*`, ...).
#[derive(Debug, Clone, Default)]
pub struct SchemaMap {
    logical_to_physical: BTreeMap<String, String>,
}

impl SchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, logical: impl Into<String>, physical: impl Into<String>) -> Self {
        self.logical_to_physical.insert(logical.into(), physical.into());
        self
    }

    pub fn resolve(&self, logical: &str) -> StoreResult<&str> {
        self.logical_to_physical
            .get(logical)
            .map(String::as_str)
            .ok_or_else(|| StoreError::UnknownField(logical.to_string()))
    }
}

/// The full set of schema maps a binary was built with, keyed by version.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    maps: BTreeMap<u32, SchemaMap>,
}

impl SchemaRegistry {
    pub fn new(maps: BTreeMap<u32, SchemaMap>) -> Self {
        Self { maps }
    }

    /// The schema maps this binary was built to understand, reflecting
    /// the logical field groups of spec §6.
    pub fn baseline() -> Self {
        let v1 = SchemaMap::new()
            .with_field("schema.version", "/schema/version")
            .with_field("cluster", hyperfence_types::CLUSTER_PATH)
            .with_field("node", "/nodes")
            .with_field("domain", "/domains")
            .with_field("network", "/networks")
            .with_field("osd", "/osds")
            .with_field("pool", "/pools")
            .with_field("volume", "/volumes")
            .with_field("snapshot", "/snapshots")
            .with_field("lock", "/locks")
            .with_field("fault", "/faults")
            .with_field("task", "/tasks");
        let mut maps = BTreeMap::new();
        maps.insert(1, v1);
        Self::new(maps)
    }

    /// Loads the map matching `declared_version`. Fails loudly (spec
    /// §4.1) if the store's declared version is outside this binary's
    /// supported set, newer or older.
    pub fn resolve(&self, declared_version: u32) -> StoreResult<&SchemaMap> {
        self.maps
            .get(&declared_version)
            .ok_or_else(|| StoreError::SchemaVersionUnsupported {
                declared: declared_version,
                supported: self.maps.keys().copied().collect(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_resolves_known_logical_fields() {
        let registry = SchemaRegistry::baseline();
        let map = registry.resolve(1).unwrap();
        assert_eq!(map.resolve("node").unwrap(), "/nodes");
        assert_eq!(map.resolve("task").unwrap(), "/tasks");
    }

    #[test]
    fn unknown_schema_version_fails_loudly() {
        let registry = SchemaRegistry::baseline();
        assert!(matches!(
            registry.resolve(99),
            Err(StoreError::SchemaVersionUnsupported { declared: 99, .. })
        ));
    }

    #[test]
    fn unknown_logical_field_is_reported() {
        let registry = SchemaRegistry::baseline();
        let map = registry.resolve(1).unwrap();
        assert!(matches!(map.resolve("bogus"), Err(StoreError::UnknownField(_))));
    }
}
