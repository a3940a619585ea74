//! Configuration management for the hyperfence node daemon.
//!
//! A single unified YAML file is loaded once at startup (spec §6); there
//! is no hot-reload and no multi-file merge. Environment variables with
//! a `HYPERFENCE_` prefix may override individual keys, which is useful
//! for container deployments that inject secrets (e.g. `fencing.ipmi_pass`)
//! without writing them to disk.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Top-level configuration recognized by the core (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub coordinators: Vec<String>,
    pub node: NodeSection,
    pub cluster: ClusterSection,
    pub fencing: FencingSection,
    pub timers: TimersSection,
    pub logging: LoggingSection,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinators: Vec::new(),
            node: NodeSection::default(),
            cluster: ClusterSection::default(),
            fencing: FencingSection::default(),
            timers: TimersSection::default(),
            logging: LoggingSection::default(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub hostname: String,
    pub subsystem_enable: SubsystemEnable,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            subsystem_enable: SubsystemEnable::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsystemEnable {
    pub storage: bool,
    pub networking: bool,
    pub api: bool,
}

impl Default for SubsystemEnable {
    fn default() -> Self {
        Self {
            storage: true,
            networking: true,
            api: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub networks: ClusterNetworks,
    pub bridge_mtu: u32,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            networks: ClusterNetworks::default(),
            bridge_mtu: 1500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterNetworks {
    pub upstream: String,
    pub cluster: String,
    pub storage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FencingSection {
    pub ipmi_hostname: String,
    pub ipmi_user: String,
    /// A reference/placeholder, never the literal secret in a checked-in
    /// file; the zero-valued key is the documented baseline (spec §6).
    pub ipmi_pass: String,
    pub intervals: FencingIntervals,
}

impl Default for FencingSection {
    fn default() -> Self {
        Self {
            ipmi_hostname: String::new(),
            ipmi_user: String::new(),
            ipmi_pass: String::new(),
            intervals: FencingIntervals::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FencingIntervals {
    pub keepalive_sec: u64,
    pub fence_retry_count: u32,
    pub fence_retry_delays: (u64, u64),
}

impl Default for FencingIntervals {
    fn default() -> Self {
        Self {
            keepalive_sec: 5,
            fence_retry_count: 6,
            fence_retry_delays: (1, 15),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersSection {
    pub vm_shutdown_timeout_sec: u64,
    pub migration_lock_timeout_sec: u64,
}

impl Default for TimersSection {
    fn default() -> Self {
        Self {
            vm_shutdown_timeout_sec: 180,
            migration_lock_timeout_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub file: Option<PathBuf>,
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            file: None,
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from the default search path (spec §6).
    pub fn load() -> anyhow::Result<Self> {
        ConfigLoader::new().load()
    }

    /// Loads configuration from an explicit path, bypassing search order.
    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        ConfigLoader::new().with_explicit_path(path).load()
    }
}
