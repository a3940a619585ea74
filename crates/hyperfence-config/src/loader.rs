//! Single-file YAML configuration loader with environment override.

use crate::{Config, Paths};
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Loads the unified YAML config file (spec §6), falling back through
/// `/etc/hyperfence/config.yaml` and the XDG user config directory.
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            explicit_path: None,
            env_prefix: "HYPERFENCE".to_string(),
        }
    }

    pub fn with_explicit_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    fn resolve_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit_path {
            return Some(path.clone());
        }
        let system = Paths::system_config_file();
        if system.exists() {
            return Some(system);
        }
        Paths::new()
            .user_config_file()
            .ok()
            .filter(|p| p.exists())
    }

    /// Loads configuration: defaults, then the single YAML file (if
    /// found), then `HYPERFENCE_*` environment overrides.
    pub fn load(self) -> Result<Config> {
        let mut builder = config::Config::builder();
        builder = builder.add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = self.resolve_path() {
            builder = builder.add_source(
                config::File::from(path).required(false).format(config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let built = builder.build().context("failed to build configuration")?;
        let config: Config = built
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
