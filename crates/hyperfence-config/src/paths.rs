//! Default config file discovery.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::PathBuf;

/// Default locations the daemon looks for its config file, in order.
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("io", "hyperfence", "hyperfence"),
        }
    }

    /// `~/.config/hyperfence/config.yaml`
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().join("config.yaml"))
            .ok_or_else(|| {
                ConfigError::XdgError("failed to determine user config directory".to_string())
            })
    }

    /// `/etc/hyperfence/config.yaml`, the system-wide default (spec §6).
    pub fn system_config_file() -> PathBuf {
        PathBuf::from("/etc/hyperfence/config.yaml")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_config_file_is_under_etc() {
        assert_eq!(
            Paths::system_config_file(),
            PathBuf::from("/etc/hyperfence/config.yaml")
        );
    }

    #[test]
    fn user_config_file_is_under_xdg_config_dir() {
        let paths = Paths::new();
        if let Ok(path) = paths.user_config_file() {
            assert!(path.to_string_lossy().contains("hyperfence"));
            assert_eq!(path.file_name().unwrap(), "config.yaml");
        }
    }
}
