//! Configuration file support for the millbridge CLI.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MILLBRIDGE_*)
//! 3. Local config file (./millbridge.toml)
//! 4. Global config file (~/.config/millbridge/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Mock-server settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind the mock controller to.
    pub host: Option<String>,
    /// Port to bind the mock controller to.
    pub port: Option<u16>,
    /// Command catalog JSON path.
    pub commands: Option<PathBuf>,
    /// Seed virtual-files JSON path.
    pub files: Option<PathBuf>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Mock-server settings.
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("millbridge.toml")) {
            debug!("Loaded local config from millbridge.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Invalid config file {}: {e}", path.display());
                None
            }
        }
    }

    /// Path of the global config file, if a home directory exists.
    fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "millbridge")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Merge another config into this one (other wins where set).
    fn merge(&mut self, other: Self) {
        if other.server.host.is_some() {
            self.server.host = other.server.host;
        }
        if other.server.port.is_some() {
            self.server.port = other.server.port;
        }
        if other.server.commands.is_some() {
            self.server.commands = other.server.commands;
        }
        if other.server.files.is_some() {
            self.server.files = other.server.files;
        }
    }
}
