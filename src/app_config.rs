//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file. Without one, every setting
//! takes its default.

use thiserror::Error;
use tracing::debug;

use std::path::{Path, PathBuf};

use fhcache::LruConfig;
use serde::{Deserialize, Serialize};

/// Shape of the synthetic workload driven by `fhcache soak`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SimConfig {
    /// Directories created under the simulated root.
    pub dirs: usize,

    /// Files created in every directory.
    pub files_per_dir: usize,

    /// Concurrent workers issuing cache operations.
    pub workers: usize,

    /// How long the workload runs.
    pub seconds: u64,

    /// Artificial latency added to every backend call, in microseconds.
    pub latency_us: u64,

    /// How often cache statistics are logged while the workload runs.
    pub stats_interval_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dirs: 64,
            files_per_dir: 512,
            workers: 8,
            seconds: 10,
            latency_us: 0,
            stats_interval_ms: 1_000,
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Engine tuning.
    #[serde(default)]
    pub cache: LruConfig,

    /// Soak workload.
    #[serde(default)]
    pub sim: SimConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing every validation error message otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = self.cache.validate().err().unwrap_or_default();

        if self.sim.dirs == 0 {
            errors.push("sim.dirs must be greater than zero.".to_owned());
        }
        if self.sim.workers == 0 {
            errors.push("sim.workers must be greater than zero.".to_owned());
        }
        if self.sim.stats_interval_ms == 0 {
            errors.push("sim.stats-interval-ms must be greater than zero.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("fhcache").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("fhcache").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/fhcache/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the external path if given, else from the first config file
    /// found, else the defaults. Errors if a config file exists but is malformed or invalid.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let found = external_config_path
            .map(Path::to_path_buf)
            .or_else(Self::find_config_file);

        let config = match found {
            Some(path) => Self::load_from_file(&path)?,
            None => {
                debug!("No configuration file found, using defaults.");
                Self::default()
            }
        };
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
