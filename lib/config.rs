//! Cache tuning parameters.
//!
//! The engine does not search for configuration files itself; callers hand it an [`LruConfig`],
//! usually parsed from the `[cache]` table of their own TOML file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Watermarks and work sizes for the entry and chunk caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LruConfig {
    /// Soft target for resident entries. The reclaimer works to keep usage at or below this.
    pub entries_hiwat: u64,

    /// Hard budget for resident entries. Allocations beyond this trigger one forced release and
    /// fail with `NoSpace` if it cannot make room.
    pub entries_hard_limit: u64,

    /// Maximum number of entries reclaimed from a single lane in one pass.
    pub entries_release_size: u32,

    /// Chunk count above which the reclaimer starts trimming directory chunks.
    pub chunks_hiwat: u64,

    /// Chunk count the reclaimer trims down to once triggered.
    pub chunks_lowat: u64,

    /// Maximum number of directory entries held by one chunk.
    pub dir_chunk_size: u32,

    /// Interval between background reclamation passes, in milliseconds.
    pub reclaim_interval_ms: u64,

    /// Capacity of the deferred-teardown queue feeding the reclaimer.
    pub cleanup_queue_depth: usize,

    /// Maximum number of live directory cookies.
    pub dirmap_hiwat: usize,
}

impl Default for LruConfig {
    fn default() -> Self {
        Self {
            entries_hiwat: 100_000,
            entries_hard_limit: 200_000,
            entries_release_size: 100,
            chunks_hiwat: 100_000,
            chunks_lowat: 75_000,
            dir_chunk_size: 128,
            reclaim_interval_ms: 1_000,
            cleanup_queue_depth: 1_024,
            dirmap_hiwat: 10_000,
        }
    }
}

/// Errors produced while loading or validating an [`LruConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more fields failed validation.
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    /// The TOML could not be parsed.
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl LruConfig {
    /// Validate the correctness of the configuration.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.entries_hiwat == 0 {
            errors.push("entries-hiwat must be greater than zero.".to_owned());
        }
        if self.entries_hard_limit < self.entries_hiwat {
            errors.push(format!(
                "entries-hard-limit ({}) must not be below entries-hiwat ({}).",
                self.entries_hard_limit, self.entries_hiwat
            ));
        }
        if self.entries_release_size == 0 {
            errors.push("entries-release-size must be greater than zero.".to_owned());
        }
        if self.chunks_hiwat == 0 {
            errors.push("chunks-hiwat must be greater than zero.".to_owned());
        }
        if self.chunks_lowat > self.chunks_hiwat {
            errors.push(format!(
                "chunks-lowat ({}) must not exceed chunks-hiwat ({}).",
                self.chunks_lowat, self.chunks_hiwat
            ));
        }
        if self.dir_chunk_size == 0 {
            errors.push("dir-chunk-size must be greater than zero.".to_owned());
        }
        if self.reclaim_interval_ms == 0 {
            errors.push("reclaim-interval-ms must be greater than zero.".to_owned());
        }
        if self.cleanup_queue_depth == 0 {
            errors.push("cleanup-queue-depth must be greater than zero.".to_owned());
        }
        if self.dirmap_hiwat == 0 {
            errors.push("dirmap-hiwat must be greater than zero.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Interval between background reclamation passes.
    #[must_use]
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    /// Load and validate a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading cache configuration file.");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
