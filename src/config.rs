//! Configuration for vmstore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

const GIB: u64 = 1024 * 1024 * 1024;

/// Main configuration for a vmstore data source
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {storage_dir}/
    ///     ├── pathToKeyHashValue_*.vmdf  (leaf payload files)
    ///     ├── objectKeyToPath_*.vmdf     (bucket files, hashed mode only)
    ///     └── manifest.bin + *.ll        (index snapshots, after clean close)
    pub storage_dir: PathBuf,

    /// How keys are mapped to paths
    pub key_index: KeyIndexMode,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// Largest path (exclusive) the path index can hold
    pub max_paths: u64,

    /// Number of longs per index chunk
    pub index_chunk_size: usize,

    /// Slots kept allocated below the min valid index when pruning
    pub reserved_buffer_length: u64,

    // -------------------------------------------------------------------------
    // Background Work
    // -------------------------------------------------------------------------
    /// Merge scheduling, `None` disables background merging
    pub merge: Option<MergeConfig>,

    /// Max time to wait for each background worker on close
    pub shutdown_timeout: Duration,
}

/// Key to path index flavour, chosen once per data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyIndexMode {
    /// Keys are numbers used directly as index slots
    Direct { max_keys: u64 },

    /// Arbitrary keys stored in on-disk hash buckets
    Hashed { max_keys: u64 },
}

/// Background merge cadence and file size tiers
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Delay before the first merge
    pub initial_delay: Duration,

    /// Time between merges
    pub period: Duration,

    /// Min time between medium merges
    pub medium_merge_interval: Duration,

    /// Min time between full merges
    pub full_merge_interval: Duration,

    /// Files below this size take part in small merges (in bytes)
    pub small_merge_cutoff: u64,

    /// Files below this size take part in medium merges (in bytes)
    pub medium_merge_cutoff: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            period: Duration::from_secs(5 * 60),
            medium_merge_interval: Duration::from_secs(30 * 60),
            full_merge_interval: Duration::from_secs(2 * 60 * 60),
            small_merge_cutoff: 2 * GIB,
            medium_merge_cutoff: 10 * GIB,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./vmstore_data"),
            key_index: KeyIndexMode::Direct {
                max_keys: 1_000_000_000,
            },
            max_paths: 2_000_000_000,
            index_chunk_size: 1024 * 1024, // 8 MB of longs
            reserved_buffer_length: 256 * 1024,
            merge: Some(MergeConfig::default()),
            shutdown_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings no store can be opened with
    pub fn validate(&self) -> Result<()> {
        if self.max_paths == 0 {
            return Err(StoreError::Config("max_paths must be positive".to_string()));
        }
        if self.index_chunk_size == 0 {
            return Err(StoreError::Config(
                "index_chunk_size must be positive".to_string(),
            ));
        }
        let max_keys = match self.key_index {
            KeyIndexMode::Direct { max_keys } | KeyIndexMode::Hashed { max_keys } => max_keys,
        };
        if max_keys == 0 {
            return Err(StoreError::Config("max_keys must be positive".to_string()));
        }
        if let Some(merge) = &self.merge {
            if merge.period.is_zero() {
                return Err(StoreError::Config("merge period must be positive".to_string()));
            }
            if merge.small_merge_cutoff > merge.medium_merge_cutoff {
                return Err(StoreError::Config(format!(
                    "small merge cutoff {} exceeds medium merge cutoff {}",
                    merge.small_merge_cutoff, merge.medium_merge_cutoff
                )));
            }
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the storage directory (root for all data files)
    pub fn storage_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_dir = path.into();
        self
    }

    /// Set the key index mode
    pub fn key_index(mut self, mode: KeyIndexMode) -> Self {
        self.config.key_index = mode;
        self
    }

    /// Set the path index capacity
    pub fn max_paths(mut self, max_paths: u64) -> Self {
        self.config.max_paths = max_paths;
        self
    }

    /// Set the number of longs per index chunk
    pub fn index_chunk_size(mut self, size: usize) -> Self {
        self.config.index_chunk_size = size;
        self
    }

    /// Set the reserved buffer length used when pruning indexes
    pub fn reserved_buffer_length(mut self, length: u64) -> Self {
        self.config.reserved_buffer_length = length;
        self
    }

    /// Set the merge configuration
    pub fn merge(mut self, merge: MergeConfig) -> Self {
        self.config.merge = Some(merge);
        self
    }

    /// Disable background merging
    pub fn disable_merging(mut self) -> Self {
        self.config.merge = None;
        self
    }

    /// Set the per-worker shutdown timeout
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
