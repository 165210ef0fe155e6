//! Key → Path Index
//!
//! Resolves an application key to the tree path of its leaf.
//!
//! ## Modes
//! - **Direct**: the numeric form of the key is a slot in a `LongIndex`
//!   holding the path. Lives in memory, rebuilt from the path store.
//! - **Hashed**: keys hashed into on-disk buckets (`BucketIndex`).
//!
//! Entries are never deleted. A key whose leaf moved away keeps pointing at
//! its old path until overwritten, so callers compare the stored key.

mod bucket;
mod bucket_index;

use std::path::Path;

pub use bucket::{Bucket, BucketEntry};
pub use bucket_index::{bucket_count, BucketIndex, BUCKET_FILES_NAME};

use crate::collections::LongIndex;
use crate::config::{Config, KeyIndexMode, MergeConfig};
use crate::datafile::{MergeFilter, MergeReport};
use crate::error::{Result, StoreError};
use crate::types::VirtualKey;

/// Snapshot file of the direct index
pub const KEY_INDEX_FILE: &str = "key_index.ll";

/// Snapshot file of the bucket directory
pub const BUCKET_INDEX_FILE: &str = "bucket_index.ll";

/// Key → path index in either mode
#[derive(Debug)]
pub enum KeyToPath {
    Direct(LongIndex),
    Hashed(BucketIndex),
}

impl KeyToPath {
    /// Empty direct index or a hashed index rebuilt from its bucket files
    pub fn open(config: &Config) -> Result<Self> {
        match config.key_index {
            KeyIndexMode::Direct { max_keys } => Ok(KeyToPath::Direct(LongIndex::new(
                config.index_chunk_size,
                max_keys,
                config.reserved_buffer_length,
            )?)),
            KeyIndexMode::Hashed { max_keys } => Ok(KeyToPath::Hashed(BucketIndex::open(
                &config.storage_dir,
                max_keys,
                config.index_chunk_size,
                config.reserved_buffer_length,
            )?)),
        }
    }

    /// Index restored from the snapshot written by `write_snapshot`
    pub fn load(config: &Config) -> Result<Self> {
        let dir = &config.storage_dir;
        match config.key_index {
            KeyIndexMode::Direct { max_keys } => {
                let index =
                    LongIndex::load(&dir.join(KEY_INDEX_FILE), config.reserved_buffer_length)?;
                if index.capacity() != max_keys {
                    return Err(StoreError::Config(format!(
                        "Key index snapshot holds {} keys, configured for {}",
                        index.capacity(),
                        max_keys
                    )));
                }
                Ok(KeyToPath::Direct(index))
            }
            KeyIndexMode::Hashed { max_keys } => {
                let directory =
                    LongIndex::load(&dir.join(BUCKET_INDEX_FILE), config.reserved_buffer_length)?;
                Ok(KeyToPath::Hashed(BucketIndex::with_directory(
                    dir, max_keys, directory,
                )?))
            }
        }
    }

    /// Path of `key`, or `default` when unknown
    pub fn get<K: VirtualKey>(&self, key: &K, default: u64) -> Result<u64> {
        match self {
            KeyToPath::Direct(index) => index.get_or(direct_slot(key)?, default),
            KeyToPath::Hashed(buckets) => buckets.get(key, default),
        }
    }

    /// Fail if `put_batch` could not store `key`
    pub fn check_key<K: VirtualKey>(&self, key: &K) -> Result<()> {
        match self {
            KeyToPath::Direct(index) => {
                let slot = direct_slot(key)?;
                if slot >= index.capacity() {
                    return Err(StoreError::IndexOutOfBounds {
                        index: slot,
                        capacity: index.capacity(),
                        min_valid: index.min_valid_index(),
                    });
                }
                Ok(())
            }
            KeyToPath::Hashed(_) => Ok(()),
        }
    }

    /// Store every `(key, path)` pair, later pairs win
    pub fn put_batch<K: VirtualKey>(&self, entries: &[(K, u64)]) -> Result<()> {
        match self {
            KeyToPath::Direct(index) => {
                for (key, path) in entries {
                    index.put(direct_slot(key)?, *path)?;
                }
                Ok(())
            }
            KeyToPath::Hashed(buckets) => buckets.put_batch(entries),
        }
    }

    /// Merge on-disk files, a no-op for the direct index
    pub fn merge(&self, filter: MergeFilter, config: &MergeConfig) -> Result<MergeReport> {
        match self {
            KeyToPath::Direct(_) => Ok(MergeReport::default()),
            KeyToPath::Hashed(buckets) => buckets.merge(filter, config),
        }
    }

    pub fn write_snapshot(&self, dir: &Path) -> Result<()> {
        match self {
            KeyToPath::Direct(index) => index.write_to_file(&dir.join(KEY_INDEX_FILE)),
            KeyToPath::Hashed(buckets) => buckets.write_directory(&dir.join(BUCKET_INDEX_FILE)),
        }
    }

    /// (file count, bytes) of on-disk files
    pub fn file_stats(&self) -> (usize, u64) {
        match self {
            KeyToPath::Direct(_) => (0, 0),
            KeyToPath::Hashed(buckets) => {
                (buckets.files().file_count(), buckets.files().total_size())
            }
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, KeyToPath::Direct(_))
    }
}

fn direct_slot<K: VirtualKey>(key: &K) -> Result<u64> {
    key.as_long().ok_or_else(|| {
        StoreError::ContractViolation(format!(
            "Key {:?} has no numeric form, use hashed key indexing",
            key
        ))
    })
}
