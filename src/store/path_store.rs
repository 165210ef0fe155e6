//! Path → Payload Store
//!
//! Leaf records in a data file collection, plus a `LongIndex` from path to
//! the location of the newest copy.
//!
//! ## Write Path
//! 1. Reject batches not strictly ascending by path
//! 2. Append every leaf in one writing session
//! 3. Close the file, which records the leaf range
//! 4. Prune paths below the first leaf, then publish the new locations

use std::path::Path;

use parking_lot::RwLock;

use crate::collections::LongIndex;
use crate::config::{Config, MergeConfig};
use crate::datafile::{DataFileCollection, KeyRange, MergeFilter, MergeReport};
use crate::error::{Result, StoreError};
use crate::types::{Hash, LeafRecord, VirtualKey, VirtualValue, INVALID_PATH};

use super::record::{encode_leaf, RawLeaf};

/// Collection name of leaf files
pub const LEAF_FILES_NAME: &str = "pathToKeyHashValue";

/// Snapshot file of the path index
pub const PATH_INDEX_FILE: &str = "path_index.ll";

/// Leaf store addressed by path
pub struct PathStore {
    files: DataFileCollection,
    /// path → location
    index: LongIndex,
    /// Current `[first_leaf_path, last_leaf_path]`, `None` before the first save
    leaf_range: RwLock<Option<KeyRange>>,
}

impl PathStore {
    /// Open the leaf files in `dir` and rebuild the path index from them
    pub fn open(dir: &Path, config: &Config) -> Result<Self> {
        let index = LongIndex::new(
            config.index_chunk_size,
            config.max_paths,
            config.reserved_buffer_length,
        )?;
        let store = Self::with_index(dir, index)?;

        let rebuilt = store.files.rebuild_index(&store.index)?;
        if let Some(range) = store.leaf_range() {
            store.prune(range)?;
        }
        tracing::info!(leaves = rebuilt, "rebuilt path index");
        Ok(store)
    }

    /// Open the leaf files in `dir` with a path index loaded from a snapshot
    pub fn with_index(dir: &Path, index: LongIndex) -> Result<Self> {
        let files = DataFileCollection::open(dir, LEAF_FILES_NAME)?;
        let leaf_range = if files.file_count() > 0 {
            Some(files.valid_key_range())
        } else {
            None
        };

        Ok(Self {
            files,
            index,
            leaf_range: RwLock::new(leaf_range),
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Check that leaves are strictly ascending by path and inside the range
    pub fn validate_batch<K, V>(
        &self,
        first_leaf_path: u64,
        last_leaf_path: u64,
        leaves: &[LeafRecord<K, V>],
    ) -> Result<()> {
        let mut previous: Option<u64> = None;
        for leaf in leaves {
            if let Some(prev) = previous {
                if leaf.path <= prev {
                    return Err(StoreError::UnsortedBatch {
                        previous: prev,
                        path: leaf.path,
                    });
                }
            }
            previous = Some(leaf.path);
        }

        if first_leaf_path == INVALID_PATH {
            if !leaves.is_empty() {
                return Err(StoreError::ContractViolation(
                    "Leaves saved for an empty tree".to_string(),
                ));
            }
            return Ok(());
        }

        if first_leaf_path > last_leaf_path {
            return Err(StoreError::ContractViolation(format!(
                "First leaf path {} is after last leaf path {}",
                first_leaf_path, last_leaf_path
            )));
        }
        if last_leaf_path >= self.index.capacity() {
            return Err(StoreError::IndexOutOfBounds {
                index: last_leaf_path,
                capacity: self.index.capacity(),
                min_valid: self.index.min_valid_index(),
            });
        }
        if let (Some(first), Some(last)) = (leaves.first(), leaves.last()) {
            if first.path < first_leaf_path || last.path > last_leaf_path {
                return Err(StoreError::ContractViolation(format!(
                    "Leaf paths {}..={} fall outside the leaf range {}..={}",
                    first.path, last.path, first_leaf_path, last_leaf_path
                )));
            }
        }
        Ok(())
    }

    /// Write one generation of leaves
    ///
    /// `first_leaf_path == INVALID_PATH` marks an empty tree.
    pub fn save_records<K: VirtualKey, V: VirtualValue>(
        &self,
        first_leaf_path: u64,
        last_leaf_path: u64,
        leaves: &[LeafRecord<K, V>],
    ) -> Result<()> {
        self.validate_batch(first_leaf_path, last_leaf_path, leaves)?;

        let range = if first_leaf_path == INVALID_PATH {
            empty_range()
        } else {
            KeyRange::new(first_leaf_path, last_leaf_path)
        };
        // No leaf range yet is the same as an empty tree
        let current = self.leaf_range().unwrap_or_else(empty_range);
        if leaves.is_empty() && current == range {
            return Ok(());
        }

        self.files.start_writing()?;
        let mut locations = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            match self.files.store_data_item(&encode_leaf(leaf)) {
                Ok(location) => locations.push((leaf.path, location)),
                Err(e) => {
                    self.files.abort_writing();
                    return Err(e);
                }
            }
        }
        let file = self.files.end_writing(range.min, range.max)?;

        let published = self.publish(range, locations);
        self.files.mark_indexed(file.index());
        published?;

        tracing::debug!(
            leaves = leaves.len(),
            first_leaf_path,
            last_leaf_path,
            "saved leaf records"
        );
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Raw payload of the leaf at `path`, `None` outside the leaf range
    pub fn load_raw(&self, path: u64) -> Result<Option<RawLeaf>> {
        match self.leaf_range() {
            Some(range) if range.contains(path) => {}
            _ => return Ok(None),
        }

        let payload = match self.files.read_by_key(&self.index, path)? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        let raw = RawLeaf::parse(payload)?;
        if raw.path != path {
            return Err(StoreError::Corruption(format!(
                "Path index entry {} points at a leaf for path {}",
                path, raw.path
            )));
        }
        Ok(Some(raw))
    }

    pub fn load_leaf_record<K: VirtualKey, V: VirtualValue>(
        &self,
        path: u64,
    ) -> Result<Option<LeafRecord<K, V>>> {
        self.load_raw(path)?.map(RawLeaf::into_record).transpose()
    }

    /// Leaf at `path` if it holds `key`, without deserializing the key
    pub fn load_leaf_record_for_key<K: VirtualKey, V: VirtualValue>(
        &self,
        path: u64,
        key: &K,
    ) -> Result<Option<LeafRecord<K, V>>> {
        match self.load_raw(path)? {
            Some(raw) if raw.has_key(key) => Ok(Some(LeafRecord::new(
                path,
                key.clone(),
                raw.hash()?,
                raw.value()?,
            ))),
            _ => Ok(None),
        }
    }

    pub fn load_leaf_hash(&self, path: u64) -> Result<Option<Hash>> {
        self.load_raw(path)?.map(|raw| raw.hash()).transpose()
    }

    pub fn load_leaf_value<V: VirtualValue>(&self, path: u64) -> Result<Option<V>> {
        self.load_raw(path)?.map(|raw| raw.value()).transpose()
    }

    pub fn load_leaf_key<K: VirtualKey>(&self, path: u64) -> Result<Option<K>> {
        self.load_raw(path)?.map(|raw| raw.key()).transpose()
    }

    /// Value at `path` if the leaf there holds `key`
    pub fn load_leaf_value_for_key<K: VirtualKey, V: VirtualValue>(
        &self,
        path: u64,
        key: &K,
    ) -> Result<Option<V>> {
        match self.load_raw(path)? {
            Some(raw) if raw.has_key(key) => Ok(Some(raw.value()?)),
            _ => Ok(None),
        }
    }

    /// Whether the leaf at `path` holds `key`
    pub fn holds_key<K: VirtualKey>(&self, path: u64, key: &K) -> Result<bool> {
        Ok(self.load_raw(path)?.map_or(false, |raw| raw.has_key(key)))
    }

    /// Call `action(key, path)` for every live leaf, in replay order
    pub fn for_each_live_key<K, F>(&self, mut action: F) -> Result<()>
    where
        K: VirtualKey,
        F: FnMut(K, u64) -> Result<()>,
    {
        let range = match self.leaf_range() {
            Some(range) => range,
            None => return Ok(()),
        };
        self.files.for_each_item(|location, payload| {
            let raw = RawLeaf::parse(payload.clone())?;
            if range.contains(raw.path) && self.index.get(raw.path)? == location {
                action(raw.key()?, raw.path)?;
            }
            Ok(())
        })
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Merge the leaf files `filter` selects
    pub fn merge(&self, filter: MergeFilter, config: &MergeConfig) -> Result<MergeReport> {
        let selected = filter.select(&self.files.mergeable_files(), config);
        self.files.merge(&selected, &self.index)
    }

    pub fn write_index(&self, path: &Path) -> Result<()> {
        self.index.write_to_file(path)
    }

    /// `(first_leaf_path, last_leaf_path)`, `None` for an empty tree
    pub fn leaf_range(&self) -> Option<KeyRange> {
        *self.leaf_range.read()
    }

    pub fn files(&self) -> &DataFileCollection {
        &self.files
    }

    pub fn index(&self) -> &LongIndex {
        &self.index
    }

    /// Make a closed file's leaves visible
    fn publish(&self, range: KeyRange, locations: Vec<(u64, u64)>) -> Result<()> {
        self.prune(range)?;
        *self.leaf_range.write() = Some(range);
        for (path, location) in locations {
            self.index.put(path, location)?;
        }
        Ok(())
    }

    /// Everything below the first leaf is gone, an empty tree prunes it all
    fn prune(&self, range: KeyRange) -> Result<()> {
        let new_min = if range.min == INVALID_PATH {
            self.index.size()
        } else {
            range.min
        };
        self.index.update_min_valid_index(new_min)
    }
}

/// Range containing no path
fn empty_range() -> KeyRange {
    KeyRange::new(INVALID_PATH, 0)
}

impl std::fmt::Debug for PathStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathStore")
            .field("files", &self.files.file_count())
            .field("leaf_range", &self.leaf_range())
            .finish()
    }
}
