//! Engine Module
//!
//! `DataSource` is the storage engine behind a virtual Merkle tree.
//!
//! ## Responsibilities
//! - Commit a whole tree generation across the three stores
//! - Serve leaf and internal hash reads
//! - Run background merges
//! - Snapshot indexes on close and restore or rebuild them on open
//!
//! ## Concurrency Model
//! - **Commits**: one at a time. The path store is written on the calling
//!   thread while two commit workers apply internal hashes and key index
//!   updates. A commit returns once all three are done.
//! - **Reads**: run on caller threads against immutable files, never wait
//!   for the committer.
//! - **Merges**: one scheduler thread, independent of commits.

use std::fs;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::collections::{HashList, LongIndex};
use crate::config::{Config, KeyIndexMode, MergeConfig};
use crate::datafile::MergeFilter;
use crate::error::{Result, StoreError};
use crate::keyindex::KeyToPath;
use crate::store::{PathStore, PATH_INDEX_FILE};
use crate::types::{Hash, InternalRecord, LeafRecord, VirtualKey, VirtualValue, INVALID_PATH};
use crate::workers::{CommitWorker, MergeScheduler};

/// Marker written on clean close, next to the index snapshots
pub const MANIFEST_FILE: &str = "manifest.bin";

const MANIFEST_VERSION: u32 = 1;

/// Lifecycle of a data source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Open = 0,
    Committing = 1,
    Closing = 2,
    Closed = 3,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Open,
            1 => State::Committing,
            2 => State::Closing,
            _ => State::Closed,
        }
    }
}

/// Point-in-time statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub state: State,
    /// `(first_leaf_path, last_leaf_path)`
    pub leaf_range: Option<(u64, u64)>,
    pub leaf_files: usize,
    pub leaf_bytes: u64,
    /// Bucket files, always 0 with direct key indexing
    pub bucket_files: usize,
    pub bucket_bytes: u64,
    /// One more than the largest internal path stored
    pub internal_hashes: u64,
}

/// Written on clean close
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    leaf_range: Option<(u64, u64)>,
    key_index: KeyIndexMode,
}

// =============================================================================
// Stores
// =============================================================================

/// The three stores, shared with the worker threads
struct Stores {
    path_store: PathStore,
    key_index: KeyToPath,
    hashes: HashList,
}

impl Stores {
    /// Restore from snapshots after a clean close, otherwise rebuild
    fn open<K: VirtualKey>(config: &Config) -> Result<Self> {
        let manifest_path = config.storage_dir.join(MANIFEST_FILE);
        if manifest_path.exists() {
            match Self::load_snapshots(config, &manifest_path) {
                Ok(stores) => {
                    // A crash from here on must not trust the snapshots
                    fs::remove_file(&manifest_path)?;
                    tracing::info!("restored indexes from snapshots");
                    return Ok(stores);
                }
                // Wrong config, leave the snapshots for a correct one
                Err(e @ StoreError::Config(_)) => return Err(e),
                Err(e) => {
                    fs::remove_file(&manifest_path)?;
                    tracing::warn!(error = %e, "index snapshots unusable, rebuilding from data files");
                }
            }
        }
        Self::rebuild::<K>(config)
    }

    fn load_snapshots(config: &Config, manifest_path: &Path) -> Result<Self> {
        let manifest: Manifest = bincode::deserialize(&fs::read(manifest_path)?)?;
        if manifest.format_version != MANIFEST_VERSION {
            return Err(StoreError::UnsupportedFormatVersion {
                found: manifest.format_version,
                supported: MANIFEST_VERSION,
            });
        }
        if manifest.key_index != config.key_index {
            return Err(StoreError::Config(format!(
                "Store was closed with key index {:?}, opened with {:?}",
                manifest.key_index, config.key_index
            )));
        }

        let dir = &config.storage_dir;
        let path_index = LongIndex::load(&dir.join(PATH_INDEX_FILE), config.reserved_buffer_length)?;
        if path_index.capacity() != config.max_paths {
            return Err(StoreError::Config(format!(
                "Path index snapshot holds {} paths, configured for {}",
                path_index.capacity(),
                config.max_paths
            )));
        }

        let path_store = PathStore::with_index(dir, path_index)?;
        let leaf_range = path_store.leaf_range().map(|r| (r.min, r.max));
        if leaf_range != manifest.leaf_range {
            return Err(StoreError::Corruption(format!(
                "Manifest leaf range {:?} does not match data files {:?}",
                manifest.leaf_range, leaf_range
            )));
        }

        Ok(Self {
            path_store,
            key_index: KeyToPath::load(config)?,
            hashes: HashList::new(config.max_paths),
        })
    }

    fn rebuild<K: VirtualKey>(config: &Config) -> Result<Self> {
        let path_store = PathStore::open(&config.storage_dir, config)?;
        let key_index = KeyToPath::open(config)?;

        // Hashed indexes rebuild from their own files
        if key_index.is_direct() {
            let mut keys = 0u64;
            path_store.for_each_live_key(|key: K, path| {
                keys += 1;
                key_index.put_batch(&[(key, path)])
            })?;
            tracing::info!(keys, "rebuilt key index from leaf files");
        }

        Ok(Self {
            path_store,
            key_index,
            hashes: HashList::new(config.max_paths),
        })
    }

    /// Merge every store once, returning the number of files merged
    fn compact(&self, filter: MergeFilter, config: &MergeConfig) -> Result<usize> {
        let leaves = self.path_store.merge(filter, config)?;
        let buckets = self.key_index.merge(filter, config)?;
        Ok(leaves.files_merged + buckets.files_merged)
    }

    fn write_snapshots(&self, config: &Config) -> Result<()> {
        let dir = &config.storage_dir;
        self.path_store.write_index(&dir.join(PATH_INDEX_FILE))?;
        self.key_index.write_snapshot(dir)?;

        let manifest = Manifest {
            format_version: MANIFEST_VERSION,
            leaf_range: self.path_store.leaf_range().map(|r| (r.min, r.max)),
            key_index: config.key_index,
        };
        // Written last, it vouches for the files above
        fs::write(dir.join(MANIFEST_FILE), bincode::serialize(&manifest)?)?;
        Ok(())
    }
}

/// Background threads, torn down once by `close`
struct Workers<K: VirtualKey> {
    hashes: CommitWorker<Vec<InternalRecord>>,
    keys: CommitWorker<Vec<(K, u64)>>,
    merger: Option<MergeScheduler>,
}

// =============================================================================
// Data Source
// =============================================================================

/// Storage engine for one virtual Merkle tree
pub struct DataSource<K: VirtualKey, V: VirtualValue> {
    config: Config,
    stores: Arc<Stores>,
    state: AtomicU8,
    /// Held for the whole of a commit, and by close
    commit_lock: Mutex<()>,
    workers: RwLock<Option<Workers<K>>>,
    _value: PhantomData<fn() -> V>,
}

impl<K: VirtualKey, V: VirtualValue> DataSource<K, V> {
    /// Open or create a data source
    ///
    /// On startup:
    /// 1. Validate config and create the storage directory
    /// 2. Load index snapshots if the last close was clean, else replay
    ///    the data files
    /// 3. Start the commit workers and the merge scheduler
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.storage_dir)?;

        let stores = Arc::new(Stores::open::<K>(&config)?);

        let hash_stores = Arc::clone(&stores);
        let hashes = CommitWorker::spawn("vmstore-internal-hashes", move |records: Vec<InternalRecord>| {
            hash_stores
                .hashes
                .put_all(records.into_iter().map(|r| (r.path, r.hash)))
        })?;

        let key_stores = Arc::clone(&stores);
        let keys = CommitWorker::spawn("vmstore-key-index", move |entries: Vec<(K, u64)>| {
            key_stores.key_index.put_batch(&entries)
        })?;

        let merger = match &config.merge {
            Some(merge_config) => {
                let merge_stores = Arc::clone(&stores);
                let cutoffs = merge_config.clone();
                Some(MergeScheduler::spawn(merge_config.clone(), move |filter| {
                    merge_stores.compact(filter, &cutoffs).map(|_| ())
                })?)
            }
            None => None,
        };

        tracing::info!(
            storage_dir = %config.storage_dir.display(),
            key_index = ?config.key_index,
            merging = config.merge.is_some(),
            "opened data source"
        );

        Ok(Self {
            config,
            stores,
            state: AtomicU8::new(State::Open as u8),
            commit_lock: Mutex::new(()),
            workers: RwLock::new(Some(Workers {
                hashes,
                keys,
                merger,
            })),
            _value: PhantomData,
        })
    }

    /// Open with default config in `path`
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().storage_dir(path).build())
    }

    // =========================================================================
    // Commits
    // =========================================================================

    /// Commit one tree generation
    ///
    /// `leaf_records` must be sorted ascending by path with no duplicates.
    /// All three stores are written before this returns; on failure the
    /// first error is returned after every part finished.
    pub fn save_records(
        &self,
        first_leaf_path: u64,
        last_leaf_path: u64,
        internal_records: Vec<InternalRecord>,
        leaf_records: Vec<LeafRecord<K, V>>,
    ) -> Result<()> {
        self.check_open()?;
        let _commit = self
            .commit_lock
            .try_lock()
            .ok_or(StoreError::ConcurrentCommit)?;
        self.transition(State::Open, State::Committing)?;

        let result = self.commit(first_leaf_path, last_leaf_path, internal_records, leaf_records);

        self.state.store(State::Open as u8, Ordering::Release);
        result
    }

    fn commit(
        &self,
        first_leaf_path: u64,
        last_leaf_path: u64,
        internal_records: Vec<InternalRecord>,
        leaf_records: Vec<LeafRecord<K, V>>,
    ) -> Result<()> {
        self.stores
            .path_store
            .validate_batch(first_leaf_path, last_leaf_path, &leaf_records)?;
        // Nothing is written unless every key can be indexed
        for leaf in &leaf_records {
            self.stores.key_index.check_key(&leaf.key)?;
        }

        let workers = self.workers.read();
        let workers = workers.as_ref().ok_or(StoreError::Closed)?;

        let key_updates: Vec<(K, u64)> = leaf_records
            .iter()
            .map(|leaf| (leaf.key.clone(), leaf.path))
            .collect();
        let hashes = workers.hashes.submit(internal_records)?;
        let keys = workers.keys.submit(key_updates);

        let leaves = self
            .stores
            .path_store
            .save_records(first_leaf_path, last_leaf_path, &leaf_records);

        let hashes = hashes.wait();
        let keys = keys.and_then(|pending| pending.wait());

        leaves?;
        hashes?;
        keys?;
        Ok(())
    }

    /// Save one new leaf
    pub fn add_leaf(&self, path: u64, key: K, value: V, hash: Hash) -> Result<()> {
        let (first, last) = self.leaf_range_with(path);
        self.save_records(
            first,
            last,
            Vec::new(),
            vec![LeafRecord::new(path, key, hash, value)],
        )
    }

    /// Overwrite the leaf at `path`
    pub fn update_leaf(&self, path: u64, key: K, value: V, hash: Hash) -> Result<()> {
        self.add_leaf(path, key, value, hash)
    }

    /// Move a leaf to `new_path`, keeping its value
    ///
    /// Whatever was at `new_path` is overwritten.
    pub fn move_leaf(&self, old_path: u64, new_path: u64, key: K, hash: Hash) -> Result<()> {
        let value = self.load_leaf_value(old_path)?.ok_or_else(|| {
            StoreError::ContractViolation(format!("No leaf at path {} to move", old_path))
        })?;
        self.add_leaf(new_path, key, value, hash)
    }

    /// Save the hash of one internal node
    pub fn save_internal(&self, path: u64, hash: Hash) -> Result<()> {
        let (first, last) = self
            .stores
            .path_store
            .leaf_range()
            .map(|r| (r.min, r.max))
            .unwrap_or((INVALID_PATH, INVALID_PATH));
        self.save_records(first, last, vec![InternalRecord::new(path, hash)], Vec::new())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn load_leaf_record(&self, path: u64) -> Result<Option<LeafRecord<K, V>>> {
        self.check_readable()?;
        self.stores.path_store.load_leaf_record(path)
    }

    /// Leaf holding `key`, `None` if unknown or the key index is stale
    pub fn load_leaf_record_for_key(&self, key: &K) -> Result<Option<LeafRecord<K, V>>> {
        self.check_readable()?;
        match self.key_path(key)? {
            Some(path) => self.stores.path_store.load_leaf_record_for_key(path, key),
            None => Ok(None),
        }
    }

    pub fn load_leaf_hash(&self, path: u64) -> Result<Option<Hash>> {
        self.check_readable()?;
        self.stores.path_store.load_leaf_hash(path)
    }

    pub fn load_leaf_value(&self, path: u64) -> Result<Option<V>> {
        self.check_readable()?;
        self.stores.path_store.load_leaf_value(path)
    }

    pub fn load_leaf_value_for_key(&self, key: &K) -> Result<Option<V>> {
        self.check_readable()?;
        match self.key_path(key)? {
            Some(path) => self.stores.path_store.load_leaf_value_for_key(path, key),
            None => Ok(None),
        }
    }

    pub fn load_leaf_key(&self, path: u64) -> Result<Option<K>> {
        self.check_readable()?;
        self.stores.path_store.load_leaf_key(path)
    }

    /// Path of the leaf holding `key`
    pub fn load_leaf_path(&self, key: &K) -> Result<Option<u64>> {
        self.check_readable()?;
        match self.key_path(key)? {
            Some(path) if self.stores.path_store.holds_key(path, key)? => Ok(Some(path)),
            _ => Ok(None),
        }
    }

    pub fn load_internal_hash(&self, path: u64) -> Result<Option<Hash>> {
        self.check_readable()?;
        self.stores.hashes.get(path)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Run one merge now, returning the number of files merged
    pub fn compact(&self, filter: MergeFilter) -> Result<usize> {
        self.check_readable()?;
        let cutoffs = self.config.merge.clone().unwrap_or_default();
        self.stores.compact(filter, &cutoffs)
    }

    pub fn stats(&self) -> StoreStats {
        let stores = &self.stores;
        let (bucket_files, bucket_bytes) = stores.key_index.file_stats();
        StoreStats {
            state: self.state(),
            leaf_range: stores
                .path_store
                .leaf_range()
                .filter(|r| r.min != INVALID_PATH)
                .map(|r| (r.min, r.max)),
            leaf_files: stores.path_store.files().file_count(),
            leaf_bytes: stores.path_store.files().total_size(),
            bucket_files,
            bucket_bytes,
            internal_hashes: stores.hashes.size(),
        }
    }

    /// Stop background work and snapshot the indexes
    ///
    /// Waits for an in-flight commit first. Every later call fails with
    /// `StoreError::Closed`.
    pub fn close(&self) -> Result<()> {
        let _commit = self.commit_lock.lock();
        self.transition(State::Open, State::Closing)?;

        let result = self.shutdown();
        self.state.store(State::Closed as u8, Ordering::Release);

        match &result {
            Ok(()) => tracing::info!("closed data source"),
            Err(e) => tracing::error!(error = %e, "data source closed with errors"),
        }
        result
    }

    fn shutdown(&self) -> Result<()> {
        let workers = match self.workers.write().take() {
            Some(workers) => workers,
            None => return Ok(()),
        };
        let timeout = self.config.shutdown_timeout;

        // Merges first, so the snapshots match the files on disk
        if let Some(merger) = workers.merger {
            merger.stop(timeout)?;
        }
        workers.hashes.shutdown(timeout)?;
        workers.keys.shutdown(timeout)?;

        self.stores.write_snapshots(&self.config)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage_dir(&self) -> &Path {
        &self.config.storage_dir
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn key_path(&self, key: &K) -> Result<Option<u64>> {
        let path = self.stores.key_index.get(key, INVALID_PATH)?;
        Ok(if path == INVALID_PATH { None } else { Some(path) })
    }

    /// Current leaf range stretched to cover `path`
    fn leaf_range_with(&self, path: u64) -> (u64, u64) {
        match self.stores.path_store.leaf_range() {
            Some(r) if r.min != INVALID_PATH => (r.min.min(path), r.max.max(path)),
            _ => (path, path),
        }
    }

    fn transition(&self, from: State, to: State) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| match State::from_u8(current) {
                State::Committing => StoreError::ConcurrentCommit,
                _ => StoreError::Closed,
            })
    }

    fn check_open(&self) -> Result<()> {
        match self.state() {
            State::Closing | State::Closed => Err(StoreError::Closed),
            _ => Ok(()),
        }
    }

    /// Reads are allowed while a commit runs
    fn check_readable(&self) -> Result<()> {
        self.check_open()
    }
}

impl<K: VirtualKey, V: VirtualValue> Drop for DataSource<K, V> {
    fn drop(&mut self) {
        if matches!(self.state(), State::Open | State::Committing) {
            if let Err(e) = self.close() {
                tracing::error!(error = %e, "failed to close data source on drop");
            }
        }
    }
}

impl<K: VirtualKey, V: VirtualValue> std::fmt::Debug for DataSource<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("storage_dir", &self.config.storage_dir)
            .field("state", &self.state())
            .field("path_store", &self.stores.path_store)
            .finish()
    }
}
