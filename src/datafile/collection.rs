//! Data File Collection
//!
//! A named set of data files in one directory.
//!
//! ## Responsibilities
//! - Discover existing files on startup, dropping unfinished ones
//! - Run the single writing session
//! - Route positional reads to the right file
//! - Merge live items of many files into one
//!
//! ## Concurrency:
//! - `files`: RwLock over shared readers, held only to clone an `Arc`
//! - `writer`: Mutex, one writing session at a time
//! - `merge_lock`: one merge at a time, independent of the writer
//! - `unindexed`: closed files whose locations the caller has not indexed
//!   yet. Merges leave them alone, they would look entirely dead.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::collections::{LongIndex, SENTINEL};
use crate::error::{Result, StoreError};

use super::{
    file_index_of, item_key, parse_file_index, DataFileMetadata, DataFileReader, DataFileWriter,
    TEMP_EXTENSION,
};

/// Inclusive range of keys whose items are still live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub min: u64,
    pub max: u64,
}

impl KeyRange {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, key: u64) -> bool {
        self.min <= key && key <= self.max
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::new(0, u64::MAX)
    }
}

/// Outcome of one merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Input files removed from the collection
    pub files_merged: usize,
    /// Live items copied to the new file
    pub items_copied: u64,
    /// Index entries moved to the new file
    pub items_repointed: u64,
    /// Index of the new file, if any live item was found
    pub new_file_index: Option<u32>,
}

/// Append-only log of framed items spread over many files
pub struct DataFileCollection {
    dir: PathBuf,
    name: String,

    /// Closed files, ordered by (sequence, index)
    files: RwLock<Vec<Arc<DataFileReader>>>,

    /// Open writing session, if any
    writer: Mutex<Option<DataFileWriter>>,

    next_file_index: AtomicU32,
    next_sequence: AtomicU64,

    valid_range: RwLock<KeyRange>,

    /// Readable but not yet mergeable, see `mark_indexed`
    unindexed: Mutex<HashSet<u32>>,

    merge_lock: Mutex<()>,
}

impl DataFileCollection {
    /// Open or create the collection `name` in `dir`
    ///
    /// On startup:
    /// 1. Create directory if it doesn't exist
    /// 2. Delete files left unfinished by a crash
    /// 3. Open readers for every closed file
    /// 4. Order by (sequence, index) for replay
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let temp_prefix = format!("{}_", name);
        let mut files = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if file_name.starts_with(&temp_prefix) && file_name.ends_with(TEMP_EXTENSION) {
                tracing::warn!(path = %path.display(), "deleting unfinished data file");
                fs::remove_file(&path)?;
                continue;
            }

            if parse_file_index(&path, name).is_some() {
                files.push(Arc::new(DataFileReader::open(&path)?));
            }
        }

        files.sort_by_key(|f| (f.metadata().sequence, f.index()));

        let next_file_index = files.iter().map(|f| f.index()).max().unwrap_or(0) + 1;
        let next_sequence = files
            .iter()
            .map(|f| f.metadata().sequence)
            .max()
            .unwrap_or(0)
            + 1;
        let valid_range = files
            .last()
            .map(|f| KeyRange::new(f.metadata().min_valid_key, f.metadata().max_valid_key))
            .unwrap_or_default();

        tracing::info!(
            collection = name,
            files = files.len(),
            next_file_index,
            "opened data file collection"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            files: RwLock::new(files),
            writer: Mutex::new(None),
            next_file_index: AtomicU32::new(next_file_index),
            next_sequence: AtomicU64::new(next_sequence),
            valid_range: RwLock::new(valid_range),
            unindexed: Mutex::new(HashSet::new()),
            merge_lock: Mutex::new(()),
        })
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Open a new file for writing
    pub fn start_writing(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Err(StoreError::WritingSession(format!(
                "{} already has an open writing session",
                self.name
            )));
        }

        let index = self.next_file_index.fetch_add(1, Ordering::SeqCst);
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let metadata = DataFileMetadata::new(index, sequence, 0);
        *writer = Some(DataFileWriter::create(&self.dir, &self.name, metadata)?);
        Ok(())
    }

    /// Append one item to the open file, returning its location
    pub fn store_data_item(&self, payload: &[u8]) -> Result<u64> {
        let mut writer = self.writer.lock();
        match writer.as_mut() {
            Some(w) => w.write_item(payload),
            None => Err(StoreError::WritingSession(format!(
                "{} has no open writing session",
                self.name
            ))),
        }
    }

    /// Close the open file and make it readable
    ///
    /// Locations returned by `store_data_item` may only be indexed after this
    /// returns. The file takes no part in merges until `mark_indexed` is
    /// called with its index.
    pub fn end_writing(&self, min_valid_key: u64, max_valid_key: u64) -> Result<Arc<DataFileReader>> {
        let writer = self.writer.lock().take().ok_or_else(|| {
            StoreError::WritingSession(format!("{} has no open writing session", self.name))
        })?;

        let items = writer.item_count();
        let path = writer.finish(min_valid_key, max_valid_key)?;
        let reader = Arc::new(DataFileReader::open(&path)?);

        self.unindexed.lock().insert(reader.index());
        self.publish(reader.clone());
        *self.valid_range.write() = KeyRange::new(min_valid_key, max_valid_key);

        tracing::debug!(
            collection = %self.name,
            file_index = reader.index(),
            items,
            "closed data file"
        );
        Ok(reader)
    }

    /// Throw away the open file, if any
    pub fn abort_writing(&self) {
        if let Some(writer) = self.writer.lock().take() {
            tracing::warn!(
                collection = %self.name,
                file_index = writer.file_index(),
                "aborting writing session"
            );
            writer.abandon();
        }
    }

    pub fn is_writing(&self) -> bool {
        self.writer.lock().is_some()
    }

    /// Every location of the file is in the index, merges may take it
    pub fn mark_indexed(&self, file_index: u32) {
        self.unindexed.lock().remove(&file_index);
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Read the item at `location`
    ///
    /// Returns `None` when the file is no longer part of the collection.
    pub fn read_data_item(&self, location: u64) -> Result<Option<Bytes>> {
        match self.file_for(location) {
            Some(file) => file.read_item(location).map(Some),
            None => Ok(None),
        }
    }

    /// Read the item `index` points to for `key`
    ///
    /// When the file was merged away between the index lookup and the read,
    /// the merge has already repointed the index, so the lookup is retried.
    pub fn read_by_key(&self, index: &LongIndex, key: u64) -> Result<Option<Bytes>> {
        let mut location = index.get(key)?;
        loop {
            if location == SENTINEL {
                return Ok(None);
            }
            if let Some(item) = self.read_data_item(location)? {
                return Ok(Some(item));
            }

            let current = index.get(key)?;
            if current == location {
                return Err(StoreError::FileNotFound(
                    self.dir.join(format!("{}_{:06}", self.name, file_index_of(location))),
                ));
            }
            location = current;
        }
    }

    /// Visit every item of every file in replay order
    pub fn for_each_item<F>(&self, mut action: F) -> Result<()>
    where
        F: FnMut(u64, &Bytes) -> Result<()>,
    {
        for file in self.files() {
            for item in file.iter()? {
                let (location, payload) = item?;
                action(location, &payload)?;
            }
        }
        Ok(())
    }

    /// Point `index` at the newest copy of every key in the valid range
    pub fn rebuild_index(&self, index: &LongIndex) -> Result<u64> {
        let range = self.valid_key_range();
        let mut count = 0u64;
        self.for_each_item(|location, payload| {
            let key = item_key(payload).ok_or_else(|| self.short_item(location))?;
            if range.contains(key) && key < index.capacity() {
                index.put(key, location)?;
                count += 1;
            }
            Ok(())
        })?;
        Ok(count)
    }

    // =========================================================================
    // Merging
    // =========================================================================

    /// Copy the live items of `inputs` into one new file and delete them
    ///
    /// An item is live when `index` still points at it and its key is in
    /// the valid range. Needs at least two input files. Files not yet
    /// marked indexed are skipped.
    ///
    /// The new file takes the sequence and valid range of the newest input.
    /// It is written even without live items when that input is the newest
    /// file of the collection, so replay still finds the current range.
    pub fn merge(&self, inputs: &[Arc<DataFileReader>], index: &LongIndex) -> Result<MergeReport> {
        let _guard = self.merge_lock.lock();

        let unindexed = self.unindexed.lock().clone();
        // Another merge may have consumed some of them already
        let (inputs, newest_file): (Vec<Arc<DataFileReader>>, Option<u32>) = {
            let files = self.files.read();
            let inputs = inputs
                .iter()
                .filter(|f| !unindexed.contains(&f.index()))
                .filter(|f| files.iter().any(|g| g.index() == f.index()))
                .cloned()
                .collect();
            (inputs, files.last().map(|f| f.index()))
        };
        if inputs.len() < 2 {
            return Ok(MergeReport::default());
        }

        let newest = match inputs
            .iter()
            .max_by_key(|f| (f.metadata().sequence, f.index()))
        {
            Some(newest) => Arc::clone(newest),
            None => return Ok(MergeReport::default()),
        };
        let sequence = newest.metadata().sequence;
        let carried_range = KeyRange::new(
            newest.metadata().min_valid_key,
            newest.metadata().max_valid_key,
        );
        let holds_newest_file = newest_file == Some(newest.index());

        let level = inputs
            .iter()
            .map(|f| f.metadata().compaction_level)
            .max()
            .unwrap_or(0)
            .saturating_add(1);
        let file_index = self.next_file_index.fetch_add(1, Ordering::SeqCst);
        let range = self.valid_key_range();

        let mut writer = DataFileWriter::create(
            &self.dir,
            &self.name,
            DataFileMetadata::new(file_index, sequence, level),
        )?;

        let mut moved = Vec::new();
        if let Err(e) = self.copy_live_items(&inputs, index, range, &mut writer, &mut moved) {
            writer.abandon();
            return Err(e);
        }

        let mut report = MergeReport {
            files_merged: inputs.len(),
            items_copied: moved.len() as u64,
            ..MergeReport::default()
        };

        if moved.is_empty() && !holds_newest_file {
            writer.abandon();
        } else {
            let path = writer.finish(carried_range.min, carried_range.max)?;
            self.publish(Arc::new(DataFileReader::open(&path)?));
            report.new_file_index = Some(file_index);

            for (key, old, new) in moved {
                // A lost race means a newer write superseded the item
                if index.put_if_equal(key, old, new)? {
                    report.items_repointed += 1;
                }
            }
        }

        self.remove_files(&inputs)?;

        tracing::info!(
            collection = %self.name,
            files_merged = report.files_merged,
            items_copied = report.items_copied,
            items_repointed = report.items_repointed,
            level,
            "merged data files"
        );
        Ok(report)
    }

    fn copy_live_items(
        &self,
        inputs: &[Arc<DataFileReader>],
        index: &LongIndex,
        range: KeyRange,
        writer: &mut DataFileWriter,
        moved: &mut Vec<(u64, u64, u64)>,
    ) -> Result<()> {
        for file in inputs {
            for item in file.iter()? {
                let (location, payload) = item?;
                let key = item_key(&payload).ok_or_else(|| self.short_item(location))?;
                if !range.contains(key) || key >= index.capacity() {
                    continue;
                }
                if index.get(key)? == location {
                    let new_location = writer.write_item(&payload)?;
                    moved.push((key, location, new_location));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Closed files in replay order
    pub fn files(&self) -> Vec<Arc<DataFileReader>> {
        self.files.read().clone()
    }

    /// Closed files merges may take, in replay order
    pub fn mergeable_files(&self) -> Vec<Arc<DataFileReader>> {
        let unindexed = self.unindexed.lock().clone();
        self.files
            .read()
            .iter()
            .filter(|f| !unindexed.contains(&f.index()))
            .cloned()
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    /// Total size of closed files in bytes
    pub fn total_size(&self) -> u64 {
        self.files.read().iter().map(|f| f.size()).sum()
    }

    pub fn valid_key_range(&self) -> KeyRange {
        *self.valid_range.read()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn file_for(&self, location: u64) -> Option<Arc<DataFileReader>> {
        let file_index = file_index_of(location);
        self.files
            .read()
            .iter()
            .find(|f| f.index() == file_index)
            .cloned()
    }

    /// Insert keeping (sequence, index) order
    fn publish(&self, reader: Arc<DataFileReader>) {
        let mut files = self.files.write();
        let key = (reader.metadata().sequence, reader.index());
        let pos = files
            .iter()
            .position(|f| (f.metadata().sequence, f.index()) > key)
            .unwrap_or(files.len());
        files.insert(pos, reader);
    }

    fn remove_files(&self, removed: &[Arc<DataFileReader>]) -> Result<()> {
        self.files
            .write()
            .retain(|f| !removed.iter().any(|r| r.index() == f.index()));

        // Readers still holding an Arc keep their open handle
        for file in removed {
            fs::remove_file(file.path())?;
        }
        Ok(())
    }

    fn short_item(&self, location: u64) -> StoreError {
        StoreError::Corruption(format!(
            "Item at location {:#x} in {} is too short to hold its key",
            location, self.name
        ))
    }
}

impl std::fmt::Debug for DataFileCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFileCollection")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("files", &self.file_count())
            .finish()
    }
}
