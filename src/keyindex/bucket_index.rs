//! Hashed Key Index
//!
//! Arbitrary keys hashed into on-disk buckets. An in-memory directory maps
//! each bucket id to the location of its newest copy, so a lookup costs one
//! directory access plus one disk read.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::collections::LongIndex;
use crate::config::MergeConfig;
use crate::datafile::{DataFileCollection, MergeFilter, MergeReport};
use crate::error::{Result, StoreError};
use crate::types::VirtualKey;

use super::bucket::{Bucket, BucketEntry};

/// Collection name of bucket files
pub const BUCKET_FILES_NAME: &str = "objectKeyToPath";

/// Target number of keys per bucket
const KEYS_PER_BUCKET: u64 = 32;

/// Key → path map stored in hashed buckets
pub struct BucketIndex {
    files: DataFileCollection,
    /// bucket id → bucket location
    directory: LongIndex,
    num_buckets: u64,
    /// Updates buffered by the open writing session, by bucket
    pending: Mutex<Option<BTreeMap<u64, Vec<BucketEntry>>>>,
}

/// Bucket count for `max_keys`, always a power of two
pub fn bucket_count(max_keys: u64) -> u64 {
    (max_keys / KEYS_PER_BUCKET).max(1).next_power_of_two()
}

impl BucketIndex {
    /// Open the bucket files in `dir` and rebuild the directory from them
    pub fn open(dir: &Path, max_keys: u64, chunk_size: usize, reserved: u64) -> Result<Self> {
        let num_buckets = bucket_count(max_keys);
        let directory = LongIndex::new(chunk_size, num_buckets, reserved)?;
        let index = Self::with_directory(dir, max_keys, directory)?;

        let buckets = index.files.rebuild_index(&index.directory)?;
        tracing::info!(buckets, num_buckets, "rebuilt bucket directory");
        Ok(index)
    }

    /// Open the bucket files in `dir` with a directory loaded from a snapshot
    pub fn with_directory(dir: &Path, max_keys: u64, directory: LongIndex) -> Result<Self> {
        let num_buckets = bucket_count(max_keys);
        if directory.capacity() != num_buckets {
            return Err(StoreError::Config(format!(
                "Bucket directory holds {} buckets, {} keys need {}",
                directory.capacity(),
                max_keys,
                num_buckets
            )));
        }

        Ok(Self {
            files: DataFileCollection::open(dir, BUCKET_FILES_NAME)?,
            directory,
            num_buckets,
            pending: Mutex::new(None),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Path stored for `key`, or `default`
    pub fn get<K: VirtualKey>(&self, key: &K, default: u64) -> Result<u64> {
        let (hash, bytes) = hash_key(key);
        let bucket_id = self.bucket_id(hash);

        match self.files.read_by_key(&self.directory, bucket_id)? {
            Some(payload) => {
                let bucket = Bucket::decode(payload)?;
                Ok(bucket.find(hash, key.version(), &bytes).unwrap_or(default))
            }
            None => Ok(default),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn start_writing(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return Err(StoreError::WritingSession(
                "bucket index already has an open writing session".to_string(),
            ));
        }
        *pending = Some(BTreeMap::new());
        Ok(())
    }

    /// Buffer `key → path` until `end_writing`
    pub fn put<K: VirtualKey>(&self, key: &K, path: u64) -> Result<()> {
        let (hash, bytes) = hash_key(key);
        let bucket_id = self.bucket_id(hash);

        let mut pending = self.pending.lock();
        let updates = pending.as_mut().ok_or_else(|| {
            StoreError::WritingSession("bucket index has no open writing session".to_string())
        })?;
        updates.entry(bucket_id).or_default().push(BucketEntry {
            key_hash: hash,
            path,
            key_version: key.version(),
            key_bytes: bytes,
        });
        Ok(())
    }

    /// Rewrite every touched bucket, publish the file, then repoint the
    /// directory
    pub fn end_writing(&self) -> Result<()> {
        let updates = self.pending.lock().take().ok_or_else(|| {
            StoreError::WritingSession("bucket index has no open writing session".to_string())
        })?;
        if updates.is_empty() {
            return Ok(());
        }

        self.files.start_writing()?;
        let locations = match self.write_buckets(updates) {
            Ok(locations) => locations,
            Err(e) => {
                self.files.abort_writing();
                return Err(e);
            }
        };
        let file = self.files.end_writing(0, self.num_buckets - 1)?;

        let published = locations
            .iter()
            .try_for_each(|(bucket_id, location)| self.directory.put(*bucket_id, *location));
        self.files.mark_indexed(file.index());
        published?;
        tracing::debug!(buckets = locations.len(), "updated key buckets");
        Ok(())
    }

    /// Store a whole batch in one writing session
    pub fn put_batch<K: VirtualKey>(&self, entries: &[(K, u64)]) -> Result<()> {
        self.start_writing()?;
        for (key, path) in entries {
            if let Err(e) = self.put(key, *path) {
                self.pending.lock().take();
                return Err(e);
            }
        }
        self.end_writing()
    }

    fn write_buckets(&self, updates: BTreeMap<u64, Vec<BucketEntry>>) -> Result<Vec<(u64, u64)>> {
        let mut locations = Vec::with_capacity(updates.len());
        for (bucket_id, entries) in updates {
            let mut bucket = match self.files.read_by_key(&self.directory, bucket_id)? {
                Some(payload) => Bucket::decode(payload)?,
                None => Bucket::new(bucket_id),
            };
            for entry in entries {
                bucket.put(entry);
            }
            let location = self.files.store_data_item(&bucket.encode())?;
            locations.push((bucket_id, location));
        }
        Ok(locations)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Merge the bucket files `filter` selects
    pub fn merge(&self, filter: MergeFilter, config: &MergeConfig) -> Result<MergeReport> {
        let selected = filter.select(&self.files.mergeable_files(), config);
        self.files.merge(&selected, &self.directory)
    }

    pub fn write_directory(&self, path: &Path) -> Result<()> {
        self.directory.write_to_file(path)
    }

    pub fn num_buckets(&self) -> u64 {
        self.num_buckets
    }

    pub fn files(&self) -> &DataFileCollection {
        &self.files
    }

    fn bucket_id(&self, hash: u32) -> u64 {
        hash as u64 & (self.num_buckets - 1)
    }
}

/// (crc32 of the serialized key, serialized key)
fn hash_key<K: VirtualKey>(key: &K) -> (u32, Bytes) {
    let mut buf = BytesMut::new();
    key.serialize(&mut buf);
    let bytes = buf.freeze();
    (crc32fast::hash(&bytes), bytes)
}

impl std::fmt::Debug for BucketIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketIndex")
            .field("num_buckets", &self.num_buckets)
            .field("files", &self.files.file_count())
            .finish()
    }
}
