//! Internal node hash store
//!
//! Path-addressed hashes kept purely in memory. Nothing here is ever written
//! to disk, so after a restart the tree layer recomputes every internal hash.

use parking_lot::RwLock;

use crate::error::{Result, StoreError};
use crate::types::Hash;

/// Growable in-memory array of hashes indexed by path
///
/// ## Concurrency
/// - Reads take the read lock and may run concurrently
/// - Writes are batched under one write lock per batch
pub struct HashList {
    /// Largest path (exclusive) that may be stored
    capacity: u64,

    /// Slot `path` holds the hash saved for that path
    hashes: RwLock<Vec<Option<Hash>>>,
}

impl HashList {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            hashes: RwLock::new(Vec::new()),
        }
    }

    /// Hash saved for `path`, if any
    pub fn get(&self, path: u64) -> Result<Option<Hash>> {
        self.check_path(path)?;
        Ok(self
            .hashes
            .read()
            .get(path as usize)
            .and_then(|h| h.clone()))
    }

    /// Save one hash
    pub fn put(&self, path: u64, hash: Hash) -> Result<()> {
        self.put_all(std::iter::once((path, hash)))
    }

    /// Save many hashes under a single lock acquisition
    pub fn put_all<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (u64, Hash)>,
    {
        let mut hashes = self.hashes.write();
        for (path, hash) in entries {
            self.check_path(path)?;
            let slot = path as usize;
            if slot >= hashes.len() {
                hashes.resize(slot + 1, None);
            }
            hashes[slot] = Some(hash);
        }
        Ok(())
    }

    /// One more than the largest path stored
    pub fn size(&self) -> u64 {
        self.hashes.read().len() as u64
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn check_path(&self, path: u64) -> Result<()> {
        if path >= self.capacity {
            return Err(StoreError::IndexOutOfBounds {
                index: path,
                capacity: self.capacity,
                min_valid: 0,
            });
        }
        Ok(())
    }
}
