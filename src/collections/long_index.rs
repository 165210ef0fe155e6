//! Growable Long Index
//!
//! A random access list of non-negative longs that behaves like a
//! long-to-long map: writing past the current size grows the list instead of
//! failing. Storage is split into fixed-size chunks that are allocated lazily
//! on first write and published with a compare-and-exchange, so concurrent
//! writers never install two chunks for the same slot and readers never see a
//! half-built chunk.
//!
//! ## Sentinel
//! `0` marks a slot that was never written. It can not be stored.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Header (24 bytes, little endian)                                │
//! │   Version: u32 | ChunkSize: u32 | Capacity: u64 | MinValid: u64 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Body: one u64 per slot, from MinValid up to the list size       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//! Version 1 files (`Version | ChunkSize | MaxIndex | Capacity`, body from
//! slot 0) are still readable.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};

use crate::error::{Result, StoreError};

/// Value of a slot that was never written
pub const SENTINEL: u64 = 0;

/// Largest chunk allowed (16000 MiB of longs)
pub const MAX_LONGS_PER_CHUNK: usize = 16_000 * 1024 * 1024 / 8;

/// Largest number of chunks a single index may have
pub const MAX_NUM_CHUNKS: usize = 2 << 14;

const INITIAL_FORMAT_VERSION: u32 = 1;
const MIN_VALID_INDEX_FORMAT_VERSION: u32 = 2;

/// Format version written by `write_to_file`
pub const CURRENT_FORMAT_VERSION: u32 = MIN_VALID_INDEX_FORMAT_VERSION;

/// Header size, identical for both format versions
const FILE_HEADER_SIZE: usize = 4 + 4 + 8 + 8;

/// One allocation unit of the index
struct Chunk {
    slots: Box<[AtomicU64]>,
}

impl Chunk {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| AtomicU64::new(SENTINEL)).collect(),
        }
    }

    /// Reset the first `count` slots to the sentinel
    fn clear_prefix(&self, count: usize) {
        for slot in self.slots.iter().take(count) {
            slot.store(SENTINEL, Ordering::Release);
        }
    }
}

/// Chunked, lock-free-writable array of longs
///
/// ## Concurrency
/// - `get`, `put` and `put_if_equal` may run from any number of threads
/// - `update_min_valid_index` must only be called from one maintenance
///   thread at a time; chunks it releases are destroyed once every reader
///   pinned at the time has moved on
pub struct LongIndex {
    /// Longs per chunk
    chunk_size: usize,

    /// One more than the largest index that may ever be stored
    capacity: u64,

    /// Slots kept allocated below the min valid index when pruning
    reserved_buffer_length: u64,

    /// One more than the largest index written so far
    size: AtomicU64,

    /// Every index below this reads as unset
    min_valid_index: AtomicU64,

    /// Lazily allocated chunks, null until first written
    chunks: Box<[Atomic<Chunk>]>,
}

impl LongIndex {
    /// Create an empty index
    pub fn new(chunk_size: usize, capacity: u64, reserved_buffer_length: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(StoreError::Config(
                "Index chunk size must be positive".to_string(),
            ));
        }
        if chunk_size > MAX_LONGS_PER_CHUNK {
            return Err(StoreError::Config(format!(
                "Cannot store {} longs per chunk (max is {})",
                chunk_size, MAX_LONGS_PER_CHUNK
            )));
        }

        let num_chunks = capacity.div_ceil(chunk_size as u64);
        if num_chunks > MAX_NUM_CHUNKS as u64 {
            return Err(StoreError::Config(format!(
                "Index of capacity {} needs {} chunks, max is {}. Increase the chunk size or decrease the capacity",
                capacity, num_chunks, MAX_NUM_CHUNKS
            )));
        }

        Ok(Self {
            chunk_size,
            capacity,
            reserved_buffer_length,
            size: AtomicU64::new(0),
            min_valid_index: AtomicU64::new(0),
            chunks: (0..num_chunks).map(|_| Atomic::null()).collect(),
        })
    }

    /// Load an index previously written with `write_to_file`
    ///
    /// Fails with `UnsupportedFormatVersion` for unknown versions.
    pub fn load(path: &Path, reserved_buffer_length: u64) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut header = [0u8; FILE_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let mut buf = &header[..];

        let version = buf.get_u32_le();
        let (chunk_size, capacity, min_valid_index) = match version {
            INITIAL_FORMAT_VERSION => {
                let chunk_size = buf.get_u32_le();
                let _max_index = buf.get_u64_le();
                let capacity = buf.get_u64_le();
                (chunk_size, capacity, 0)
            }
            MIN_VALID_INDEX_FORMAT_VERSION => {
                let chunk_size = buf.get_u32_le();
                let capacity = buf.get_u64_le();
                let min_valid_index = buf.get_u64_le();
                (chunk_size, capacity, min_valid_index)
            }
            found => {
                return Err(StoreError::UnsupportedFormatVersion {
                    found,
                    supported: CURRENT_FORMAT_VERSION,
                })
            }
        };

        let index = Self::new(chunk_size as usize, capacity, reserved_buffer_length)?;

        let body_len = file_len.saturating_sub(FILE_HEADER_SIZE as u64) / 8;
        let end = min_valid_index + body_len;
        if end > capacity {
            return Err(StoreError::Corruption(format!(
                "Index file {} holds {} slots past index {}, beyond capacity {}",
                path.display(),
                body_len,
                min_valid_index,
                capacity
            )));
        }

        let guard = epoch::pin();
        let mut raw = [0u8; 8];
        for slot in min_valid_index..end {
            reader.read_exact(&mut raw)?;
            let value = u64::from_le_bytes(raw);
            if value != SENTINEL {
                index.chunk_for_write(slot, &guard).slots[index.sub_index(slot)]
                    .store(value, Ordering::Release);
            }
        }

        index.size.store(end, Ordering::Release);
        index.min_valid_index.store(min_valid_index, Ordering::Release);

        tracing::debug!(
            path = %path.display(),
            version,
            size = end,
            min_valid_index,
            "loaded long index"
        );
        Ok(index)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value at `index`, or the sentinel when unset
    pub fn get(&self, index: u64) -> Result<u64> {
        self.get_or(index, SENTINEL)
    }

    /// Value at `index`, or `default` when unset, pruned or never grown to
    pub fn get_or(&self, index: u64, default: u64) -> Result<u64> {
        if index >= self.capacity {
            return Err(self.out_of_bounds(index));
        }
        if index >= self.size.load(Ordering::Acquire)
            || index < self.min_valid_index.load(Ordering::Acquire)
        {
            return Ok(default);
        }

        let guard = epoch::pin();
        let value = match self.chunk_for_read(self.chunk_index(index), &guard) {
            Some(chunk) => chunk.slots[self.sub_index(index)].load(Ordering::Acquire),
            None => SENTINEL,
        };

        Ok(if value == SENTINEL { default } else { value })
    }

    /// Call `action` for every set slot in `[min_valid_index, size)`
    ///
    /// Not a consistent snapshot while writers are active.
    pub fn for_each<F: FnMut(u64, u64)>(&self, mut action: F) {
        let start = self.min_valid_index();
        let end = self.size();
        let guard = epoch::pin();

        let mut index = start;
        while index < end {
            let chunk_index = self.chunk_index(index);
            let chunk_end = ((chunk_index as u64 + 1) * self.chunk_size as u64).min(end);
            if let Some(chunk) = self.chunk_for_read(chunk_index, &guard) {
                for i in index..chunk_end {
                    let value = chunk.slots[self.sub_index(i)].load(Ordering::Acquire);
                    if value != SENTINEL {
                        action(i, value);
                    }
                }
            }
            index = chunk_end;
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `value` at `index`, growing the list if needed
    pub fn put(&self, index: u64, value: u64) -> Result<()> {
        self.check_put(index, value)?;

        let guard = epoch::pin();
        let chunk = self.chunk_for_write(index, &guard);
        chunk.slots[self.sub_index(index)].store(value, Ordering::Release);
        self.size.fetch_max(index + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Store `new` at `index` only if it currently holds `old`
    ///
    /// Returns whether the value was replaced. A pruned index never matches.
    pub fn put_if_equal(&self, index: u64, old: u64, new: u64) -> Result<bool> {
        if new == SENTINEL {
            return Err(StoreError::ImpermissibleValue(new));
        }
        if index >= self.capacity {
            return Err(self.out_of_bounds(index));
        }
        if index < self.min_valid_index.load(Ordering::Acquire) {
            return Ok(false);
        }

        let guard = epoch::pin();
        let chunk = if old == SENTINEL {
            self.chunk_for_write(index, &guard)
        } else {
            if index >= self.size.load(Ordering::Acquire) {
                return Ok(false);
            }
            match self.chunk_for_read(self.chunk_index(index), &guard) {
                Some(chunk) => chunk,
                None => return Ok(false),
            }
        };

        let swapped = chunk.slots[self.sub_index(index)]
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.size.fetch_max(index + 1, Ordering::AcqRel);
        }
        Ok(swapped)
    }

    // =========================================================================
    // Pruning
    // =========================================================================

    /// Make every index below `new_min` read as unset and free what it can
    ///
    /// Chunks entirely below `new_min - reserved_buffer_length` are released.
    /// Chunks in the reserved buffer and the chunk holding `new_min` are only
    /// cleared so a boundary that moves back and forth does not reallocate.
    pub fn update_min_valid_index(&self, new_min: u64) -> Result<()> {
        if new_min > self.capacity {
            return Err(self.out_of_bounds(new_min));
        }
        if new_min > self.size() {
            tracing::debug!(
                new_min,
                size = self.size(),
                "min valid index is past the list size"
            );
        }

        self.min_valid_index.store(new_min, Ordering::Release);

        let guard = epoch::pin();
        let first_kept_chunk =
            (new_min.saturating_sub(self.reserved_buffer_length) / self.chunk_size as u64) as usize;
        let first_chunk_with_data = (new_min / self.chunk_size as u64) as usize;

        let mut released = 0usize;
        for slot in self.chunks.iter().take(first_kept_chunk) {
            let old = slot.swap(Shared::null(), Ordering::AcqRel, &guard);
            if !old.is_null() {
                // SAFETY: the chunk is unlinked, readers pinned before the swap keep it alive
                unsafe { guard.defer_destroy(old) };
                released += 1;
            }
        }

        for chunk_index in first_kept_chunk..first_chunk_with_data.min(self.chunks.len()) {
            if let Some(chunk) = self.chunk_for_read(chunk_index, &guard) {
                chunk.clear_prefix(self.chunk_size);
            }
        }

        if first_chunk_with_data < self.chunks.len() {
            if let Some(chunk) = self.chunk_for_read(first_chunk_with_data, &guard) {
                chunk.clear_prefix(self.sub_index(new_min));
            }
        }

        if released > 0 {
            tracing::debug!(new_min, released, "released index chunks");
        }
        Ok(())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write the header and every slot from the min valid index to the size
    ///
    /// Concurrent `put`s may or may not be captured.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let min_valid_index = self.min_valid_index();
        let size = self.size().max(min_valid_index);

        let mut header = BytesMut::with_capacity(FILE_HEADER_SIZE);
        header.put_u32_le(CURRENT_FORMAT_VERSION);
        header.put_u32_le(self.chunk_size as u32);
        header.put_u64_le(self.capacity);
        header.put_u64_le(min_valid_index);
        writer.write_all(&header)?;

        let guard = epoch::pin();
        let mut body = BytesMut::with_capacity(self.chunk_size.min(64 * 1024) * 8);
        let mut index = min_valid_index;
        while index < size {
            let chunk_index = self.chunk_index(index);
            let chunk_end = ((chunk_index as u64 + 1) * self.chunk_size as u64).min(size);
            let chunk = self.chunk_for_read(chunk_index, &guard);
            for i in index..chunk_end {
                let value = chunk
                    .map(|c| c.slots[self.sub_index(i)].load(Ordering::Acquire))
                    .unwrap_or(SENTINEL);
                body.put_u64_le(value);
                if body.len() >= 64 * 1024 * 8 {
                    writer.write_all(&body)?;
                    body.clear();
                }
            }
            index = chunk_end;
        }
        writer.write_all(&body)?;

        let file = writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// One more than the largest index written so far
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn min_valid_index(&self) -> u64 {
        self.min_valid_index.load(Ordering::Acquire)
    }

    /// Number of chunks currently holding memory
    pub fn allocated_chunks(&self) -> usize {
        let guard = epoch::pin();
        self.chunks
            .iter()
            .filter(|c| !c.load(Ordering::Acquire, &guard).is_null())
            .count()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn chunk_index(&self, index: u64) -> usize {
        (index / self.chunk_size as u64) as usize
    }

    fn sub_index(&self, index: u64) -> usize {
        (index % self.chunk_size as u64) as usize
    }

    fn check_put(&self, index: u64, value: u64) -> Result<()> {
        if value == SENTINEL {
            return Err(StoreError::ImpermissibleValue(value));
        }
        if index >= self.capacity || index < self.min_valid_index.load(Ordering::Acquire) {
            return Err(self.out_of_bounds(index));
        }
        Ok(())
    }

    fn out_of_bounds(&self, index: u64) -> StoreError {
        StoreError::IndexOutOfBounds {
            index,
            capacity: self.capacity,
            min_valid: self.min_valid_index.load(Ordering::Acquire),
        }
    }

    fn chunk_for_read<'g>(&self, chunk_index: usize, guard: &'g Guard) -> Option<&'g Chunk> {
        let shared = self.chunks[chunk_index].load(Ordering::Acquire, guard);
        // SAFETY: chunks are only destroyed through the epoch collector
        unsafe { shared.as_ref() }
    }

    /// Chunk holding `index`, allocated and published if missing
    fn chunk_for_write<'g>(&self, index: u64, guard: &'g Guard) -> &'g Chunk {
        let slot = &self.chunks[self.chunk_index(index)];
        if let Some(chunk) = self.chunk_for_read(self.chunk_index(index), guard) {
            return chunk;
        }

        let fresh = Owned::new(Chunk::new(self.chunk_size));
        match slot.compare_exchange(
            Shared::null(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            // SAFETY: just published, non-null
            Ok(published) => unsafe { published.deref() },
            Err(lost) => {
                // Another writer won, our chunk is dropped with `lost.new`
                // SAFETY: the exchange failed, so the current pointer is non-null
                unsafe { lost.current.deref() }
            }
        }
    }
}

impl Drop for LongIndex {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no reader can still hold a chunk
        unsafe {
            let guard = epoch::unprotected();
            for slot in self.chunks.iter() {
                let shared = slot.swap(Shared::null(), Ordering::Relaxed, guard);
                if !shared.is_null() {
                    drop(shared.into_owned());
                }
            }
        }
    }
}

impl std::fmt::Debug for LongIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongIndex")
            .field("chunk_size", &self.chunk_size)
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .field("min_valid_index", &self.min_valid_index())
            .finish()
    }
}
