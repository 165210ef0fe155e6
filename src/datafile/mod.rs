//! Data File Module
//!
//! Append-only record log: immutable-once-closed files of sequential,
//! length/CRC-framed records addressed by opaque data locations.
//!
//! ## Responsibilities
//! - One writing session at a time per collection
//! - Lock-free positional reads of closed files
//! - Replay of every stored item to rebuild indexes
//! - Merging live items of many files into one
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header                                                   │
//! │   Magic: "VMDF" (4) | Version: u16 (2) | MetaLen: u32 (4)│
//! │   Metadata: bincode(DataFileMetadata), fixed size        │
//! ├──────────────────────────────────────────────────────────┤
//! │ Items (variable)                                         │
//! │   [PayloadLen: u32][CRC32: u32][Payload]                 │
//! │   ... repeated for each item ...                         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every payload starts with the little-endian `u64` key it is indexed
//! under. Merges and index rebuilds read it to decide which items are live.

mod collection;
mod iterator;
mod merge;
mod reader;
mod writer;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

pub use collection::{DataFileCollection, KeyRange, MergeReport};
pub use iterator::DataFileIterator;
pub use merge::{MergeFilter, MergePolicy};
pub use reader::DataFileReader;
pub use writer::DataFileWriter;

// =============================================================================
// Shared Constants (used by writer, reader, iterator)
// =============================================================================

/// Magic bytes identifying a vmstore data file
pub(crate) const MAGIC: &[u8; 4] = b"VMDF";

/// Current data file format version
pub(crate) const FORMAT_VERSION: u16 = 1;

/// Magic (4) + Version (2) + MetadataLen (4)
pub(crate) const PREAMBLE_SIZE: u64 = 10;

/// PayloadLen (4) + CRC32 (4)
pub(crate) const ITEM_HEADER_SIZE: u64 = 8;

/// Largest payload accepted (256 MiB)
pub(crate) const MAX_ITEM_SIZE: u32 = 256 * 1024 * 1024;

/// Extension of closed data files
pub const FILE_EXTENSION: &str = "vmdf";

/// Extension of files still being written
pub(crate) const TEMP_EXTENSION: &str = "vmdf.tmp";

/// Highest compaction level a file can reach
pub const MAX_COMPACTION_LEVEL: u8 = 127;

const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Largest file index a location can address
pub const MAX_FILE_INDEX: u32 = (1 << (64 - OFFSET_BITS)) - 1;

/// Largest byte offset a location can address
pub const MAX_BYTE_OFFSET: u64 = OFFSET_MASK;

// =============================================================================
// Data Locations
// =============================================================================

/// Pack a file index and byte offset into one location
///
/// Never 0: file indexes start at 1.
pub fn data_location(file_index: u32, byte_offset: u64) -> u64 {
    ((file_index as u64) << OFFSET_BITS) | (byte_offset & OFFSET_MASK)
}

/// Like `data_location`, failing instead of dropping high bits
pub fn checked_data_location(file_index: u32, byte_offset: u64) -> Result<u64> {
    if file_index > MAX_FILE_INDEX {
        return Err(StoreError::LocationOverflow(format!(
            "file index {} exceeds {}",
            file_index, MAX_FILE_INDEX
        )));
    }
    if byte_offset > MAX_BYTE_OFFSET {
        return Err(StoreError::LocationOverflow(format!(
            "byte offset {} in file {} exceeds {}",
            byte_offset, file_index, MAX_BYTE_OFFSET
        )));
    }
    Ok(data_location(file_index, byte_offset))
}

pub fn file_index_of(location: u64) -> u32 {
    (location >> OFFSET_BITS) as u32
}

pub fn byte_offset_of(location: u64) -> u64 {
    location & OFFSET_MASK
}

/// Key an item is indexed under (its first 8 bytes)
pub fn item_key(payload: &[u8]) -> Option<u64> {
    payload
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
}

// =============================================================================
// Metadata
// =============================================================================

/// Metadata stored at the head of every data file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileMetadata {
    /// File index within its collection
    pub index: u32,

    /// Replay order; merged files take the highest sequence of their inputs
    pub sequence: u64,

    /// Creation time, unix nanoseconds
    pub creation_nanos: u64,

    /// Number of items, 0 until the file is closed
    pub item_count: u64,

    /// Serialization version of the payloads
    pub serialization_version: u64,

    /// 0 for freshly written files, +1 per merge
    pub compaction_level: u8,

    /// Smallest key valid when the file was closed
    pub min_valid_key: u64,

    /// Largest key valid when the file was closed
    pub max_valid_key: u64,
}

impl DataFileMetadata {
    pub fn new(index: u32, sequence: u64, compaction_level: u8) -> Self {
        let creation_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            index,
            sequence,
            creation_nanos,
            item_count: 0,
            serialization_version: 1,
            compaction_level: compaction_level.min(MAX_COMPACTION_LEVEL),
            min_valid_key: 0,
            max_valid_key: u64::MAX,
        }
    }
}

// =============================================================================
// File Naming
// =============================================================================

/// "{dir}/{name}_{index:06}.vmdf"
pub(crate) fn data_file_path(dir: &Path, name: &str, index: u32) -> PathBuf {
    dir.join(format!("{}_{:06}.{}", name, index, FILE_EXTENSION))
}

pub(crate) fn temp_file_path(dir: &Path, name: &str, index: u32) -> PathBuf {
    dir.join(format!("{}_{:06}.{}", name, index, TEMP_EXTENSION))
}

/// "pathToKeyHashValue_000042.vmdf" → Some(42) for name "pathToKeyHashValue"
pub(crate) fn parse_file_index(path: &Path, name: &str) -> Option<u32> {
    let file_name = path.file_name()?.to_str()?;
    let rest = file_name.strip_prefix(name)?.strip_prefix('_')?;
    let id = rest.strip_suffix(FILE_EXTENSION)?.strip_suffix('.')?;
    id.parse().ok()
}
