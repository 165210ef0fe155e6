//! Data File Reader
//!
//! Positional reads of closed data files. Reads never move a shared cursor,
//! so one reader serves any number of threads without locking.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{Result, StoreError};

use super::iterator::DataFileIterator;
use super::{
    byte_offset_of, DataFileMetadata, FORMAT_VERSION, ITEM_HEADER_SIZE, MAGIC, MAX_ITEM_SIZE,
    PREAMBLE_SIZE,
};

/// Reader for a closed, immutable data file
#[derive(Debug)]
pub struct DataFileReader {
    path: PathBuf,
    file: File,
    metadata: DataFileMetadata,
    /// Offset of the first item
    data_start: u64,
    file_size: u64,
}

impl DataFileReader {
    /// Open a data file and validate its header
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let mut preamble = [0u8; PREAMBLE_SIZE as usize];
        file.read_exact(&mut preamble)?;

        if &preamble[0..4] != MAGIC {
            return Err(StoreError::Corruption(format!(
                "Invalid data file magic in {}: expected VMDF, got {:?}",
                path.display(),
                &preamble[0..4]
            )));
        }

        let version = u16::from_le_bytes([preamble[4], preamble[5]]);
        if version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedFormatVersion {
                found: version as u32,
                supported: FORMAT_VERSION as u32,
            });
        }

        let metadata_len =
            u32::from_le_bytes([preamble[6], preamble[7], preamble[8], preamble[9]]) as u64;
        if PREAMBLE_SIZE + metadata_len > file_size {
            return Err(StoreError::Corruption(format!(
                "Data file {} is shorter than its header",
                path.display()
            )));
        }

        let mut encoded = vec![0u8; metadata_len as usize];
        file.read_exact(&mut encoded)?;
        let metadata: DataFileMetadata = bincode::deserialize(&encoded)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            metadata,
            data_start: PREAMBLE_SIZE + metadata_len,
            file_size,
        })
    }

    /// Read the item stored at `location`
    ///
    /// The location's file index is not checked; callers route locations to
    /// the right reader.
    pub fn read_item(&self, location: u64) -> Result<Bytes> {
        let offset = byte_offset_of(location);
        if offset < self.data_start || offset + ITEM_HEADER_SIZE > self.file_size {
            return Err(StoreError::Corruption(format!(
                "Location offset {} is outside the items of {}",
                offset,
                self.path.display()
            )));
        }

        let mut header = [0u8; ITEM_HEADER_SIZE as usize];
        read_exact_at(&self.file, &mut header, offset)?;
        let (len, crc) = parse_item_header(&header, &self.path)?;

        let mut payload = vec![0u8; len as usize];
        read_exact_at(&self.file, &mut payload, offset + ITEM_HEADER_SIZE)?;
        verify_crc(&payload, crc, &self.path, offset)?;

        Ok(Bytes::from(payload))
    }

    /// Iterate over every item in write order
    pub fn iter(&self) -> Result<DataFileIterator> {
        DataFileIterator::new(&self.path, self.metadata.index, self.data_start, self.file_size)
    }

    pub fn metadata(&self) -> &DataFileMetadata {
        &self.metadata
    }

    pub fn index(&self) -> u32 {
        self.metadata.index
    }

    /// File size in bytes
    pub fn size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Split an item header into (payload length, crc)
pub(super) fn parse_item_header(header: &[u8; 8], path: &Path) -> Result<(u32, u32)> {
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_ITEM_SIZE {
        return Err(StoreError::Corruption(format!(
            "Item length {} in {} exceeds the {} byte limit",
            len,
            path.display(),
            MAX_ITEM_SIZE
        )));
    }
    Ok((len, crc))
}

pub(super) fn verify_crc(payload: &[u8], expected: u32, path: &Path, offset: u64) -> Result<()> {
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(StoreError::Corruption(format!(
            "CRC mismatch for item at offset {} in {}: expected {:08x}, got {:08x}",
            offset,
            path.display(),
            expected,
            actual
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
