//! Data File Iterator
//!
//! Sequential iteration over all items of a data file.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{Result, StoreError};

use super::data_location;
use super::reader::{parse_item_header, verify_crc};
use super::ITEM_HEADER_SIZE;

/// Iterator over (location, payload) pairs in write order
pub struct DataFileIterator {
    path: PathBuf,
    file: BufReader<File>,
    file_index: u32,
    /// Stop reading at this offset
    end_offset: u64,
    /// Current position in file
    current_offset: u64,
}

impl DataFileIterator {
    /// Open a separate handle positioned at the first item
    pub(super) fn new(path: &Path, file_index: u32, data_start: u64, end_offset: u64) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        file.seek(SeekFrom::Start(data_start))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            file_index,
            end_offset,
            current_offset: data_start,
        })
    }

    fn read_next(&mut self) -> Result<(u64, Bytes)> {
        let mut header = [0u8; ITEM_HEADER_SIZE as usize];
        self.file.read_exact(&mut header)?;
        let (len, crc) = parse_item_header(&header, &self.path)?;

        let mut payload = vec![0u8; len as usize];
        self.file.read_exact(&mut payload)?;
        verify_crc(&payload, crc, &self.path, self.current_offset)?;

        let location = data_location(self.file_index, self.current_offset);
        self.current_offset += ITEM_HEADER_SIZE + len as u64;
        Ok((location, Bytes::from(payload)))
    }
}

impl Iterator for DataFileIterator {
    type Item = Result<(u64, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_offset >= self.end_offset {
            return None;
        }

        match self.read_next() {
            Ok(item) => Some(Ok(item)),
            Err(e) => {
                // Stop after the first bad item
                self.current_offset = self.end_offset;
                Some(Err(match e {
                    StoreError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                        StoreError::Corruption(format!(
                            "Truncated item in {}",
                            self.path.display()
                        ))
                    }
                    other => other,
                }))
            }
        }
    }
}
