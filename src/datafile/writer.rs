//! Data File Writer
//!
//! Appends framed items to a new data file. The file is written under a
//! temporary name and only renamed into place once it is complete, so a
//! crash never leaves a half-written file that looks closed.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

use super::{
    checked_data_location, data_file_path, temp_file_path, DataFileMetadata, FORMAT_VERSION,
    ITEM_HEADER_SIZE, MAGIC, MAX_ITEM_SIZE, PREAMBLE_SIZE,
};

/// Writer for a single data file
pub struct DataFileWriter {
    /// Path while writing
    temp_path: PathBuf,
    /// Path once finished
    final_path: PathBuf,
    /// Buffered writer for performance
    writer: BufWriter<File>,
    /// Metadata, rewritten in place on finish
    metadata: DataFileMetadata,
    /// Current write position
    current_offset: u64,
}

impl DataFileWriter {
    /// Create the file and write its header
    pub fn create(dir: &Path, name: &str, metadata: DataFileMetadata) -> Result<Self> {
        // Fail before touching the disk if no item could be addressed
        checked_data_location(metadata.index, PREAMBLE_SIZE)?;

        let temp_path = temp_file_path(dir, name, metadata.index);
        let final_path = data_file_path(dir, name, metadata.index);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);

        let encoded = bincode::serialize(&metadata)?;
        writer.write_all(MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;

        Ok(Self {
            temp_path,
            final_path,
            writer,
            current_offset: PREAMBLE_SIZE + encoded.len() as u64,
            metadata,
        })
    }

    /// Append one item, returning its location
    pub fn write_item(&mut self, payload: &[u8]) -> Result<u64> {
        if payload.len() as u64 > MAX_ITEM_SIZE as u64 {
            return Err(StoreError::ContractViolation(format!(
                "Data item of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_ITEM_SIZE
            )));
        }

        let location = checked_data_location(self.metadata.index, self.current_offset)?;
        let crc = crc32fast::hash(payload);

        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(payload)?;

        self.current_offset += ITEM_HEADER_SIZE + payload.len() as u64;
        self.metadata.item_count += 1;
        Ok(location)
    }

    /// Finish the file: patch the metadata, sync, and move it into place
    pub fn finish(mut self, min_valid_key: u64, max_valid_key: u64) -> Result<PathBuf> {
        self.metadata.min_valid_key = min_valid_key;
        self.metadata.max_valid_key = max_valid_key;

        self.writer.flush()?;
        let mut file = self.writer.into_inner().map_err(|e| {
            StoreError::Io(e.into_error())
        })?;

        // Fixed-size encoding, so the metadata keeps its length
        let encoded = bincode::serialize(&self.metadata)?;
        file.seek(SeekFrom::Start(PREAMBLE_SIZE))?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.temp_path, &self.final_path)?;
        Ok(self.final_path)
    }

    /// Drop the unfinished file
    pub fn abandon(self) {
        let temp_path = self.temp_path.clone();
        drop(self.writer);
        if let Err(e) = fs::remove_file(&temp_path) {
            tracing::warn!(path = %temp_path.display(), error = %e, "failed to remove abandoned data file");
        }
    }

    pub fn file_index(&self) -> u32 {
        self.metadata.index
    }

    pub fn item_count(&self) -> u64 {
        self.metadata.item_count
    }

    /// Bytes written so far, header included
    pub fn size(&self) -> u64 {
        self.current_offset
    }
}
