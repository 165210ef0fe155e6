//! Bucket codec
//!
//! ```text
//! [bucket id: u64][entry count: u32]
//! per entry: [key hash: u32][path: u64][key version: u32][key len: u32][key bytes]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, StoreError};

/// One key → path mapping inside a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub key_hash: u32,
    pub path: u64,
    pub key_version: u32,
    pub key_bytes: Bytes,
}

impl BucketEntry {
    fn matches(&self, key_hash: u32, key_version: u32, key_bytes: &[u8]) -> bool {
        self.key_hash == key_hash
            && self.key_version == key_version
            && self.key_bytes.as_ref() == key_bytes
    }
}

/// All entries whose key hash falls in one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub id: u64,
    entries: Vec<BucketEntry>,
}

impl Bucket {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            entries: Vec::new(),
        }
    }

    /// Path stored for the key, if any
    pub fn find(&self, key_hash: u32, key_version: u32, key_bytes: &[u8]) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.matches(key_hash, key_version, key_bytes))
            .map(|e| e.path)
    }

    /// Insert or replace the entry for the entry's key
    pub fn put(&mut self, entry: BucketEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.matches(entry.key_hash, entry.key_version, &entry.key_bytes))
        {
            Some(existing) => existing.path = entry.path,
            None => self.entries.push(entry),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> BytesMut {
        let body: usize = self.entries.iter().map(|e| 20 + e.key_bytes.len()).sum();
        let mut out = BytesMut::with_capacity(12 + body);
        out.put_u64_le(self.id);
        out.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            out.put_u32_le(entry.key_hash);
            out.put_u64_le(entry.path);
            out.put_u32_le(entry.key_version);
            out.put_u32_le(entry.key_bytes.len() as u32);
            out.put_slice(&entry.key_bytes);
        }
        out
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.remaining() < 12 {
            return Err(truncated("header"));
        }
        let id = data.get_u64_le();
        let count = data.get_u32_le() as usize;

        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            if data.remaining() < 20 {
                return Err(truncated("entry"));
            }
            let key_hash = data.get_u32_le();
            let path = data.get_u64_le();
            let key_version = data.get_u32_le();
            let key_len = data.get_u32_le() as usize;
            if data.remaining() < key_len {
                return Err(truncated("key"));
            }
            let key_bytes = data.split_to(key_len);
            entries.push(BucketEntry {
                key_hash,
                path,
                key_version,
                key_bytes,
            });
        }

        Ok(Self { id, entries })
    }
}

fn truncated(what: &str) -> StoreError {
    StoreError::Corruption(format!("Bucket {} is truncated", what))
}
