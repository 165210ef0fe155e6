//! Core types shared by every store
//!
//! Keys and values are opaque to the engine: they only know how to write
//! themselves into a buffer and how to come back from bytes plus the
//! serialization version they were written with.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, StoreError};

/// Path value meaning "no path"
pub const INVALID_PATH: u64 = u64::MAX;

// =============================================================================
// Hash
// =============================================================================

/// Digest algorithm tag stored next to every hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestType {
    Sha384,
    Sha512,
}

impl DigestType {
    /// Stable numeric id written to disk
    pub fn id(self) -> u32 {
        match self {
            DigestType::Sha384 => 1,
            DigestType::Sha512 => 2,
        }
    }

    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            1 => Ok(DigestType::Sha384),
            2 => Ok(DigestType::Sha512),
            other => Err(StoreError::Corruption(format!(
                "Unknown digest type id {}",
                other
            ))),
        }
    }

    /// Digest length in bytes
    pub fn digest_length(self) -> usize {
        match self {
            DigestType::Sha384 => 48,
            DigestType::Sha512 => 64,
        }
    }
}

/// A fixed-size digest, stored and returned verbatim
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    digest_type: DigestType,
    bytes: Bytes,
}

impl Hash {
    /// Wrap a digest, checking its length against the digest type
    pub fn new(digest_type: DigestType, bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() != digest_type.digest_length() {
            return Err(StoreError::ContractViolation(format!(
                "{:?} digest must be {} bytes, got {}",
                digest_type,
                digest_type.digest_length(),
                bytes.len()
            )));
        }
        Ok(Self { digest_type, bytes })
    }

    pub fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({:?}, ", self.digest_type)?;
        for b in self.bytes.iter().take(6) {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

// =============================================================================
// Keys and Values
// =============================================================================

/// Application key of a leaf
pub trait VirtualKey: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Serialization version written next to the key bytes
    fn version(&self) -> u32;

    /// Append the serialized key to `out`
    fn serialize(&self, out: &mut BytesMut);

    /// Rebuild a key from bytes written with `version`
    fn deserialize(bytes: &[u8], version: u32) -> Result<Self>;

    /// Numeric form of the key, required for direct key indexing
    fn as_long(&self) -> Option<u64> {
        None
    }
}

/// Application payload of a leaf
pub trait VirtualValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    fn version(&self) -> u32;

    fn serialize(&self, out: &mut BytesMut);

    fn deserialize(bytes: &[u8], version: u32) -> Result<Self>;
}

/// Key that is a single number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LongKey(pub u64);

impl VirtualKey for LongKey {
    fn version(&self) -> u32 {
        1
    }

    fn serialize(&self, out: &mut BytesMut) {
        out.put_u64_le(self.0);
    }

    fn deserialize(bytes: &[u8], _version: u32) -> Result<Self> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| {
            StoreError::Serialization(format!("LongKey needs 8 bytes, got {}", bytes.len()))
        })?;
        Ok(LongKey(u64::from_le_bytes(raw)))
    }

    fn as_long(&self) -> Option<u64> {
        Some(self.0)
    }
}

/// Key made of arbitrary bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BytesKey(pub Vec<u8>);

impl VirtualKey for BytesKey {
    fn version(&self) -> u32 {
        1
    }

    fn serialize(&self, out: &mut BytesMut) {
        out.put_slice(&self.0);
    }

    fn deserialize(bytes: &[u8], _version: u32) -> Result<Self> {
        Ok(BytesKey(bytes.to_vec()))
    }
}

/// Value made of arbitrary bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesValue(pub Vec<u8>);

impl VirtualValue for BytesValue {
    fn version(&self) -> u32 {
        1
    }

    fn serialize(&self, out: &mut BytesMut) {
        out.put_slice(&self.0);
    }

    fn deserialize(bytes: &[u8], _version: u32) -> Result<Self> {
        Ok(BytesValue(bytes.to_vec()))
    }
}

// =============================================================================
// Records
// =============================================================================

/// A leaf of the virtual tree
#[derive(Debug, Clone, PartialEq)]
pub struct LeafRecord<K, V> {
    pub path: u64,
    pub key: K,
    pub hash: Hash,
    pub value: V,
}

impl<K: VirtualKey, V: VirtualValue> LeafRecord<K, V> {
    pub fn new(path: u64, key: K, hash: Hash, value: V) -> Self {
        Self {
            path,
            key,
            hash,
            value,
        }
    }
}

/// An internal node of the virtual tree, only its hash is kept
#[derive(Debug, Clone, PartialEq)]
pub struct InternalRecord {
    pub path: u64,
    pub hash: Hash,
}

impl InternalRecord {
    pub fn new(path: u64, hash: Hash) -> Self {
        Self { path, hash }
    }
}
