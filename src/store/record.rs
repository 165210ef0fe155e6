//! Leaf payload codec
//!
//! ```text
//! [path u64]
//! [key version u32][key len u32][key bytes]
//! [digest type u32][digest len u32][digest bytes]
//! [value version u32][value len u32][value bytes]
//! ```
//!
//! Parsing only slices the payload; nothing is deserialized until asked for.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, StoreError};
use crate::types::{DigestType, Hash, LeafRecord, VirtualKey, VirtualValue};

/// One `[tag][len][bytes]` field
#[derive(Debug, Clone)]
pub struct Field {
    pub tag: u32,
    pub bytes: Bytes,
}

/// A leaf payload split into its fields
#[derive(Debug, Clone)]
pub struct RawLeaf {
    pub path: u64,
    pub key: Field,
    pub hash: Field,
    pub value: Field,
}

pub fn encode_leaf<K: VirtualKey, V: VirtualValue>(leaf: &LeafRecord<K, V>) -> BytesMut {
    let mut out = BytesMut::with_capacity(128);
    out.put_u64_le(leaf.path);

    put_field(&mut out, leaf.key.version(), |buf| leaf.key.serialize(buf));
    put_field(&mut out, leaf.hash.digest_type().id(), |buf| {
        buf.put_slice(leaf.hash.as_bytes())
    });
    put_field(&mut out, leaf.value.version(), |buf| leaf.value.serialize(buf));
    out
}

/// Write `[tag][len][bytes]`, patching the length once the bytes are known
fn put_field<F: FnOnce(&mut BytesMut)>(out: &mut BytesMut, tag: u32, write: F) {
    out.put_u32_le(tag);
    let len_at = out.len();
    out.put_u32_le(0);
    write(out);
    let len = (out.len() - len_at - 4) as u32;
    out[len_at..len_at + 4].copy_from_slice(&len.to_le_bytes());
}

impl RawLeaf {
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.remaining() < 8 {
            return Err(truncated("path"));
        }
        let path = data.get_u64_le();
        let key = take_field(&mut data, "key")?;
        let hash = take_field(&mut data, "hash")?;
        let value = take_field(&mut data, "value")?;
        Ok(Self {
            path,
            key,
            hash,
            value,
        })
    }

    pub fn key<K: VirtualKey>(&self) -> Result<K> {
        K::deserialize(&self.key.bytes, self.key.tag)
    }

    pub fn hash(&self) -> Result<Hash> {
        Hash::new(DigestType::from_id(self.hash.tag)?, self.hash.bytes.clone())
    }

    pub fn value<V: VirtualValue>(&self) -> Result<V> {
        V::deserialize(&self.value.bytes, self.value.tag)
    }

    /// Whether the stored key serializes the same as `key`
    pub fn has_key<K: VirtualKey>(&self, key: &K) -> bool {
        if self.key.tag != key.version() {
            return false;
        }
        let mut buf = BytesMut::with_capacity(self.key.bytes.len());
        key.serialize(&mut buf);
        buf.as_ref() == self.key.bytes.as_ref()
    }

    pub fn into_record<K: VirtualKey, V: VirtualValue>(self) -> Result<LeafRecord<K, V>> {
        Ok(LeafRecord::new(self.path, self.key()?, self.hash()?, self.value()?))
    }
}

fn take_field(data: &mut Bytes, name: &str) -> Result<Field> {
    if data.remaining() < 8 {
        return Err(truncated(name));
    }
    let tag = data.get_u32_le();
    let len = data.get_u32_le() as usize;
    if data.remaining() < len {
        return Err(truncated(name));
    }
    Ok(Field {
        tag,
        bytes: data.split_to(len),
    })
}

fn truncated(field: &str) -> StoreError {
    StoreError::Corruption(format!("Leaf payload truncated in {} field", field))
}
