//! Tests for the key → path index
//!
//! These tests verify:
//! - Direct mode lookups and numeric key requirement
//! - Hashed mode lookups, overwrites and collisions
//! - Bucket directory rebuild from bucket files
//! - Bucket file merging

use tempfile::TempDir;
use vmstore::keyindex::{bucket_count, BucketIndex, KeyToPath};
use vmstore::{BytesKey, Config, KeyIndexMode, LongKey, MergeConfig, MergeFilter, StoreError, INVALID_PATH};

// =============================================================================
// Helper Functions
// =============================================================================

fn key(s: &str) -> BytesKey {
    BytesKey(s.as_bytes().to_vec())
}

fn setup_hashed(temp_dir: &TempDir, max_keys: u64) -> BucketIndex {
    BucketIndex::open(temp_dir.path(), max_keys, 64, 0).unwrap()
}

// =============================================================================
// Direct Mode Tests
// =============================================================================

#[test]
fn test_direct_put_get() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .storage_dir(temp_dir.path())
        .key_index(KeyIndexMode::Direct { max_keys: 1000 })
        .index_chunk_size(64)
        .build();
    let index = KeyToPath::open(&config).unwrap();

    index
        .put_batch(&[(LongKey(77), 10), (LongKey(78), 11), (LongKey(77), 12)])
        .unwrap();

    assert!(index.is_direct());
    assert_eq!(index.get(&LongKey(77), INVALID_PATH).unwrap(), 12);
    assert_eq!(index.get(&LongKey(78), INVALID_PATH).unwrap(), 11);
    assert_eq!(index.get(&LongKey(79), INVALID_PATH).unwrap(), INVALID_PATH);
}

#[test]
fn test_direct_rejects_non_numeric_keys() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .storage_dir(temp_dir.path())
        .key_index(KeyIndexMode::Direct { max_keys: 1000 })
        .index_chunk_size(64)
        .build();
    let index = KeyToPath::open(&config).unwrap();

    let result = index.put_batch(&[(key("alpha"), 3)]);
    assert!(matches!(result, Err(StoreError::ContractViolation(_))));
}

// =============================================================================
// Hashed Mode Tests
// =============================================================================

#[test]
fn test_hashed_put_get() {
    let temp_dir = TempDir::new().unwrap();
    let index = setup_hashed(&temp_dir, 1024);

    index
        .put_batch(&[(key("alpha"), 3), (key("beta"), 4), (key("gamma"), 5)])
        .unwrap();

    assert_eq!(index.get(&key("alpha"), INVALID_PATH).unwrap(), 3);
    assert_eq!(index.get(&key("beta"), INVALID_PATH).unwrap(), 4);
    assert_eq!(index.get(&key("gamma"), INVALID_PATH).unwrap(), 5);
    assert_eq!(index.get(&key("delta"), INVALID_PATH).unwrap(), INVALID_PATH);
}

#[test]
fn test_hashed_overwrite_across_batches() {
    let temp_dir = TempDir::new().unwrap();
    let index = setup_hashed(&temp_dir, 1024);

    index.put_batch(&[(key("alpha"), 3), (key("beta"), 4)]).unwrap();
    index.put_batch(&[(key("alpha"), 9)]).unwrap();

    assert_eq!(index.get(&key("alpha"), INVALID_PATH).unwrap(), 9);
    assert_eq!(index.get(&key("beta"), INVALID_PATH).unwrap(), 4);
}

#[test]
fn test_hashed_many_keys_share_buckets() {
    let temp_dir = TempDir::new().unwrap();
    // One bucket, everything collides
    let index = setup_hashed(&temp_dir, 10);
    assert_eq!(index.num_buckets(), 1);

    let entries: Vec<_> = (0..200u64).map(|i| (key(&format!("key-{}", i)), i + 1)).collect();
    index.put_batch(&entries).unwrap();

    for (k, path) in &entries {
        assert_eq!(index.get(k, INVALID_PATH).unwrap(), *path);
    }
}

#[test]
fn test_hashed_writing_session() {
    let temp_dir = TempDir::new().unwrap();
    let index = setup_hashed(&temp_dir, 1024);

    assert!(matches!(
        index.put(&key("alpha"), 1),
        Err(StoreError::WritingSession(_))
    ));

    index.start_writing().unwrap();
    assert!(index.start_writing().is_err());
    index.put(&key("alpha"), 1).unwrap();

    // Buffered until the session ends
    assert_eq!(index.get(&key("alpha"), INVALID_PATH).unwrap(), INVALID_PATH);
    index.end_writing().unwrap();
    assert_eq!(index.get(&key("alpha"), INVALID_PATH).unwrap(), 1);
}

#[test]
fn test_hashed_rebuild_on_open() {
    let temp_dir = TempDir::new().unwrap();
    {
        let index = setup_hashed(&temp_dir, 1024);
        index.put_batch(&[(key("alpha"), 3), (key("beta"), 4)]).unwrap();
        index.put_batch(&[(key("beta"), 8)]).unwrap();
    }

    let index = setup_hashed(&temp_dir, 1024);

    assert_eq!(index.get(&key("alpha"), INVALID_PATH).unwrap(), 3);
    assert_eq!(index.get(&key("beta"), INVALID_PATH).unwrap(), 8);
}

#[test]
fn test_hashed_merge_keeps_entries() {
    let temp_dir = TempDir::new().unwrap();
    let index = setup_hashed(&temp_dir, 64);

    for round in 0..5u64 {
        let entries: Vec<_> = (0..20u64)
            .map(|i| (key(&format!("k{}", i)), round * 100 + i + 1))
            .collect();
        index.put_batch(&entries).unwrap();
    }
    assert_eq!(index.files().file_count(), 5);

    let report = index.merge(MergeFilter::Full, &MergeConfig::default()).unwrap();

    assert_eq!(report.files_merged, 5);
    assert_eq!(index.files().file_count(), 1);
    for i in 0..20u64 {
        assert_eq!(index.get(&key(&format!("k{}", i)), INVALID_PATH).unwrap(), 400 + i + 1);
    }
}

#[test]
fn test_bucket_count_power_of_two() {
    for max_keys in [1u64, 100, 1000, 123_456, 1 << 30] {
        let n = bucket_count(max_keys);
        assert!(n.is_power_of_two());
        assert!(n >= max_keys / 32);
    }
}
