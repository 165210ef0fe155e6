//! Tests for DataSource
//!
//! These tests verify:
//! - Single-record and batched commits
//! - Key based reads in both key index modes
//! - Rejected keys leave no leaf behind
//! - Stale key detection
//! - Lifecycle (open/close) and state checks
//! - Concurrent readers and committers
//! - Manual and background compaction

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use vmstore::{
    BytesKey, BytesValue, Config, DataSource, DigestType, Hash, InternalRecord, KeyIndexMode,
    LeafRecord, LongKey, MergeConfig, MergeFilter, State, StoreError,
};

type LongSource = DataSource<LongKey, BytesValue>;
type BytesSource = DataSource<BytesKey, BytesValue>;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(temp_dir: &TempDir, key_index: KeyIndexMode) -> Config {
    Config::builder()
        .storage_dir(temp_dir.path())
        .key_index(key_index)
        .max_paths(100_000)
        .index_chunk_size(256)
        .reserved_buffer_length(0)
        .disable_merging()
        .shutdown_timeout(Duration::from_secs(10))
        .build()
}

fn setup_temp_source() -> (TempDir, LongSource) {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir, KeyIndexMode::Direct { max_keys: 100_000 });
    let source = DataSource::open(config).unwrap();
    (temp_dir, source)
}

fn setup_hashed_source() -> (TempDir, BytesSource) {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir, KeyIndexMode::Hashed { max_keys: 4096 });
    let source = DataSource::open(config).unwrap();
    (temp_dir, source)
}

fn hash(fill: u8) -> Hash {
    Hash::new(DigestType::Sha384, vec![fill; 48]).unwrap()
}

fn value(s: &str) -> BytesValue {
    BytesValue(s.as_bytes().to_vec())
}

/// Leaves of a tree with `count` leaves, keyed `key_base + i`
fn tree_leaves(count: u64, key_base: u64, tag: &str) -> (u64, u64, Vec<LeafRecord<LongKey, BytesValue>>) {
    let first = count - 1;
    let last = 2 * count - 2;
    let leaves = (first..=last)
        .map(|p| {
            let key = key_base + p - first;
            LeafRecord::new(p, LongKey(key), hash(p as u8), value(&format!("{}-{}", tag, key)))
        })
        .collect();
    (first, last, leaves)
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_open_creates_directory() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("store");
    let config = Config::builder()
        .storage_dir(&dir)
        .key_index(KeyIndexMode::Direct { max_keys: 1000 })
        .max_paths(1000)
        .index_chunk_size(64)
        .disable_merging()
        .build();

    let source: LongSource = DataSource::open(config).unwrap();

    assert!(dir.exists());
    assert_eq!(source.state(), State::Open);
}

#[test]
fn test_add_leaf_then_load_by_key() {
    let (_temp, source) = setup_temp_source();

    source.add_leaf(10, LongKey(77), value("V"), hash(1)).unwrap();

    assert_eq!(source.load_leaf_value_for_key(&LongKey(77)).unwrap(), Some(value("V")));
    assert_eq!(source.load_leaf_path(&LongKey(77)).unwrap(), Some(10));
    assert_eq!(source.load_leaf_hash(10).unwrap(), Some(hash(1)));
    assert_eq!(source.load_leaf_key(10).unwrap(), Some(LongKey(77)));
    assert_eq!(
        source.load_leaf_record_for_key(&LongKey(77)).unwrap(),
        Some(LeafRecord::new(10, LongKey(77), hash(1), value("V")))
    );
}

#[test]
fn test_unknown_key() {
    let (_temp, source) = setup_temp_source();
    source.add_leaf(1, LongKey(5), value("x"), hash(1)).unwrap();

    assert_eq!(source.load_leaf_record_for_key(&LongKey(6)).unwrap(), None);
    assert_eq!(source.load_leaf_path(&LongKey(6)).unwrap(), None);
    assert_eq!(source.load_leaf_record(2).unwrap(), None);
}

#[test]
fn test_sequential_commits() {
    let (_temp, source) = setup_temp_source();

    let (first, last, leaves) = tree_leaves(8, 100, "g1");
    source.save_records(first, last, Vec::new(), leaves).unwrap();

    let (first, last, leaves) = tree_leaves(8, 100, "g2");
    source
        .save_records(first, last, Vec::new(), leaves[..4].to_vec())
        .unwrap();

    for (i, p) in (first..=last).enumerate() {
        let key = 100 + i as u64;
        let tag = if i < 4 { "g2" } else { "g1" };
        let record = source.load_leaf_record(p).unwrap().unwrap();
        assert_eq!(record.key, LongKey(key));
        assert_eq!(record.value, value(&format!("{}-{}", tag, key)));
        assert_eq!(source.load_leaf_path(&LongKey(key)).unwrap(), Some(p));
    }
}

#[test]
fn test_internal_hashes() {
    let (_temp, source) = setup_temp_source();

    let (first, last, leaves) = tree_leaves(4, 1, "v");
    let internals = (0..first).map(|p| InternalRecord::new(p, hash(200 + p as u8))).collect();
    source.save_records(first, last, internals, leaves).unwrap();
    source.save_internal(1, hash(9)).unwrap();

    assert_eq!(source.load_internal_hash(0).unwrap(), Some(hash(200)));
    assert_eq!(source.load_internal_hash(1).unwrap(), Some(hash(9)));
    assert_eq!(source.load_internal_hash(2).unwrap(), Some(hash(202)));
    assert_eq!(source.load_internal_hash(3).unwrap(), None);
    assert_eq!(source.stats().leaf_range, Some((first, last)));
}

#[test]
fn test_update_leaf() {
    let (_temp, source) = setup_temp_source();
    source.add_leaf(3, LongKey(1), value("before"), hash(1)).unwrap();

    source.update_leaf(3, LongKey(1), value("after"), hash(2)).unwrap();

    assert_eq!(source.load_leaf_value(3).unwrap(), Some(value("after")));
    assert_eq!(source.load_leaf_hash(3).unwrap(), Some(hash(2)));
}

#[test]
fn test_move_leaf() {
    let (_temp, source) = setup_temp_source();
    source.add_leaf(1, LongKey(42), value("payload"), hash(1)).unwrap();

    source.move_leaf(1, 3, LongKey(42), hash(3)).unwrap();

    assert_eq!(source.load_leaf_path(&LongKey(42)).unwrap(), Some(3));
    assert_eq!(source.load_leaf_value(3).unwrap(), Some(value("payload")));
    assert_eq!(source.load_leaf_hash(3).unwrap(), Some(hash(3)));
}

#[test]
fn test_move_missing_leaf() {
    let (_temp, source) = setup_temp_source();

    let result = source.move_leaf(1, 2, LongKey(1), hash(1));

    assert!(matches!(result, Err(StoreError::ContractViolation(_))));
}

#[test]
fn test_unsorted_batch_writes_nothing() {
    let (_temp, source) = setup_temp_source();
    let leaves = vec![
        LeafRecord::new(4, LongKey(1), hash(1), value("a")),
        LeafRecord::new(3, LongKey(2), hash(2), value("b")),
    ];

    let result = source.save_records(3, 4, vec![InternalRecord::new(1, hash(5))], leaves);

    assert!(matches!(result, Err(StoreError::UnsortedBatch { previous: 4, path: 3 })));
    assert_eq!(source.stats().leaf_files, 0);
    assert_eq!(source.load_internal_hash(1).unwrap(), None);
    assert_eq!(source.load_leaf_path(&LongKey(1)).unwrap(), None);
    assert_eq!(source.state(), State::Open);
}

#[test]
fn test_non_numeric_key_in_direct_mode() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir, KeyIndexMode::Direct { max_keys: 1000 });
    let source: BytesSource = DataSource::open(config).unwrap();

    let result = source.add_leaf(1, BytesKey(b"text".to_vec()), value("v"), hash(1));

    assert!(matches!(result, Err(StoreError::ContractViolation(_))));
    assert!(source.load_leaf_record(1).unwrap().is_none());
    assert_eq!(source.stats().leaf_files, 0);
    // The source stays usable
    assert_eq!(source.state(), State::Open);
}

#[test]
fn test_key_beyond_max_keys_writes_nothing() {
    let (_temp, source) = setup_temp_source();

    let result = source.add_leaf(3, LongKey(200_000), value("v"), hash(3));

    assert!(matches!(
        result,
        Err(StoreError::IndexOutOfBounds { index: 200_000, .. })
    ));
    assert!(source.load_leaf_record(3).unwrap().is_none());
    assert_eq!(source.stats().leaf_range, None);

    source.add_leaf(3, LongKey(7), value("v"), hash(3)).unwrap();
    assert_eq!(source.load_leaf_path(&LongKey(7)).unwrap(), Some(3));
}

#[test]
fn test_save_internal_on_empty_store() {
    let (_temp, source) = setup_temp_source();

    source.save_internal(0, hash(9)).unwrap();

    let stats = source.stats();
    assert_eq!(stats.leaf_files, 0);
    assert_eq!(stats.leaf_range, None);
    assert_eq!(source.load_internal_hash(0).unwrap(), Some(hash(9)));
}

// =============================================================================
// Key Index Tests
// =============================================================================

#[test]
fn test_hashed_mode_lookups() {
    let (_temp, source) = setup_hashed_source();

    let leaves: Vec<_> = (7..=14u64)
        .map(|p| {
            LeafRecord::new(
                p,
                BytesKey(format!("account-{}", p).into_bytes()),
                hash(p as u8),
                value(&format!("balance-{}", p)),
            )
        })
        .collect();
    source.save_records(7, 14, Vec::new(), leaves).unwrap();

    for p in 7..=14u64 {
        let key = BytesKey(format!("account-{}", p).into_bytes());
        assert_eq!(source.load_leaf_path(&key).unwrap(), Some(p));
        assert_eq!(
            source.load_leaf_value_for_key(&key).unwrap(),
            Some(value(&format!("balance-{}", p)))
        );
    }
    assert_eq!(source.load_leaf_path(&BytesKey(b"nobody".to_vec())).unwrap(), None);
    assert!(source.stats().bucket_files > 0);
}

#[test]
fn test_stale_key_entry_reads_none() {
    let (_temp, source) = setup_temp_source();

    source.add_leaf(2, LongKey(5), value("five"), hash(5)).unwrap();
    // Another key takes over path 2, key 5 still points there
    source.add_leaf(2, LongKey(6), value("six"), hash(6)).unwrap();

    assert_eq!(source.load_leaf_record_for_key(&LongKey(5)).unwrap(), None);
    assert_eq!(source.load_leaf_value_for_key(&LongKey(5)).unwrap(), None);
    assert_eq!(source.load_leaf_path(&LongKey(5)).unwrap(), None);
    assert_eq!(source.load_leaf_path(&LongKey(6)).unwrap(), Some(2));
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_closed_source_rejects_calls() {
    let (_temp, source) = setup_temp_source();
    source.add_leaf(1, LongKey(1), value("v"), hash(1)).unwrap();

    source.close().unwrap();

    assert_eq!(source.state(), State::Closed);
    assert!(matches!(
        source.add_leaf(1, LongKey(1), value("v"), hash(1)),
        Err(StoreError::Closed)
    ));
    assert!(matches!(source.load_leaf_record(1), Err(StoreError::Closed)));
    assert!(matches!(source.load_internal_hash(0), Err(StoreError::Closed)));
    assert!(matches!(source.compact(MergeFilter::Full), Err(StoreError::Closed)));
    assert!(matches!(source.close(), Err(StoreError::Closed)));
}

#[test]
fn test_invalid_config_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .storage_dir(temp_dir.path())
        .max_paths(0)
        .build();

    let result: vmstore::Result<LongSource> = DataSource::open(config);

    assert!(matches!(result, Err(StoreError::Config(_))));
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_readers_during_commits() {
    let (_temp, source) = setup_temp_source();
    let source = Arc::new(source);

    let (first, last, leaves) = tree_leaves(64, 1, "base");
    source.save_records(first, last, Vec::new(), leaves).unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let source = Arc::clone(&source);
            thread::spawn(move || {
                for _ in 0..20 {
                    for p in first..=last {
                        let record = source.load_leaf_record(p).unwrap().unwrap();
                        assert_eq!(record.path, p);
                    }
                }
            })
        })
        .collect();

    for round in 0..10 {
        let (first, last, leaves) = tree_leaves(64, 1, &format!("round{}", round));
        source.save_records(first, last, Vec::new(), leaves).unwrap();
    }

    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(
        source.load_leaf_value_for_key(&LongKey(1)).unwrap(),
        Some(value("round9-1"))
    );
}

#[test]
fn test_overlapping_commits() {
    let (_temp, source) = setup_temp_source();
    let source = Arc::new(source);

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let source = Arc::clone(&source);
            thread::spawn(move || {
                let mut committed = 0;
                for _ in 0..20 {
                    let (first, last, leaves) = tree_leaves(32, 1, &format!("w{}", t));
                    match source.save_records(first, last, Vec::new(), leaves) {
                        Ok(()) => committed += 1,
                        Err(StoreError::ConcurrentCommit) => {}
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
                committed
            })
        })
        .collect();

    let committed: u32 = writers.into_iter().map(|w| w.join().unwrap()).sum();

    assert!(committed >= 1);
    assert_eq!(source.state(), State::Open);
    assert!(source.load_leaf_record(31).unwrap().is_some());
}

// =============================================================================
// Compaction Tests
// =============================================================================

#[test]
fn test_commits_during_compaction() {
    let (_temp, source) = setup_temp_source();
    let source = Arc::new(source);
    let stop = Arc::new(AtomicBool::new(false));

    let merger = {
        let source = Arc::clone(&source);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                source.compact(MergeFilter::Full).unwrap();
            }
        })
    };

    for p in 1..=300u64 {
        source
            .add_leaf(p, LongKey(p), value(&format!("v{}", p)), hash(p as u8))
            .unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    merger.join().unwrap();

    for p in 1..=300u64 {
        let record = source.load_leaf_record(p).unwrap().unwrap();
        assert_eq!(record.key, LongKey(p));
        assert_eq!(record.value, value(&format!("v{}", p)));
    }
}

#[test]
fn test_manual_compaction() {
    let (_temp, source) = setup_hashed_source();

    for round in 0..5u8 {
        let leaves: Vec<_> = (3..=6u64)
            .map(|p| {
                LeafRecord::new(
                    p,
                    BytesKey(vec![p as u8]),
                    hash(round),
                    value(&format!("r{}", round)),
                )
            })
            .collect();
        source.save_records(3, 6, Vec::new(), leaves).unwrap();
    }
    let before = source.stats();
    assert_eq!(before.leaf_files, 5);
    assert_eq!(before.bucket_files, 5);

    let merged = source.compact(MergeFilter::Full).unwrap();

    let after = source.stats();
    assert_eq!(merged, 10);
    assert_eq!(after.leaf_files, 1);
    assert_eq!(after.bucket_files, 1);
    assert!(after.leaf_bytes < before.leaf_bytes);
    for p in 3..=6u64 {
        let record = source.load_leaf_record_for_key(&BytesKey(vec![p as u8])).unwrap().unwrap();
        assert_eq!(record.path, p);
        assert_eq!(record.value, value("r4"));
        assert_eq!(record.hash, hash(4));
    }
}

#[test]
fn test_background_merging() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .storage_dir(temp_dir.path())
        .key_index(KeyIndexMode::Direct { max_keys: 1000 })
        .max_paths(1000)
        .index_chunk_size(64)
        .merge(MergeConfig {
            initial_delay: Duration::from_millis(20),
            period: Duration::from_millis(20),
            ..MergeConfig::default()
        })
        .build();
    let source: LongSource = DataSource::open(config).unwrap();

    for round in 0..5 {
        let (first, last, leaves) = tree_leaves(8, 1, &format!("r{}", round));
        source.save_records(first, last, Vec::new(), leaves).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while source.stats().leaf_files > 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(source.stats().leaf_files, 1);
    for key in 1..=8u64 {
        assert_eq!(
            source.load_leaf_value_for_key(&LongKey(key)).unwrap(),
            Some(value(&format!("r4-{}", key)))
        );
    }
    source.close().unwrap();
}
