//! Tests for merging data files
//!
//! These tests verify:
//! - Merges keep the newest copy of every live item
//! - Superseded files are deleted
//! - Items outside the valid range or no longer indexed are dropped
//! - Files whose locations are not indexed yet are never merged
//! - The newest file's valid range outlives a merge
//! - Merge filters and the merge cadence

use std::time::{Duration, Instant};

use tempfile::TempDir;
use vmstore::collections::LongIndex;
use vmstore::datafile::{file_index_of, DataFileCollection, KeyRange, MergeFilter, MergePolicy};
use vmstore::MergeConfig;

const NAME: &str = "mergeStore";
const GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Helper Functions
// =============================================================================

fn item(key: u64, body: &[u8]) -> Vec<u8> {
    let mut payload = key.to_le_bytes().to_vec();
    payload.extend_from_slice(body);
    payload
}

/// Write one file and point the index at every item
fn write_indexed(
    collection: &DataFileCollection,
    index: &LongIndex,
    keys: impl IntoIterator<Item = u64>,
    tag: &str,
    range: (u64, u64),
) {
    collection.start_writing().unwrap();
    let locations: Vec<_> = keys
        .into_iter()
        .map(|key| {
            let body = format!("{}-{}", tag, key);
            (key, collection.store_data_item(&item(key, body.as_bytes())).unwrap())
        })
        .collect();
    let file = collection.end_writing(range.0, range.1).unwrap();
    for (key, location) in locations {
        index.put(key, location).unwrap();
    }
    collection.mark_indexed(file.index());
}

fn body_of(collection: &DataFileCollection, index: &LongIndex, key: u64) -> Option<String> {
    collection
        .read_by_key(index, key)
        .unwrap()
        .map(|payload| String::from_utf8(payload[8..].to_vec()).unwrap())
}

// =============================================================================
// Merge Tests
// =============================================================================

#[test]
fn test_merge_keeps_latest_and_deletes_inputs() {
    let temp_dir = TempDir::new().unwrap();
    let collection = DataFileCollection::open(temp_dir.path(), NAME).unwrap();
    let index = LongIndex::new(64, 1024, 0).unwrap();

    write_indexed(&collection, &index, 1..=10, "a", (0, u64::MAX));
    write_indexed(&collection, &index, 5..=15, "b", (0, u64::MAX));
    let inputs = collection.files();
    let input_paths: Vec<_> = inputs.iter().map(|f| f.path().to_path_buf()).collect();

    let report = collection.merge(&inputs, &index).unwrap();

    assert_eq!(report.files_merged, 2);
    assert_eq!(report.items_copied, 15);
    assert_eq!(report.items_repointed, 15);
    assert_eq!(collection.file_count(), 1);
    assert!(input_paths.iter().all(|p| !p.exists()));

    let merged = &collection.files()[0];
    assert_eq!(Some(merged.index()), report.new_file_index);
    assert_eq!(merged.metadata().compaction_level, 1);
    assert_eq!(merged.metadata().sequence, 2);
    assert_eq!(merged.metadata().item_count, 15);

    for key in 1..=15u64 {
        let expected = if key < 5 { format!("a-{}", key) } else { format!("b-{}", key) };
        assert_eq!(body_of(&collection, &index, key), Some(expected));
        assert_eq!(file_index_of(index.get(key).unwrap()), merged.index());
    }
}

#[test]
fn test_merge_drops_keys_outside_valid_range() {
    let temp_dir = TempDir::new().unwrap();
    let collection = DataFileCollection::open(temp_dir.path(), NAME).unwrap();
    let index = LongIndex::new(64, 1024, 0).unwrap();

    write_indexed(&collection, &index, 1..=10, "a", (1, 10));
    write_indexed(&collection, &index, 8..=10, "b", (5, 10));

    let report = collection.merge(&collection.files(), &index).unwrap();

    assert_eq!(report.items_copied, 6);
    assert_eq!(body_of(&collection, &index, 5), Some("a-5".to_string()));
    assert_eq!(body_of(&collection, &index, 9), Some("b-9".to_string()));
}

#[test]
fn test_merge_skips_items_indexed_elsewhere() {
    let temp_dir = TempDir::new().unwrap();
    let collection = DataFileCollection::open(temp_dir.path(), NAME).unwrap();
    let index = LongIndex::new(64, 1024, 0).unwrap();

    write_indexed(&collection, &index, [1, 2], "a", (0, u64::MAX));
    write_indexed(&collection, &index, [1], "b", (0, u64::MAX));
    write_indexed(&collection, &index, [3], "c", (0, u64::MAX));
    let files = collection.files();
    let newest_of_key_1 = index.get(1).unwrap();

    // Merge the first and last files, leaving the middle one alone
    let report = collection.merge(&[files[0].clone(), files[2].clone()], &index).unwrap();

    assert_eq!(report.items_copied, 2);
    assert_eq!(index.get(1).unwrap(), newest_of_key_1);
    assert_eq!(body_of(&collection, &index, 1), Some("b-1".to_string()));
    assert_eq!(body_of(&collection, &index, 2), Some("a-2".to_string()));
    assert_eq!(body_of(&collection, &index, 3), Some("c-3".to_string()));
    assert_eq!(collection.file_count(), 2);
}

#[test]
fn test_merge_of_dead_files_leaves_no_file() {
    let temp_dir = TempDir::new().unwrap();
    let collection = DataFileCollection::open(temp_dir.path(), NAME).unwrap();
    let index = LongIndex::new(64, 1024, 0).unwrap();

    write_indexed(&collection, &index, [1], "a", (0, u64::MAX));
    write_indexed(&collection, &index, [1], "b", (0, u64::MAX));
    write_indexed(&collection, &index, [1], "c", (0, u64::MAX));
    let files = collection.files();

    let report = collection.merge(&files[..2], &index).unwrap();

    assert_eq!(report.files_merged, 2);
    assert_eq!(report.items_copied, 0);
    assert_eq!(report.new_file_index, None);
    assert_eq!(collection.file_count(), 1);
    assert_eq!(body_of(&collection, &index, 1), Some("c-1".to_string()));
}

#[test]
fn test_merge_of_dead_files_keeps_newest_range() {
    let temp_dir = TempDir::new().unwrap();
    {
        let collection = DataFileCollection::open(temp_dir.path(), NAME).unwrap();
        let index = LongIndex::new(64, 1024, 0).unwrap();

        write_indexed(&collection, &index, [1], "a", (1, 1));
        write_indexed(&collection, &index, 1..=20, "b", (1, 20));
        // A generation that only shrinks the range
        write_indexed(&collection, &index, std::iter::empty(), "c", (1, 10));
        let files = collection.files();

        let report = collection.merge(&[files[0].clone(), files[2].clone()], &index).unwrap();

        assert_eq!(report.items_copied, 0);
        assert!(report.new_file_index.is_some());
        assert_eq!(collection.file_count(), 2);
    }

    let collection = DataFileCollection::open(temp_dir.path(), NAME).unwrap();
    assert_eq!(collection.valid_key_range(), KeyRange::new(1, 10));
}

#[test]
fn test_merge_skips_files_not_yet_indexed() {
    let temp_dir = TempDir::new().unwrap();
    let collection = DataFileCollection::open(temp_dir.path(), NAME).unwrap();
    let index = LongIndex::new(64, 1024, 0).unwrap();

    write_indexed(&collection, &index, [1], "a", (0, u64::MAX));
    write_indexed(&collection, &index, [2], "b", (0, u64::MAX));

    // Closed, but its location is not in the index yet
    collection.start_writing().unwrap();
    let location = collection.store_data_item(&item(3, b"c-3")).unwrap();
    let file = collection.end_writing(0, u64::MAX).unwrap();
    assert_eq!(collection.mergeable_files().len(), 2);

    let report = collection.merge(&collection.files(), &index).unwrap();

    assert_eq!(report.files_merged, 2);
    assert!(file.path().exists());
    index.put(3, location).unwrap();
    collection.mark_indexed(file.index());

    assert_eq!(body_of(&collection, &index, 3), Some("c-3".to_string()));
    assert_eq!(body_of(&collection, &index, 1), Some("a-1".to_string()));
    assert_eq!(collection.file_count(), 2);
    assert_eq!(collection.mergeable_files().len(), 2);
}

#[test]
fn test_merge_needs_two_files() {
    let temp_dir = TempDir::new().unwrap();
    let collection = DataFileCollection::open(temp_dir.path(), NAME).unwrap();
    let index = LongIndex::new(64, 1024, 0).unwrap();

    write_indexed(&collection, &index, 1..=3, "a", (0, u64::MAX));

    let report = collection.merge(&collection.files(), &index).unwrap();

    assert_eq!(report.files_merged, 0);
    assert_eq!(collection.file_count(), 1);
}

#[test]
fn test_merged_file_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let collection = DataFileCollection::open(temp_dir.path(), NAME).unwrap();
        let index = LongIndex::new(64, 1024, 0).unwrap();
        write_indexed(&collection, &index, 1..=4, "a", (0, u64::MAX));
        write_indexed(&collection, &index, 3..=6, "b", (0, u64::MAX));
        collection.merge(&collection.files(), &index).unwrap();
        write_indexed(&collection, &index, [6], "c", (0, u64::MAX));
    }

    let collection = DataFileCollection::open(temp_dir.path(), NAME).unwrap();
    let index = LongIndex::new(64, 1024, 0).unwrap();
    collection.rebuild_index(&index).unwrap();

    assert_eq!(collection.file_count(), 2);
    assert_eq!(body_of(&collection, &index, 2), Some("a-2".to_string()));
    assert_eq!(body_of(&collection, &index, 4), Some("b-4".to_string()));
    assert_eq!(body_of(&collection, &index, 6), Some("c-6".to_string()));
}

// =============================================================================
// Filter and Policy Tests
// =============================================================================

#[test]
fn test_filter_size_tiers() {
    let config = MergeConfig::default();
    let sizes = [GIB, 3 * GIB, 15 * GIB];

    let small: Vec<_> = sizes.iter().map(|&s| MergeFilter::Small.accepts(s, &config)).collect();
    let medium: Vec<_> = sizes.iter().map(|&s| MergeFilter::Medium.accepts(s, &config)).collect();
    let full: Vec<_> = sizes.iter().map(|&s| MergeFilter::Full.accepts(s, &config)).collect();

    assert_eq!(small, vec![true, false, false]);
    assert_eq!(medium, vec![true, true, false]);
    assert_eq!(full, vec![true, true, true]);
}

#[test]
fn test_filter_selects_files() {
    let temp_dir = TempDir::new().unwrap();
    let collection = DataFileCollection::open(temp_dir.path(), NAME).unwrap();
    let index = LongIndex::new(64, 1024, 0).unwrap();

    write_indexed(&collection, &index, [1], "a", (0, u64::MAX));
    write_indexed(&collection, &index, 2..=200, "b", (0, u64::MAX));
    write_indexed(&collection, &index, [3], "c", (0, u64::MAX));
    let files = collection.files();

    let config = MergeConfig {
        small_merge_cutoff: files[0].size() + 1,
        medium_merge_cutoff: files[1].size() + 1,
        ..MergeConfig::default()
    };

    let small = MergeFilter::Small.select(&files, &config);
    assert_eq!(small.len(), 2);
    assert_eq!(small[0].index(), files[0].index());
    assert_eq!(small[1].index(), files[2].index());
    assert_eq!(MergeFilter::Medium.select(&files, &config).len(), 3);
}

#[test]
fn test_policy_cadence() {
    let config = MergeConfig {
        medium_merge_interval: Duration::from_secs(10),
        full_merge_interval: Duration::from_secs(40),
        ..MergeConfig::default()
    };
    let start = Instant::now();
    let mut policy = MergePolicy::new(config, start);

    let filters: Vec<_> = (1..=8u64)
        .map(|i| policy.next_filter(start + Duration::from_secs(i * 5)))
        .collect();

    assert_eq!(
        filters,
        vec![
            MergeFilter::Small,
            MergeFilter::Medium,
            MergeFilter::Small,
            MergeFilter::Medium,
            MergeFilter::Small,
            MergeFilter::Medium,
            MergeFilter::Small,
            MergeFilter::Full,
        ]
    );
}
