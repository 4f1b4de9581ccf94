//! Property-based tests for the merge step
//!
//! Uses proptest to check cursor and merge invariants against real redb
//! storage.

use std::collections::BTreeMap;

use peersync_core::{merge_batch, ChangeRecord, SiteId, Storage, Value};
use proptest::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Strategy Generators
// ============================================================================

fn open_storage() -> (Storage, TempDir) {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path().join("peersync.redb")).unwrap();
    (storage, dir)
}

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        "[a-z ]{0,16}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Blob),
    ]
}

/// A change as generated, before its origin is assigned
#[derive(Debug, Clone)]
struct RawChange {
    origin: usize,
    row: u8,
    column: u8,
    value: Value,
    col_version: u64,
    db_version: u64,
}

fn raw_change_strategy(origins: usize) -> impl Strategy<Value = RawChange> {
    (
        0..origins,
        0u8..6,
        0u8..3,
        value_strategy(),
        1u64..20,
        1u64..500,
    )
        .prop_map(|(origin, row, column, value, col_version, db_version)| RawChange {
            origin,
            row,
            column,
            value,
            col_version,
            db_version,
        })
}

fn to_change(raw: &RawChange, origins: &[SiteId]) -> ChangeRecord {
    ChangeRecord {
        table: "set".to_string(),
        row: format!("r{}", raw.row),
        column: format!("c{}", raw.column),
        value: raw.value.clone(),
        col_version: raw.col_version,
        db_version: raw.db_version,
        seq: 0,
        origin: Some(origins[raw.origin]),
    }
}

/// Keep one change per (cell, col_version, origin) so LWW has a single winner
fn unique_stamps(raw: Vec<RawChange>) -> Vec<RawChange> {
    let mut seen = BTreeMap::new();
    for change in raw {
        seen.entry((change.row, change.column, change.col_version, change.origin))
            .or_insert(change);
    }
    seen.into_values().collect()
}

fn cells(storage: &Storage) -> Vec<(String, BTreeMap<String, Value>)> {
    storage
        .list_rows("set")
        .unwrap()
        .into_iter()
        .map(|row| (row.id, row.columns))
        .collect()
}

fn cursors(storage: &Storage) -> Vec<(SiteId, u64)> {
    let mut cursors: Vec<_> = storage
        .list_peers()
        .unwrap()
        .into_iter()
        .map(|p| (p.id, p.version))
        .collect();
    cursors.sort();
    cursors
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The cursor for a peer never decreases and always equals the highest
    /// db_version merged from it
    #[test]
    fn cursor_is_monotonic(batches in prop::collection::vec(
        prop::collection::vec(1u64..1000, 1..8),
        1..10,
    )) {
        let (storage, _dir) = open_storage();
        let peer = SiteId::random();
        let mut expected = 0u64;
        let mut previous = 0u64;

        for (n, versions) in batches.iter().enumerate() {
            let batch: Vec<ChangeRecord> = versions
                .iter()
                .enumerate()
                .map(|(i, v)| ChangeRecord {
                    table: "set".to_string(),
                    row: format!("b{}-{}", n, i),
                    column: "reps".to_string(),
                    value: Value::Integer(*v as i64),
                    col_version: 1,
                    db_version: *v,
                    seq: i as u32,
                    origin: Some(peer),
                })
                .collect();
            merge_batch(&storage, batch).unwrap();

            expected = expected.max(*versions.iter().max().unwrap());
            let cursor = storage.load_peer(&peer).unwrap().unwrap().version;
            prop_assert!(cursor >= previous);
            prop_assert_eq!(cursor, expected);
            previous = cursor;
        }
    }

    /// Merging a batch a second time changes neither cells nor cursors
    #[test]
    fn merge_is_idempotent(raw in prop::collection::vec(raw_change_strategy(3), 1..30)) {
        let (storage, _dir) = open_storage();
        let origins: Vec<SiteId> = (0..3).map(|_| SiteId::random()).collect();
        let batch: Vec<ChangeRecord> = raw.iter().map(|c| to_change(c, &origins)).collect();

        merge_batch(&storage, batch.clone()).unwrap();
        let cells_once = cells(&storage);
        let cursors_once = cursors(&storage);

        let outcome = merge_batch(&storage, batch).unwrap();
        prop_assert_eq!(outcome.updated, 0);
        prop_assert_eq!(cells(&storage), cells_once);
        prop_assert_eq!(cursors(&storage), cursors_once);
    }

    /// Replicas that merge the same changes in different orders agree
    #[test]
    fn merge_order_does_not_matter(raw in prop::collection::vec(raw_change_strategy(3), 1..30)) {
        let origins: Vec<SiteId> = (0..3).map(|_| SiteId::random()).collect();
        let changes: Vec<ChangeRecord> = unique_stamps(raw)
            .iter()
            .map(|c| to_change(c, &origins))
            .collect();

        let (forward, _dir_a) = open_storage();
        let (backward, _dir_b) = open_storage();
        for change in &changes {
            merge_batch(&forward, vec![change.clone()]).unwrap();
        }
        for change in changes.iter().rev() {
            merge_batch(&backward, vec![change.clone()]).unwrap();
        }

        prop_assert_eq!(cells(&forward), cells(&backward));
        prop_assert_eq!(cursors(&forward), cursors(&backward));
    }

    /// Changes authored by the local site never land, whatever they travel with
    #[test]
    fn local_changes_are_never_applied(
        raw in prop::collection::vec(raw_change_strategy(2), 0..20),
        local_rows in prop::collection::vec(0u8..6, 1..5),
    ) {
        let (storage, _dir) = open_storage();
        let local = storage.site_id();
        let origins = vec![SiteId::random(), SiteId::random()];

        let mut batch: Vec<ChangeRecord> = raw.iter().map(|c| to_change(c, &origins)).collect();
        for (i, row) in local_rows.iter().enumerate() {
            batch.insert(
                (i * 3).min(batch.len()),
                ChangeRecord {
                    table: "set".to_string(),
                    row: format!("mine{}", row),
                    column: "c0".to_string(),
                    value: Value::Integer(i as i64),
                    col_version: 99,
                    db_version: 1000 + i as u64,
                    seq: 0,
                    origin: Some(local),
                },
            );
        }

        let outcome = merge_batch(&storage, batch).unwrap();
        prop_assert_eq!(outcome.dropped_local, local_rows.len());
        prop_assert!(cells(&storage).iter().all(|(row, _)| !row.starts_with("mine")));
        prop_assert!(storage.changes_since(&local, 0).unwrap().is_empty());
        prop_assert!(storage.load_peer(&local).unwrap().is_none());
    }
}
