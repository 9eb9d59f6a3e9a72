//! # Find Query Test Suite
//!
//! End-to-end coverage of the query path: filter compilation against
//! registered indexes, natural-order range scans, union plans, explicit
//! sorts, and paging. Data sets are seeded, so every run sees the same
//! records.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use chrono::DateTime;
use objdb::{Filter, GenericObject, RegenerationPolicy, Store, StoreOptions, Value};

// ============================================================================
// HELPERS
// ============================================================================

fn open_store(dir: &tempfile::TempDir) -> Store {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    StoreOptions::new(dir.path().join("db"))
        .cache_capacity(512)
        .open()
        .expect("open store")
}

/// 1000 records with a random byte, a timestamp, and a unique sequence
/// number.
fn seed_records(store: &Store, count: u32) -> Vec<GenericObject> {
    let mut rng = StdRng::seed_from_u64(0x0bdb);
    let mut out = Vec::with_capacity(count as usize);
    store.start_bulk();
    for seq in 0..count {
        let mut obj = GenericObject::new("samples", "Sample")
            .with("byte", Value::U8(rng.gen::<u8>()))
            .with(
                "date",
                Value::DateTime(
                    DateTime::from_timestamp(1_700_000_000 + rng.gen_range(0..86_400), 0)
                        .expect("valid timestamp"),
                ),
            )
            .with("seq", Value::U32(seq));
        store.save(&mut obj).expect("save");
        out.push(obj);
    }
    store.end_bulk().expect("end bulk");
    out
}

fn byte_of(obj: &GenericObject) -> u8 {
    match obj.field("byte") {
        Value::U8(v) => v,
        other => panic!("expected byte, got {other:?}"),
    }
}

fn date_of(obj: &GenericObject) -> i64 {
    match obj.field("date") {
        Value::DateTime(dt) => dt.timestamp(),
        other => panic!("expected date, got {other:?}"),
    }
}

fn seq_of(obj: &GenericObject) -> u32 {
    match obj.field("seq") {
        Value::U32(v) => v,
        other => panic!("expected seq, got {other:?}"),
    }
}

// ============================================================================
// RANGE SCANS
// ============================================================================

#[test]
fn byte_filter_partitions_the_data_set() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(&dir);
    store
        .index_file("by-byte", &["byte".into()], RegenerationPolicy::IfNeeded)
        .unwrap();
    seed_records(&store, 1000);

    let low = store
        .find(0, None, Some(&Filter::le("byte", Value::U8(100))), true, &[])
        .unwrap();
    let high = store
        .find(0, None, Some(&Filter::gt("byte", Value::U8(100))), true, &[])
        .unwrap();

    assert_eq!(low.len() + high.len(), 1000);
    assert!(low.iter().all(|o| byte_of(o) <= 100));
    assert!(high.iter().all(|o| byte_of(o) > 100));

    // An indexed range comes back in index order.
    let bytes: Vec<u8> = low.iter().map(byte_of).collect();
    assert!(bytes.windows(2).all(|w| w[0] <= w[1]));

    // Both ranges were served by the index.
    assert_eq!(store.compute_statistics().full_scan_count, 0);

    // Equality and its complement partition the set the same way.
    let exact = store
        .find(0, None, Some(&Filter::eq("byte", Value::U8(100))), true, &[])
        .unwrap();
    let rest = store
        .find(0, None, Some(&Filter::ne("byte", Value::U8(100))), true, &[])
        .unwrap();
    assert_eq!(exact.len() + rest.len(), 1000);
    assert!(exact.iter().all(|o| byte_of(o) == 100));
    assert!(rest.iter().all(|o| byte_of(o) != 100));
}

#[test]
fn huge_integers_filter_exactly_despite_shared_key_images() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(&dir);
    store
        .index_file("by-n", &["n".into()], RegenerationPolicy::IfNeeded)
        .unwrap();

    // Neighbors around 2^53 collate to at most two distinct index key
    // images, so only an exact re-check separates them.
    let base: u64 = 1 << 53;
    for n in [base - 1, base, base + 1, base + 2] {
        let mut obj = GenericObject::new("counters", "Counter").with("n", Value::U64(n));
        store.save(&mut obj).unwrap();
    }
    let n_of = |o: &GenericObject| match o.field("n") {
        Value::U64(v) => v,
        other => panic!("expected n, got {other:?}"),
    };
    let run = |filter: Filter| -> Vec<u64> {
        let mut ns: Vec<u64> = store
            .find(0, None, Some(&filter), true, &[])
            .unwrap()
            .iter()
            .map(&n_of)
            .collect();
        ns.sort_unstable();
        ns
    };

    assert_eq!(run(Filter::eq("n", Value::U64(base))), [base]);
    assert_eq!(run(Filter::gt("n", Value::U64(base))), [base + 1, base + 2]);
    assert_eq!(run(Filter::le("n", Value::U64(base))), [base - 1, base]);
    assert_eq!(run(Filter::lt("n", Value::U64(base + 1))), [base - 1, base]);
    // The index served all of it.
    assert_eq!(store.compute_statistics().full_scan_count, 0);
}

#[test]
fn composite_index_orders_second_field_descending() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(&dir);
    store
        .index_file(
            "by-byte-date",
            &["byte".into(), "-date".into()],
            RegenerationPolicy::IfNeeded,
        )
        .unwrap();
    seed_records(&store, 1000);

    let filter = Filter::and(vec![
        Filter::ge("byte", Value::U8(100)),
        Filter::lt("byte", Value::U8(150)),
    ]);
    let found = store.find(0, None, Some(&filter), true, &[]).unwrap();
    assert!(!found.is_empty());
    assert!(found.iter().all(|o| (100..150).contains(&byte_of(o))));

    for pair in found.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(byte_of(a) <= byte_of(b));
        if byte_of(a) == byte_of(b) {
            // Within one byte value the timestamp runs newest-first.
            assert!(date_of(a) >= date_of(b));
        }
    }
}

#[test]
fn descending_enumeration_reverses_the_range() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(&dir);
    store
        .index_file("by-byte", &["byte".into()], RegenerationPolicy::IfNeeded)
        .unwrap();
    seed_records(&store, 300);

    let filter = Filter::ge("byte", Value::U8(200));
    let forward = store.find(0, None, Some(&filter), true, &[]).unwrap();
    let backward = store.find(0, None, Some(&filter), false, &[]).unwrap();

    let mut reversed: Vec<u32> = backward.iter().map(seq_of).collect();
    reversed.reverse();
    let forward_seqs: Vec<u32> = forward.iter().map(seq_of).collect();
    assert_eq!(forward_seqs, reversed);
}

#[test]
fn contradictory_bounds_touch_no_storage() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(&dir);
    store
        .index_file("by-byte", &["byte".into()], RegenerationPolicy::IfNeeded)
        .unwrap();
    seed_records(&store, 100);

    let filter = Filter::and(vec![
        Filter::gt("byte", Value::U8(200)),
        Filter::lt("byte", Value::U8(10)),
    ]);
    let found = store.find(0, None, Some(&filter), true, &[]).unwrap();
    assert!(found.is_empty());
    assert_eq!(store.compute_statistics().full_scan_count, 0);
}

// ============================================================================
// DISJUNCTIONS
// ============================================================================

#[test]
fn fully_indexed_or_becomes_a_union_without_scanning() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(&dir);
    store
        .index_file("by-byte", &["byte".into()], RegenerationPolicy::IfNeeded)
        .unwrap();
    store
        .index_file("by-seq", &["seq".into()], RegenerationPolicy::IfNeeded)
        .unwrap();
    seed_records(&store, 500);

    let filter = Filter::or(vec![
        Filter::eq("byte", Value::U8(42)),
        Filter::lt("seq", Value::U32(10)),
    ]);
    let found = store.find(0, None, Some(&filter), true, &[]).unwrap();
    assert!(found.len() >= 10);
    assert!(found
        .iter()
        .all(|o| byte_of(o) == 42 || seq_of(o) < 10));
    assert_eq!(store.compute_statistics().full_scan_count, 0);
}

#[test]
fn one_unservable_or_branch_costs_exactly_one_scan() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(&dir);
    store
        .index_file("by-byte", &["byte".into()], RegenerationPolicy::IfNeeded)
        .unwrap();
    seed_records(&store, 500);

    // "seq" has no index, so the whole disjunction degrades to one full
    // scan, never to one scan per branch.
    let filter = Filter::or(vec![
        Filter::eq("byte", Value::U8(42)),
        Filter::lt("seq", Value::U32(10)),
    ]);
    let before = store.compute_statistics().full_scan_count;
    let found = store.find(0, None, Some(&filter), true, &[]).unwrap();
    assert!(found.len() >= 10);
    assert_eq!(store.compute_statistics().full_scan_count, before + 1);
}

// ============================================================================
// PAGING AND SORTING
// ============================================================================

#[test]
fn natural_order_paging_matches_the_full_result() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(&dir);
    store
        .index_file("by-byte", &["byte".into()], RegenerationPolicy::IfNeeded)
        .unwrap();
    seed_records(&store, 1000);

    let filter = Filter::ge("byte", Value::U8(50));
    let full = store.find(0, None, Some(&filter), true, &[]).unwrap();

    let mut paged = Vec::new();
    let mut offset = 0;
    loop {
        let page = store
            .find(offset, Some(97), Some(&filter), true, &[])
            .unwrap();
        if page.is_empty() {
            break;
        }
        offset += page.len() as u64;
        paged.extend(page);
    }

    assert_eq!(full.len(), paged.len());
    let full_ids: Vec<_> = full.iter().map(|o| o.id).collect();
    let paged_ids: Vec<_> = paged.iter().map(|o| o.id).collect();
    assert_eq!(full_ids, paged_ids);
}

#[test]
fn explicit_sort_pages_consistently() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(&dir);
    store
        .index_file("by-byte", &["byte".into()], RegenerationPolicy::IfNeeded)
        .unwrap();
    seed_records(&store, 400);

    let filter = Filter::ge("byte", Value::U8(0));
    let sort = vec!["seq".to_owned()];
    let full = store.find(0, None, Some(&filter), true, &sort).unwrap();
    assert_eq!(full.len(), 400);
    let seqs: Vec<u32> = full.iter().map(seq_of).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    let page = store.find(100, Some(50), Some(&filter), true, &sort).unwrap();
    assert_eq!(page.len(), 50);
    assert_eq!(seq_of(&page[0]), seqs[100]);
    assert_eq!(seq_of(&page[49]), seqs[149]);

    // Descending flips the whole ordering, ties included.
    let desc = store.find(0, Some(5), Some(&filter), false, &sort).unwrap();
    assert_eq!(seq_of(&desc[0]), 399);
}

#[test]
fn sort_covered_by_an_index_rides_the_index_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(&dir);
    store
        .index_file("by-seq", &["seq".into()], RegenerationPolicy::IfNeeded)
        .unwrap();
    seed_records(&store, 200);

    let found = store
        .find(0, None, None, true, &["seq".to_owned()])
        .unwrap();
    let seqs: Vec<u32> = found.iter().map(seq_of).collect();
    assert_eq!(seqs, (0..200).collect::<Vec<u32>>());
    // The ordering came from the index, not from a scan-and-sort.
    assert_eq!(store.compute_statistics().full_scan_count, 0);
}
