//! # Plan Selection
//!
//! Turns a normalized filter plus the declared indexes into an execution
//! plan. An index is scored by how many of its leading fields the
//! conjunction constrains (equalities first, then at most one range);
//! the best-covering index wins, with a double-bounded range breaking
//! ties. Whatever the winning index cannot encode rides along as a
//! residual predicate.
//!
//! A top-level `Or` becomes a `Union` only when every branch can be
//! served by an index; one branch falling short degrades the whole
//! disjunction to a single full scan, never to one scan per branch.

use tracing::debug;

use crate::index::key::{collates_exactly, encode_field, prefix_successor};
use crate::index::IndexFile;

use super::filter::Filter;
use super::normalize::{conjunction_of, push_down_not, Conjunction};

/// One bounded walk over an index. `end` is an exclusive byte bound.
#[derive(Debug, Clone)]
pub struct RangeScan {
    pub index: usize,
    pub start: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
    pub reverse: bool,
    pub residual: Option<Filter>,
}

#[derive(Debug, Clone)]
pub enum Plan {
    /// Proven empty at compile time; storage is never touched.
    Empty,
    FullScan {
        residual: Option<Filter>,
        reverse: bool,
    },
    IndexRange(RangeScan),
    /// Index-driven branches, de-duplicated by id at execution.
    Union(Vec<RangeScan>),
}

/// How the executor must order the results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Order {
    /// The plan's own traversal order is already correct.
    Natural,
    /// Buffer and sort by these fields (`-` prefix descending).
    SortBy(Vec<String>),
}

pub fn plan_find(
    filter: Option<&Filter>,
    sort_fields: &[String],
    ascending: bool,
    indexes: &[&IndexFile],
) -> (Plan, Order) {
    let normalized = filter.cloned().map(push_down_not);

    let plan = match &normalized {
        None => Plan::FullScan {
            residual: None,
            reverse: false,
        },
        Some(Filter::Or(branches)) => plan_union(branches, &normalized, indexes),
        Some(other) => {
            let conj = conjunction_of(vec![other.clone()]);
            if conj.unsatisfiable {
                Plan::Empty
            } else {
                match best_range(&conj, indexes) {
                    Some(scan) => Plan::IndexRange(scan),
                    None => Plan::FullScan {
                        residual: normalized.clone(),
                        reverse: false,
                    },
                }
            }
        }
    };

    let (plan, order) = resolve_order(plan, sort_fields, ascending, indexes);
    debug!(?order, plan = plan_kind(&plan), "query plan selected");
    (plan, order)
}

fn plan_kind(plan: &Plan) -> &'static str {
    match plan {
        Plan::Empty => "empty",
        Plan::FullScan { .. } => "full-scan",
        Plan::IndexRange(_) => "index-range",
        Plan::Union(_) => "union",
    }
}

fn plan_union(
    branches: &[Filter],
    whole: &Option<Filter>,
    indexes: &[&IndexFile],
) -> Plan {
    let mut scans = Vec::with_capacity(branches.len());
    for branch in branches {
        let conj = conjunction_of(vec![branch.clone()]);
        if conj.unsatisfiable {
            continue;
        }
        match best_range(&conj, indexes) {
            Some(scan) => scans.push(scan),
            // One unservable branch costs one full scan for the whole Or.
            None => {
                return Plan::FullScan {
                    residual: whole.clone(),
                    reverse: false,
                }
            }
        }
    }
    if scans.is_empty() {
        Plan::Empty
    } else {
        Plan::Union(scans)
    }
}

/// Best single-index range for a conjunction, or `None` when no index
/// constrains anything.
fn best_range(conj: &Conjunction, indexes: &[&IndexFile]) -> Option<RangeScan> {
    let mut best: Option<(usize, bool, RangeScan)> = None;
    for (pos, index) in indexes.iter().enumerate() {
        if let Some((covered, double, scan)) = candidate(pos, index, conj) {
            let better = match &best {
                None => true,
                Some((c, d, _)) => covered > *c || (covered == *c && double && !d),
            };
            if better {
                best = Some((covered, double, scan));
            }
        }
    }
    best.map(|(_, _, scan)| scan)
}

fn candidate(
    pos: usize,
    index: &IndexFile,
    conj: &Conjunction,
) -> Option<(usize, bool, RangeScan)> {
    let mut prefix = Vec::new();
    let mut used: Vec<&str> = Vec::new();
    // Fields whose bound values collate inexactly: their byte bounds
    // over-approximate, so their intervals stay in the residual.
    let mut recheck: Vec<&str> = Vec::new();
    let mut range = None;

    for field in index.fields() {
        let Some(interval) = conj.interval_for(&field.name) else {
            break;
        };
        used.push(&field.name);
        if let Some(value) = interval.as_equality() {
            if !collates_exactly(value) {
                recheck.push(&field.name);
            }
            encode_field(&mut prefix, value, field.descending);
        } else {
            range = Some((interval, field));
            break;
        }
    }
    if used.is_empty() {
        return None;
    }

    let (start, end, double) = match range {
        None => (
            Some(prefix.clone()),
            prefix_successor(&prefix),
            true,
        ),
        Some((interval, field)) => {
            let descending = field.descending;
            if !interval
                .low
                .iter()
                .chain(interval.high.iter())
                .all(|b| collates_exactly(&b.value))
            {
                recheck.push(&field.name);
            }
            // A descending field stores large values first, so the byte
            // bounds come from the opposite value bounds.
            let (byte_low, byte_high) = if descending {
                (&interval.high, &interval.low)
            } else {
                (&interval.low, &interval.high)
            };

            // An inexact exclusive bound cannot cut by bytes alone: the
            // excluded value shares its key image with values the filter
            // keeps. The byte bound widens to the whole collation run and
            // the residual does the cutting.
            let start = match byte_low {
                Some(bound) => {
                    let mut key = prefix.clone();
                    encode_field(&mut key, &bound.value, descending);
                    if bound.inclusive || !collates_exactly(&bound.value) {
                        Some(key)
                    } else {
                        // No successor means nothing can follow this
                        // prefix; the index cannot express the bound.
                        Some(prefix_successor(&key)?)
                    }
                }
                None if prefix.is_empty() => None,
                None => Some(prefix.clone()),
            };
            let end = match byte_high {
                Some(bound) => {
                    let mut key = prefix.clone();
                    encode_field(&mut key, &bound.value, descending);
                    if bound.inclusive || !collates_exactly(&bound.value) {
                        prefix_successor(&key)
                    } else {
                        Some(key)
                    }
                }
                None if prefix.is_empty() => None,
                None => prefix_successor(&prefix),
            };
            let double = interval.low.is_some() && interval.high.is_some();
            (start, end, double)
        }
    };

    // Everything the key bytes do not encode exactly is evaluated per
    // record.
    let mut residual: Vec<Filter> = conj.residual.clone();
    for interval in &conj.intervals {
        let name = interval.field.as_str();
        if !used.contains(&name) || recheck.contains(&name) {
            residual.extend(interval.to_filters());
        }
    }

    Some((
        used.len(),
        double,
        RangeScan {
            index: pos,
            start,
            end,
            reverse: false,
            residual: combine(residual),
        },
    ))
}

fn combine(mut filters: Vec<Filter>) -> Option<Filter> {
    match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ => Some(Filter::And(filters)),
    }
}

fn resolve_order(
    plan: Plan,
    sort_fields: &[String],
    ascending: bool,
    indexes: &[&IndexFile],
) -> (Plan, Order) {
    if sort_fields.is_empty() {
        return match plan {
            Plan::IndexRange(mut scan) => {
                scan.reverse = !ascending;
                (Plan::IndexRange(scan), Order::Natural)
            }
            Plan::FullScan { residual, .. } => (
                Plan::FullScan {
                    residual,
                    reverse: !ascending,
                },
                Order::Natural,
            ),
            // Branch outputs interleave; sort the union by id.
            Plan::Union(scans) => (Plan::Union(scans), Order::SortBy(Vec::new())),
            Plan::Empty => (Plan::Empty, Order::Natural),
        };
    }

    match plan {
        Plan::IndexRange(mut scan) => {
            if let Some(flipped) = covers_sort(indexes[scan.index], sort_fields) {
                scan.reverse = flipped ^ !ascending;
                (Plan::IndexRange(scan), Order::Natural)
            } else {
                (Plan::IndexRange(scan), Order::SortBy(sort_fields.to_vec()))
            }
        }
        Plan::FullScan { residual, .. } => {
            // An index covering the sort order doubles as the scan source:
            // every record has an entry in every index.
            for (pos, index) in indexes.iter().enumerate() {
                if let Some(flipped) = covers_sort(index, sort_fields) {
                    return (
                        Plan::IndexRange(RangeScan {
                            index: pos,
                            start: None,
                            end: None,
                            reverse: flipped ^ !ascending,
                            residual,
                        }),
                        Order::Natural,
                    );
                }
            }
            (
                Plan::FullScan {
                    residual,
                    reverse: false,
                },
                Order::SortBy(sort_fields.to_vec()),
            )
        }
        Plan::Union(scans) => (Plan::Union(scans), Order::SortBy(sort_fields.to_vec())),
        Plan::Empty => (Plan::Empty, Order::Natural),
    }
}

/// Does this index enumerate in exactly the requested sort order?
/// `Some(true)` means it covers the order reversed.
fn covers_sort(index: &IndexFile, sort_fields: &[String]) -> Option<bool> {
    let names = index.field_names();
    if names.len() < sort_fields.len() {
        return None;
    }
    if names[..sort_fields.len()] == *sort_fields {
        return Some(false);
    }
    let flipped: Vec<String> = sort_fields.iter().map(|f| flip_sign(f)).collect();
    if names[..sort_fields.len()] == flipped[..] {
        return Some(true);
    }
    None
}

fn flip_sign(field: &str) -> String {
    match field.strip_prefix('-') {
        Some(name) => name.to_owned(),
        None => format!("-{field}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::RegenerationPolicy;
    use crate::storage::{BlockCache, DEFAULT_CACHE_CAPACITY};
    use crate::value::Value;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        indexes: Vec<IndexFile>,
    }

    fn fixture(specs: &[&[&str]]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(DEFAULT_CACHE_CAPACITY, 1024).unwrap());
        let indexes = specs
            .iter()
            .enumerate()
            .map(|(i, fields)| {
                let fields: Vec<String> = fields.iter().map(|s| s.to_string()).collect();
                IndexFile::open(
                    &dir.path().join(format!("i{i}.idx")),
                    10 + i as u32,
                    Arc::clone(&cache),
                    &fields,
                    RegenerationPolicy::IfNeeded,
                    Duration::from_millis(200),
                )
                .unwrap()
            })
            .collect();
        Fixture { _dir: dir, indexes }
    }

    impl Fixture {
        fn refs(&self) -> Vec<&IndexFile> {
            self.indexes.iter().collect()
        }
    }

    #[test]
    fn equality_picks_the_matching_index() {
        let fx = fixture(&[&["name"], &["age"]]);
        let filter = Filter::eq("age", Value::U8(30));
        let (plan, order) = plan_find(Some(&filter), &[], true, &fx.refs());

        match plan {
            Plan::IndexRange(scan) => {
                assert_eq!(scan.index, 1);
                assert!(scan.residual.is_none());
                assert!(scan.start.is_some() && scan.end.is_some());
            }
            other => panic!("expected index range, got {other:?}"),
        }
        assert_eq!(order, Order::Natural);
    }

    #[test]
    fn double_bounded_range_beats_single_bounded() {
        let fx = fixture(&[&["a"], &["b"]]);
        let filter = Filter::and(vec![
            Filter::ge("a", Value::U8(1)),
            Filter::ge("b", Value::U8(1)),
            Filter::le("b", Value::U8(9)),
        ]);
        let (plan, _) = plan_find(Some(&filter), &[], true, &fx.refs());

        match plan {
            Plan::IndexRange(scan) => {
                assert_eq!(scan.index, 1);
                // The bound on `a` survives as residual.
                assert!(scan.residual.is_some());
            }
            other => panic!("expected index range, got {other:?}"),
        }
    }

    #[test]
    fn composite_index_consumes_equalities_then_one_range() {
        let fx = fixture(&[&["age", "name"]]);
        let filter = Filter::and(vec![
            Filter::eq("age", Value::U8(30)),
            Filter::gt("name", Value::Str("m".into())),
        ]);
        let (plan, _) = plan_find(Some(&filter), &[], true, &fx.refs());

        match plan {
            Plan::IndexRange(scan) => {
                assert!(scan.residual.is_none());
                assert!(scan.start.is_some() && scan.end.is_some());
            }
            other => panic!("expected index range, got {other:?}"),
        }
    }

    #[test]
    fn inexact_integer_bounds_stay_in_the_residual() {
        let fx = fixture(&[&["n"]]);
        let limit: u64 = 1 << 53;

        // Equality on a colliding value scans its collation run and
        // re-checks each record.
        let filter = Filter::eq("n", Value::U64(limit));
        let (plan, _) = plan_find(Some(&filter), &[], true, &fx.refs());
        match plan {
            Plan::IndexRange(scan) => assert!(scan.residual.is_some()),
            other => panic!("expected index range, got {other:?}"),
        }

        // An exclusive bound on a colliding value widens to include the
        // run instead of cutting through it.
        let exclusive = Filter::gt("n", Value::U64(limit));
        let (plan, _) = plan_find(Some(&exclusive), &[], true, &fx.refs());
        match plan {
            Plan::IndexRange(scan) => {
                assert!(scan.residual.is_some());
                let inclusive = Filter::ge("n", Value::U64(limit));
                let (ge_plan, _) = plan_find(Some(&inclusive), &[], true, &fx.refs());
                match ge_plan {
                    Plan::IndexRange(ge) => assert_eq!(scan.start, ge.start),
                    other => panic!("expected index range, got {other:?}"),
                }
            }
            other => panic!("expected index range, got {other:?}"),
        }

        // Small integers keep exact byte bounds and no residual.
        let filter = Filter::eq("n", Value::U64(limit - 1));
        let (plan, _) = plan_find(Some(&filter), &[], true, &fx.refs());
        match plan {
            Plan::IndexRange(scan) => assert!(scan.residual.is_none()),
            other => panic!("expected index range, got {other:?}"),
        }
    }

    #[test]
    fn no_usable_index_means_full_scan_with_residual() {
        let fx = fixture(&[&["age"]]);
        let filter = Filter::like("name", "ada", false).unwrap();
        let (plan, _) = plan_find(Some(&filter), &[], true, &fx.refs());
        assert!(matches!(plan, Plan::FullScan { residual: Some(_), .. }));
    }

    #[test]
    fn unsatisfiable_conjunction_is_empty() {
        let fx = fixture(&[&["age"]]);
        let filter = Filter::and(vec![
            Filter::gt("age", Value::U8(9)),
            Filter::lt("age", Value::U8(5)),
        ]);
        let (plan, _) = plan_find(Some(&filter), &[], true, &fx.refs());
        assert!(matches!(plan, Plan::Empty));
    }

    #[test]
    fn or_with_index_branches_unions() {
        let fx = fixture(&[&["age"], &["name"]]);
        let filter = Filter::or(vec![
            Filter::eq("age", Value::U8(1)),
            Filter::eq("name", Value::Str("ada".into())),
        ]);
        let (plan, order) = plan_find(Some(&filter), &[], true, &fx.refs());

        match plan {
            Plan::Union(scans) => assert_eq!(scans.len(), 2),
            other => panic!("expected union, got {other:?}"),
        }
        // Union output is re-ordered by id.
        assert_eq!(order, Order::SortBy(Vec::new()));
    }

    #[test]
    fn or_with_one_bad_branch_degrades_to_one_full_scan() {
        let fx = fixture(&[&["age"]]);
        let filter = Filter::or(vec![
            Filter::eq("age", Value::U8(1)),
            Filter::like("name", "x", false).unwrap(),
        ]);
        let (plan, _) = plan_find(Some(&filter), &[], true, &fx.refs());
        assert!(matches!(plan, Plan::FullScan { residual: Some(_), .. }));
    }

    #[test]
    fn covered_sort_rides_the_index() {
        let fx = fixture(&[&["age", "-when"]]);
        let sort = vec!["age".to_owned(), "-when".to_owned()];
        let (plan, order) = plan_find(None, &sort, true, &fx.refs());

        match plan {
            Plan::IndexRange(scan) => {
                assert!(!scan.reverse);
                assert!(scan.start.is_none() && scan.end.is_none());
            }
            other => panic!("expected index range, got {other:?}"),
        }
        assert_eq!(order, Order::Natural);
    }

    #[test]
    fn reversed_sort_cover_flips_the_scan() {
        let fx = fixture(&[&["age", "-when"]]);
        let sort = vec!["-age".to_owned(), "when".to_owned()];
        let (plan, order) = plan_find(None, &sort, true, &fx.refs());
        match plan {
            Plan::IndexRange(scan) => assert!(scan.reverse),
            other => panic!("expected index range, got {other:?}"),
        }
        assert_eq!(order, Order::Natural);

        // Descending overall enumeration flips once more.
        let (plan, _) = plan_find(None, &sort, false, &fx.refs());
        match plan {
            Plan::IndexRange(scan) => assert!(!scan.reverse),
            other => panic!("expected index range, got {other:?}"),
        }
    }

    #[test]
    fn uncovered_sort_buffers_and_sorts() {
        let fx = fixture(&[&["age"]]);
        let sort = vec!["name".to_owned()];
        let filter = Filter::eq("age", Value::U8(1));
        let (plan, order) = plan_find(Some(&filter), &sort, true, &fx.refs());
        assert!(matches!(plan, Plan::IndexRange(_)));
        assert_eq!(order, Order::SortBy(sort));
    }

    #[test]
    fn descending_scan_without_sort_reverses_the_range() {
        let fx = fixture(&[&["age"]]);
        let filter = Filter::ge("age", Value::U8(10));
        let (plan, _) = plan_find(Some(&filter), &[], false, &fx.refs());
        match plan {
            Plan::IndexRange(scan) => assert!(scan.reverse),
            other => panic!("expected index range, got {other:?}"),
        }
    }
}
