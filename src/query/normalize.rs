//! # Filter Normalization
//!
//! Two rewrites run before planning:
//!
//! 1. Negation push-down. `Not` moves inward through De Morgan and the
//!    comparator complements until only residual negations remain (a
//!    negated regex has no complement and stays as `Not(leaf)`).
//! 2. Interval extraction. Within one conjunction, the range comparators
//!    on each field collapse to a single `[low, high]` interval, with
//!    open/closed ends per operator. Contradictory bounds surface as an
//!    unsatisfiable conjunction, which planning turns into an empty
//!    cursor without touching storage.
//!
//! Everything an interval cannot express (regex, `NotEqualTo`, residual
//! negations, nested disjunctions) is carried through as residual
//! predicates.

use std::cmp::Ordering;

use crate::value::Value;

use super::filter::Filter;

/// One end of an interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub value: Value,
    pub inclusive: bool,
}

/// Merged per-field range constraint.
#[derive(Debug, Clone, Default)]
pub struct Interval {
    pub field: String,
    pub low: Option<Bound>,
    pub high: Option<Bound>,
}

impl Interval {
    fn tighten_low(&mut self, value: Value, inclusive: bool) {
        let tighter = match &self.low {
            None => true,
            Some(b) => match value.compare(&b.value) {
                Ordering::Greater => true,
                Ordering::Equal => !inclusive && b.inclusive,
                Ordering::Less => false,
            },
        };
        if tighter {
            self.low = Some(Bound { value, inclusive });
        }
    }

    fn tighten_high(&mut self, value: Value, inclusive: bool) {
        let tighter = match &self.high {
            None => true,
            Some(b) => match value.compare(&b.value) {
                Ordering::Less => true,
                Ordering::Equal => !inclusive && b.inclusive,
                Ordering::Greater => false,
            },
        };
        if tighter {
            self.high = Some(Bound { value, inclusive });
        }
    }

    pub fn is_empty(&self) -> bool {
        match (&self.low, &self.high) {
            (Some(lo), Some(hi)) => match lo.value.compare(&hi.value) {
                Ordering::Greater => true,
                Ordering::Equal => !(lo.inclusive && hi.inclusive),
                Ordering::Less => false,
            },
            _ => false,
        }
    }

    /// Single-point interval, expressible as an index equality.
    pub fn as_equality(&self) -> Option<&Value> {
        match (&self.low, &self.high) {
            (Some(lo), Some(hi))
                if lo.inclusive
                    && hi.inclusive
                    && lo.value.compare(&hi.value) == Ordering::Equal =>
            {
                Some(&lo.value)
            }
            _ => None,
        }
    }

    /// The comparators this interval stands for, for residual evaluation
    /// when no index encodes it.
    pub fn to_filters(&self) -> Vec<Filter> {
        let mut out = Vec::new();
        if let Some(value) = self.as_equality() {
            out.push(Filter::eq(&self.field, value.clone()));
            return out;
        }
        if let Some(lo) = &self.low {
            out.push(if lo.inclusive {
                Filter::ge(&self.field, lo.value.clone())
            } else {
                Filter::gt(&self.field, lo.value.clone())
            });
        }
        if let Some(hi) = &self.high {
            out.push(if hi.inclusive {
                Filter::le(&self.field, hi.value.clone())
            } else {
                Filter::lt(&self.field, hi.value.clone())
            });
        }
        out
    }
}

/// A normalized conjunction: merged intervals plus residual predicates.
#[derive(Debug, Clone, Default)]
pub struct Conjunction {
    pub intervals: Vec<Interval>,
    pub residual: Vec<Filter>,
    pub unsatisfiable: bool,
}

impl Conjunction {
    pub fn interval_for(&self, field: &str) -> Option<&Interval> {
        self.intervals.iter().find(|i| i.field == field)
    }
}

/// Rewrites `Not` inward. The result contains `Not` only directly over
/// leaves that have no complement.
pub fn push_down_not(filter: Filter) -> Filter {
    rewrite(filter, false)
}

fn rewrite(filter: Filter, negated: bool) -> Filter {
    match (filter, negated) {
        (Filter::Not(inner), n) => rewrite(*inner, !n),
        (Filter::And(children), false) => {
            Filter::And(children.into_iter().map(|c| rewrite(c, false)).collect())
        }
        (Filter::And(children), true) => {
            Filter::Or(children.into_iter().map(|c| rewrite(c, true)).collect())
        }
        (Filter::Or(children), false) => {
            Filter::Or(children.into_iter().map(|c| rewrite(c, false)).collect())
        }
        (Filter::Or(children), true) => {
            Filter::And(children.into_iter().map(|c| rewrite(c, true)).collect())
        }
        (leaf, false) => leaf,
        (Filter::EqualTo { field, value }, true) => Filter::NotEqualTo { field, value },
        (Filter::NotEqualTo { field, value }, true) => Filter::EqualTo { field, value },
        (Filter::GreaterThan { field, value }, true) => Filter::LesserOrEqual { field, value },
        (Filter::GreaterOrEqual { field, value }, true) => Filter::LesserThan { field, value },
        (Filter::LesserThan { field, value }, true) => Filter::GreaterOrEqual { field, value },
        (Filter::LesserOrEqual { field, value }, true) => Filter::GreaterThan { field, value },
        (leaf @ Filter::LikeRegex { .. }, true) => Filter::not(leaf),
    }
}

/// Normalizes the children of one conjunction. Expects negations already
/// pushed down.
pub fn conjunction_of(children: Vec<Filter>) -> Conjunction {
    let mut conj = Conjunction::default();

    for child in children {
        match child {
            Filter::EqualTo { field, value } => {
                let i = interval_mut(&mut conj.intervals, &field);
                i.tighten_low(value.clone(), true);
                i.tighten_high(value, true);
            }
            Filter::GreaterThan { field, value } => {
                interval_mut(&mut conj.intervals, &field).tighten_low(value, false);
            }
            Filter::GreaterOrEqual { field, value } => {
                interval_mut(&mut conj.intervals, &field).tighten_low(value, true);
            }
            Filter::LesserThan { field, value } => {
                interval_mut(&mut conj.intervals, &field).tighten_high(value, false);
            }
            Filter::LesserOrEqual { field, value } => {
                interval_mut(&mut conj.intervals, &field).tighten_high(value, true);
            }
            // Nested conjunctions flatten into this one.
            Filter::And(nested) => {
                let inner = conjunction_of(nested);
                conj.unsatisfiable |= inner.unsatisfiable;
                conj.residual.extend(inner.residual);
                for interval in inner.intervals {
                    let i = interval_mut(&mut conj.intervals, &interval.field);
                    if let Some(lo) = interval.low {
                        i.tighten_low(lo.value, lo.inclusive);
                    }
                    if let Some(hi) = interval.high {
                        i.tighten_high(hi.value, hi.inclusive);
                    }
                }
            }
            other => conj.residual.push(other),
        }
    }

    conj.unsatisfiable |= conj.intervals.iter().any(Interval::is_empty);
    conj
}

fn interval_mut<'a>(intervals: &'a mut Vec<Interval>, field: &str) -> &'a mut Interval {
    let pos = match intervals.iter().position(|i| i.field == field) {
        Some(pos) => pos,
        None => {
            intervals.push(Interval {
                field: field.to_owned(),
                ..Interval::default()
            });
            intervals.len() - 1
        }
    };
    &mut intervals[pos]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_pushes_through_de_morgan() {
        let f = Filter::not(Filter::and(vec![
            Filter::gt("a", Value::U8(1)),
            Filter::not(Filter::eq("b", Value::U8(2))),
        ]));
        let rewritten = push_down_not(f);

        match rewritten {
            Filter::Or(children) => {
                assert!(matches!(&children[0], Filter::LesserOrEqual { field, .. } if field == "a"));
                assert!(matches!(&children[1], Filter::EqualTo { field, .. } if field == "b"));
            }
            other => panic!("expected Or, got {other:?}"),
        }
    }

    #[test]
    fn negated_regex_stays_residual() {
        let f = Filter::not(Filter::like("name", "x", false).unwrap());
        assert!(matches!(push_down_not(f), Filter::Not(_)));
    }

    #[test]
    fn bounds_on_one_field_merge() {
        let conj = conjunction_of(vec![
            Filter::ge("age", Value::U8(10)),
            Filter::lt("age", Value::U8(50)),
            Filter::gt("age", Value::U8(17)),
        ]);
        assert!(!conj.unsatisfiable);
        let i = conj.interval_for("age").unwrap();
        assert_eq!(
            i.low,
            Some(Bound {
                value: Value::U8(17),
                inclusive: false
            })
        );
        assert_eq!(
            i.high,
            Some(Bound {
                value: Value::U8(50),
                inclusive: false
            })
        );
    }

    #[test]
    fn equality_is_a_degenerate_interval() {
        let conj = conjunction_of(vec![Filter::eq("age", Value::U8(30))]);
        let i = conj.interval_for("age").unwrap();
        assert_eq!(i.as_equality(), Some(&Value::U8(30)));
    }

    #[test]
    fn contradictions_are_unsatisfiable() {
        let conj = conjunction_of(vec![
            Filter::gt("age", Value::U8(50)),
            Filter::lt("age", Value::U8(10)),
        ]);
        assert!(conj.unsatisfiable);

        // Equal bounds with an open end are empty too.
        let conj = conjunction_of(vec![
            Filter::ge("age", Value::U8(10)),
            Filter::lt("age", Value::U8(10)),
        ]);
        assert!(conj.unsatisfiable);
    }

    #[test]
    fn mixed_width_bounds_compare_numerically() {
        let conj = conjunction_of(vec![
            Filter::ge("n", Value::U8(100)),
            Filter::le("n", Value::I64(100)),
        ]);
        assert!(!conj.unsatisfiable);
        assert!(conj.interval_for("n").unwrap().as_equality().is_some());
    }

    #[test]
    fn inexpressible_leaves_go_residual() {
        let conj = conjunction_of(vec![
            Filter::eq("a", Value::U8(1)),
            Filter::ne("b", Value::U8(2)),
            Filter::like("c", "x", false).unwrap(),
        ]);
        assert_eq!(conj.intervals.len(), 1);
        assert_eq!(conj.residual.len(), 2);
    }

    #[test]
    fn nested_and_flattens() {
        let conj = conjunction_of(vec![
            Filter::ge("a", Value::U8(1)),
            Filter::and(vec![
                Filter::le("a", Value::U8(9)),
                Filter::eq("b", Value::U8(3)),
            ]),
        ]);
        assert_eq!(conj.intervals.len(), 2);
        let a = conj.interval_for("a").unwrap();
        assert!(a.low.is_some() && a.high.is_some());
    }

    #[test]
    fn interval_to_filters_roundtrips_the_bounds() {
        let conj = conjunction_of(vec![
            Filter::gt("age", Value::U8(10)),
            Filter::le("age", Value::U8(20)),
        ]);
        let filters = conj.interval_for("age").unwrap().to_filters();
        assert_eq!(filters.len(), 2);
        assert!(matches!(&filters[0], Filter::GreaterThan { .. }));
        assert!(matches!(&filters[1], Filter::LesserOrEqual { .. }));
    }
}
