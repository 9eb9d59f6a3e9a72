//! # Filter Expressions
//!
//! The predicate AST a `find` call carries: six field comparators, a
//! regex matcher, and the boolean combinators. Comparators use
//! [`Value::compare`], the same total order the indexes encode, so a
//! predicate evaluated directly and a range scan derived from it can
//! never disagree. Missing fields evaluate as `Null`.
//!
//! Regex patterns compile once, at construction; a malformed pattern is
//! an [`StoreError::InvalidFilter`] before any storage is touched.

use std::cmp::Ordering;

use eyre::Result;
use regex::{Regex, RegexBuilder};

use crate::error::StoreError;
use crate::serial::GenericObject;
use crate::value::Value;

/// A compiled, unanchored regex predicate.
#[derive(Debug, Clone)]
pub struct LikePattern {
    pattern: String,
    case_insensitive: bool,
    regex: Regex,
}

impl LikePattern {
    pub fn new(pattern: &str, case_insensitive: bool) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| StoreError::InvalidFilter(format!("bad pattern {pattern:?}: {e}")))?;
        Ok(Self {
            pattern: pattern.to_owned(),
            case_insensitive,
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

#[derive(Debug, Clone)]
pub enum Filter {
    EqualTo { field: String, value: Value },
    NotEqualTo { field: String, value: Value },
    GreaterThan { field: String, value: Value },
    GreaterOrEqual { field: String, value: Value },
    LesserThan { field: String, value: Value },
    LesserOrEqual { field: String, value: Value },
    LikeRegex { field: String, like: LikePattern },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Filter::EqualTo {
            field: field.into(),
            value,
        }
    }

    pub fn ne(field: impl Into<String>, value: Value) -> Self {
        Filter::NotEqualTo {
            field: field.into(),
            value,
        }
    }

    pub fn gt(field: impl Into<String>, value: Value) -> Self {
        Filter::GreaterThan {
            field: field.into(),
            value,
        }
    }

    pub fn ge(field: impl Into<String>, value: Value) -> Self {
        Filter::GreaterOrEqual {
            field: field.into(),
            value,
        }
    }

    pub fn lt(field: impl Into<String>, value: Value) -> Self {
        Filter::LesserThan {
            field: field.into(),
            value,
        }
    }

    pub fn le(field: impl Into<String>, value: Value) -> Self {
        Filter::LesserOrEqual {
            field: field.into(),
            value,
        }
    }

    pub fn like(field: impl Into<String>, pattern: &str, case_insensitive: bool) -> Result<Self> {
        Ok(Filter::LikeRegex {
            field: field.into(),
            like: LikePattern::new(pattern, case_insensitive)?,
        })
    }

    pub fn and(children: Vec<Filter>) -> Self {
        Filter::And(children)
    }

    pub fn or(children: Vec<Filter>) -> Self {
        Filter::Or(children)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Filter) -> Self {
        Filter::Not(Box::new(child))
    }

    /// Direct evaluation, used for residuals and full scans.
    pub fn matches(&self, obj: &GenericObject) -> bool {
        match self {
            Filter::EqualTo { field, value } => {
                obj.field(field).compare(value) == Ordering::Equal
            }
            Filter::NotEqualTo { field, value } => {
                obj.field(field).compare(value) != Ordering::Equal
            }
            Filter::GreaterThan { field, value } => {
                obj.field(field).compare(value) == Ordering::Greater
            }
            Filter::GreaterOrEqual { field, value } => {
                obj.field(field).compare(value) != Ordering::Less
            }
            Filter::LesserThan { field, value } => {
                obj.field(field).compare(value) == Ordering::Less
            }
            Filter::LesserOrEqual { field, value } => {
                obj.field(field).compare(value) != Ordering::Greater
            }
            Filter::LikeRegex { field, like } => obj
                .field(field)
                .regex_text()
                .is_some_and(|text| like.is_match(&text)),
            Filter::And(children) => children.iter().all(|c| c.matches(obj)),
            Filter::Or(children) => children.iter().any(|c| c.matches(obj)),
            Filter::Not(child) => !child.matches(obj),
        }
    }
}
