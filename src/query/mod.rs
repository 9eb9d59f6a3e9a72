//! # Query Engine
//!
//! A `find` call flows through three stages:
//!
//! 1. [`filter`]: the predicate AST, evaluated with the same value order
//!    the indexes encode.
//! 2. [`normalize`] and [`plan`]: negation push-down, per-field interval
//!    merging, then index selection producing a [`Plan`] and an
//!    [`Order`].
//! 3. [`cursor`]: execution, streaming records for natural-order plans
//!    and buffering a bounded sort window otherwise.

pub mod cursor;
pub mod filter;
pub mod normalize;
pub mod plan;

pub use cursor::{FindCursor, QueryContext};
pub use filter::{Filter, LikePattern};
pub use plan::{plan_find, Order, Plan, RangeScan};
