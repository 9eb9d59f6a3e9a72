//! # Secondary Indexes
//!
//! Ordered secondary access paths over the primary object file. An index
//! is a B+-tree of order-preserving composite keys ([`key`]) with the
//! object id as tiebreak; [`file::IndexFile`] maintains the entries and
//! owns the persisted field list.

pub mod file;
pub mod key;

pub use file::{id_of_entry, IndexCursor, IndexField, IndexFile, RegenerationPolicy};
pub use key::{collates_exactly, encode_entry, encode_field, prefix_successor};
