//! # B+-Tree Module
//!
//! The ordered map at the heart of every store file. Keys and values are
//! opaque byte strings; keys compare by plain byte order, so any ordering
//! the upper layers want is baked into the key encoding before it reaches
//! the tree. Both the object file (16-byte id keys) and index files
//! (order-preserving composite keys) are instances of this one structure.
//!
//! - [`tree::Tree`]: point operations, structural maintenance, rank seeks
//! - [`cursor::Cursor`]: ordered iteration that survives interleaved writes
//! - [`node`]: the slotted block format shared by leaves and interiors

pub mod cursor;
pub mod node;
pub mod tree;

pub use cursor::Cursor;
pub use tree::{Position, Tree};
