//! # Binary Object Codec
//!
//! Self-describing record encoding: every record carries its type name,
//! collection and field labels, so any record can be decoded without an
//! external schema. Field labels compress to per-collection varint codes
//! ([`fieldmap`]), and typed application structs plug in through the
//! [`registry::Persistent`] trait while schema-less records stay
//! [`GenericObject`]s.
//!
//! - [`varint`]: the length encoding used throughout the store
//! - [`tags`]: the one-byte wire type of each field value
//! - [`writer`] / [`reader`]: frame and body encode/decode
//! - [`fieldmap`]: durable field-name-to-code assignments
//! - [`registry`]: typed lowering and lifting

pub mod fieldmap;
pub mod generic;
pub mod reader;
pub mod registry;
pub mod tags;
pub mod varint;
pub mod writer;

pub use fieldmap::{FieldTables, RESERVED_COLLECTION};
pub use generic::GenericObject;
pub use reader::{decode_record, BinReader};
pub use registry::{lower, CodecRegistry, Persistent};
pub use tags::Tag;
pub use writer::{encode_record, BinWriter};
