//! # objdb - Embedded Schema-Flexible Object Database
//!
//! objdb persists late-bound objects in paged block files: records carry
//! their own type names and field labels, so nothing needs a schema
//! declared up front. Point access runs over a counted B+-tree keyed by
//! object id; secondary indexes keep order-preserving composite keys so a
//! filter can compile down to a bounded index walk instead of a scan.
//!
//! ## Quick Start
//!
//! ```ignore
//! use objdb::{Filter, GenericObject, RegenerationPolicy, StoreOptions, Value};
//!
//! let mut store = StoreOptions::new("./mydb").open()?;
//! store.index_file("by-age", &["age".into()], RegenerationPolicy::IfNeeded)?;
//!
//! let mut person = GenericObject::new("people", "Person")
//!     .with("name", Value::Str("Ada".into()))
//!     .with("age", Value::U8(36));
//! store.save(&mut person)?;
//!
//! let adults = store.find(
//!     0,
//!     Some(100),
//!     Some(&Filter::ge("age", Value::U8(18))),
//!     true,
//!     &[],
//! )?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Store)           │
//! ├─────────────────────────────────────┤
//! │  Query Compiler │ Find Execution    │
//! ├─────────────────┼───────────────────┤
//! │  Object File    │ Index Files       │
//! ├─────────────────────────────────────┤
//! │     Binary Object Codec             │
//! ├─────────────────────────────────────┤
//! │  B+-Tree (counted, slotted blocks)  │
//! ├─────────────────────────────────────┤
//! │  Block Files / SIEVE Cache / CRC    │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! store_dir/
//! ├── objects.db     # primary file, records keyed by object id
//! ├── objects.blob   # overflow chains for oversized records
//! ├── fields.db      # persisted field-name-to-code assignments
//! └── <name>.idx     # one file per registered index
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: block files, checksummed I/O, cache, freelist
//! - [`btree`]: the counted B+-tree and its cursors
//! - [`serial`]: the self-describing record codec and field tables
//! - [`objects`]: the primary file with blob overflow
//! - [`index`]: secondary index files and key encoding
//! - [`query`]: filter AST, plan selection, find execution
//! - [`store`]: the embedded database facade

pub mod btree;
pub mod error;
pub mod guid;
pub mod index;
pub mod objects;
pub mod query;
pub mod serial;
pub mod storage;
pub mod store;
pub mod value;

pub use error::{store_error, StoreError};
pub use guid::ObjectId;
pub use index::RegenerationPolicy;
pub use objects::FileStatistics;
pub use query::{Filter, FindCursor, LikePattern};
pub use serial::{GenericObject, Persistent};
pub use store::{Store, StoreOptions};
pub use value::Value;
