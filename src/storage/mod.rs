//! # Storage Module
//!
//! The block store: fixed-size pages on durable storage, cached in memory,
//! with all structural mutation funneled through `BlockFile`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ BlockFile  (alloc/free, bulk, lock)      │
//! ├──────────────────────────────────────────┤
//! │ BlockCache (SIEVE eviction, pin/unpin,   │
//! │             dirty write-back)            │
//! ├──────────────────────────────────────────┤
//! │ DiskFile   (positioned I/O + CRC-32)     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Every file in a store shares one `BlockCache`, keyed by
//! `(file_id, block_no)`. The cache is write-back: dirty blocks are flushed
//! on eviction or on an explicit `BlockFile::flush`. Block 0 of every file
//! holds the 64-byte `FileHeader` and never enters the cache.
//!
//! ## Block Size
//!
//! The block size is chosen at file-creation time, recorded in the header,
//! and immutable afterwards; reopening with a different size is a fatal
//! header mismatch. All files of one store share a single size so cache
//! buffers are uniform.
//!
//! ## Corruption Policy
//!
//! Every block carries a CRC-32 of its contents, stamped on write-back and
//! verified on every read from disk. A mismatch, like any structural
//! invariant violation, is a fatal `StoreError::Corrupt` and is never
//! silently repaired.

mod cache;
mod disk;
mod file;
mod header;
mod page;

pub use cache::{BlockCache, BlockKey, BlockRef};
pub use disk::DiskFile;
pub use file::{BlockFile, FileKind, StructureReadGuard, StructureWriteGuard};
pub use header::{FileHeader, FORMAT_VERSION};
pub use page::{validate_block, BlockHeader, BlockKind, BLOCK_HEADER_SIZE};

pub const FILE_HEADER_SIZE: usize = 64;

pub const MIN_BLOCK_SIZE: usize = 1024;
pub const MAX_BLOCK_SIZE: usize = 65536;
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

pub const CACHE_SHARD_COUNT: usize = 16;
