//! # Block File
//!
//! `BlockFile` ties one on-disk file to the shared cache and owns its
//! header: allocation state, the tree root, and the entry count all live in
//! an in-memory copy of the 64-byte header that is written back on flush.
//!
//! ## Allocation
//!
//! Free blocks are tracked in trunk pages: a `FreeTrunk` block holds up to
//! `(block_size - 24) / 4` block numbers as little-endian u32 entries after
//! its header, with `entry_count` entries in use and `next_sibling` chaining
//! to the next trunk. Freeing a block either appends to the head trunk or
//! turns the freed block itself into a new head trunk. Allocating pops an
//! entry, consumes an empty head trunk itself, or grows the file.
//!
//! ## Concurrency
//!
//! Each file carries a structural `RwLock` taken shared by cursors and
//! exclusively by writers, with bounded waits: exceeding the configured
//! wait is a `StoreError::LockTimeout`, never a deadlock. A monotonically
//! increasing version stamp is bumped on every mutation so cursors can
//! detect that their saved position may have moved.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{ensure, Result};
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use zerocopy::IntoBytes;

use crate::error::StoreError;
use super::header::{FileHeader, BLOB_MAGIC, DATA_MAGIC, INDEX_MAGIC};
use super::page::{BlockHeader, BlockKind};
use super::{BlockCache, BlockKey, DiskFile, BLOCK_HEADER_SIZE, FILE_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Data,
    Index,
    Blob,
}

impl FileKind {
    fn magic(self) -> &'static [u8; 8] {
        match self {
            FileKind::Data => DATA_MAGIC,
            FileKind::Index => INDEX_MAGIC,
            FileKind::Blob => BLOB_MAGIC,
        }
    }
}

struct FileState {
    header: FileHeader,
    header_dirty: bool,
    bulk_depth: u32,
}

pub struct BlockFile {
    file_id: u32,
    kind: FileKind,
    disk: Arc<DiskFile>,
    cache: Arc<BlockCache>,
    state: Mutex<FileState>,
    structure: Arc<RwLock<()>>,
    version: AtomicU64,
    lock_wait: Duration,
    created: bool,
}

pub type StructureReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
pub type StructureWriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

impl BlockFile {
    pub fn open(
        path: &Path,
        kind: FileKind,
        file_id: u32,
        cache: Arc<BlockCache>,
        blob_threshold: usize,
        lock_wait: Duration,
    ) -> Result<Self> {
        let block_size = cache.block_size();
        let (disk, created) = DiskFile::open(path, block_size)?;
        let disk = Arc::new(disk);

        let mut header_bytes = [0u8; FILE_HEADER_SIZE];
        disk.read_raw(0, &mut header_bytes)?;
        let fresh = created || header_bytes.iter().all(|&b| b == 0);

        let header = if fresh {
            let header = FileHeader::new(kind.magic(), block_size, blob_threshold);
            disk.write_raw(0, header.as_bytes())?;
            header
        } else {
            FileHeader::from_bytes(&header_bytes, kind.magic(), block_size)?
        };

        Ok(Self {
            file_id,
            kind,
            disk,
            cache,
            state: Mutex::new(FileState {
                header,
                header_dirty: false,
                bulk_depth: 0,
            }),
            structure: Arc::new(RwLock::new(())),
            version: AtomicU64::new(0),
            lock_wait,
            created: fresh,
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// True if this open created the file (or found it empty).
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn file_name(&self) -> String {
        self.disk.file_name()
    }

    pub fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    // -- structural lock -----------------------------------------------

    /// Shared structural lock, held by cursors across yields. The guard is
    /// `'static` (Arc-backed) so it can live inside a cursor.
    pub fn lock_shared(&self) -> Result<StructureReadGuard> {
        self.structure
            .try_read_arc_for(self.lock_wait)
            .ok_or_else(|| {
                StoreError::LockTimeout {
                    file: self.file_name(),
                }
                .into()
            })
    }

    /// Exclusive structural lock for mutations.
    pub fn lock_exclusive(&self) -> Result<StructureWriteGuard> {
        self.structure
            .try_write_arc_for(self.lock_wait)
            .ok_or_else(|| {
                StoreError::LockTimeout {
                    file: self.file_name(),
                }
                .into()
            })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    // -- header state --------------------------------------------------

    pub fn root_block(&self) -> u32 {
        self.state.lock().header.root_block()
    }

    pub fn set_root_block(&self, block_no: u32) {
        let mut state = self.state.lock();
        state.header.set_root_block(block_no);
        state.header_dirty = true;
    }

    pub fn entry_count(&self) -> u64 {
        self.state.lock().header.entry_count()
    }

    pub fn set_entry_count(&self, count: u64) {
        let mut state = self.state.lock();
        state.header.set_entry_count(count);
        state.header_dirty = true;
    }

    pub fn adjust_entry_count(&self, delta: i64) {
        let mut state = self.state.lock();
        let count = state.header.entry_count() as i64 + delta;
        debug_assert!(count >= 0, "entry count underflow");
        state.header.set_entry_count(count.max(0) as u64);
        state.header_dirty = true;
    }

    pub fn block_count(&self) -> u32 {
        self.state.lock().header.block_count()
    }

    pub fn freelist_count(&self) -> u32 {
        self.state.lock().header.freelist_count()
    }

    pub fn blob_threshold(&self) -> usize {
        self.state.lock().header.blob_threshold()
    }

    // -- reserved region -----------------------------------------------

    /// Bytes of block 0 past the file header, available for file-specific
    /// metadata.
    pub fn reserved_len(&self) -> usize {
        self.block_size() - FILE_HEADER_SIZE
    }

    pub fn read_reserved(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.reserved_len()];
        self.disk.read_raw(FILE_HEADER_SIZE as u64, &mut buf)?;
        Ok(buf)
    }

    /// Writes the reserved region, zero-padded to its full length so the
    /// file always covers block 0 entirely.
    pub fn write_reserved(&self, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() <= self.reserved_len(),
            "reserved metadata of {} bytes exceeds the {} available",
            data.len(),
            self.reserved_len()
        );
        let mut buf = vec![0u8; self.reserved_len()];
        buf[..data.len()].copy_from_slice(data);
        self.disk.write_raw(FILE_HEADER_SIZE as u64, &buf)?;
        Ok(())
    }

    // -- block access --------------------------------------------------

    /// Runs `f` over a pinned read-only view of a block.
    pub fn with_block<R>(&self, block_no: u32, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        ensure!(block_no != 0, "block 0 is the file header");
        let key = BlockKey::new(self.file_id, block_no);
        let block = self.cache.get_or_load(key, &self.disk)?;
        f(block.data())
    }

    /// Runs `f` over a pinned mutable view of a block, marking it dirty and
    /// bumping the file version.
    pub fn with_block_mut<R>(
        &self,
        block_no: u32,
        f: impl FnOnce(&mut [u8]) -> Result<R>,
    ) -> Result<R> {
        ensure!(block_no != 0, "block 0 is the file header");
        let key = BlockKey::new(self.file_id, block_no);
        let mut block = self.cache.get_or_load(key, &self.disk)?;
        let result = f(block.data_mut());
        drop(block);
        self.bump_version();
        result
    }

    // -- allocation ----------------------------------------------------

    fn trunk_capacity(&self) -> usize {
        (self.block_size() - BLOCK_HEADER_SIZE) / 4
    }

    /// Returns a usable block number, preferring the freelist. The block's
    /// content is zeroed; the caller formats it.
    pub fn allocate_block(&self) -> Result<u32> {
        let mut state = self.state.lock();

        let trunk = state.header.freelist_head();
        if trunk == 0 {
            let block_no = state.header.block_count();
            state.header.set_block_count(block_no + 1);
            state.header_dirty = true;
            drop(state);
            self.bump_version();
            return Ok(block_no);
        }

        let mut next_trunk = 0u32;
        let popped = self.with_block_mut(trunk, |data| {
            let header = BlockHeader::from_bytes_mut(data)?;
            ensure!(
                header.kind() == BlockKind::FreeTrunk,
                "freelist head {} is not a trunk block",
                trunk
            );
            let n = header.entry_count() as usize;
            if n == 0 {
                next_trunk = header.next_sibling();
                return Ok(None);
            }
            let off = BLOCK_HEADER_SIZE + (n - 1) * 4;
            let entry = u32::from_le_bytes(data[off..off + 4].try_into().unwrap_or([0; 4]));
            let header = BlockHeader::from_bytes_mut(data)?;
            header.set_entry_count(n as u16 - 1);
            Ok(Some(entry))
        })?;

        let block_no = match popped {
            Some(entry) => entry,
            None => {
                // The empty trunk itself is the allocation.
                state.header.set_freelist_head(next_trunk);
                trunk
            }
        };

        let remaining = state.header.freelist_count().saturating_sub(1);
        state.header.set_freelist_count(remaining);
        state.header_dirty = true;
        drop(state);

        // Stale content must not survive into the new life of the block.
        self.with_block_mut(block_no, |data| {
            data.fill(0);
            Ok(())
        })?;

        Ok(block_no)
    }

    /// Returns a block to the freelist.
    pub fn free_block(&self, block_no: u32) -> Result<()> {
        ensure!(block_no != 0, "cannot free the header block");
        let mut state = self.state.lock();
        let head = state.header.freelist_head();

        let appended = if head != 0 {
            let capacity = self.trunk_capacity();
            self.with_block_mut(head, |data| {
                let header = BlockHeader::from_bytes_mut(data)?;
                ensure!(
                    header.kind() == BlockKind::FreeTrunk,
                    "freelist head {} is not a trunk block",
                    head
                );
                let n = header.entry_count() as usize;
                if n >= capacity {
                    return Ok(false);
                }
                header.set_entry_count(n as u16 + 1);
                let off = BLOCK_HEADER_SIZE + n * 4;
                data[off..off + 4].copy_from_slice(&block_no.to_le_bytes());
                Ok(true)
            })?
        } else {
            false
        };

        if !appended {
            // The freed block becomes the new head trunk.
            self.with_block_mut(block_no, |data| {
                data.fill(0);
                let mut header = BlockHeader::new(BlockKind::FreeTrunk, data.len());
                header.set_next_sibling(head);
                header.write_to(data)
            })?;
            state.header.set_freelist_head(block_no);
        }

        let freed = state.header.freelist_count() + 1;
        state.header.set_freelist_count(freed);
        state.header_dirty = true;
        Ok(())
    }

    // -- bulk and durability -------------------------------------------

    /// Enters bulk mode: flushes are deferred until the matching
    /// `end_bulk`. Nestable.
    pub fn begin_bulk(&self) {
        self.state.lock().bulk_depth += 1;
    }

    pub fn end_bulk(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            debug_assert!(state.bulk_depth > 0, "end_bulk without begin_bulk");
            state.bulk_depth = state.bulk_depth.saturating_sub(1);
            if state.bulk_depth > 0 {
                return Ok(());
            }
        }
        self.flush()
    }

    /// Writes the header and every dirty cached block back, then syncs.
    /// A no-op while bulk mode is active.
    pub fn flush(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.bulk_depth > 0 {
                return Ok(());
            }
            if state.header_dirty {
                self.disk.write_raw(0, state.header.as_bytes())?;
                state.header_dirty = false;
            }
        }
        self.cache.flush_file(self.file_id)?;
        self.disk.sync()?;
        Ok(())
    }

    /// Discards all content: the file shrinks to the bare header and every
    /// cached block is dropped unwritten. The caller re-creates the root.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.cache.discard_file(self.file_id);
        self.disk.truncate(1)?;

        let header = FileHeader::new(
            self.kind.magic(),
            self.block_size(),
            state.header.blob_threshold(),
        );
        state.header = header;
        self.disk.write_raw(0, state.header.as_bytes())?;
        state.header_dirty = false;
        drop(state);

        self.disk.sync()?;
        self.bump_version();
        Ok(())
    }
}
