//! # Object File
//!
//! The primary store of a database: one B+-tree keyed by object id, with
//! encoded records as values, plus a companion blob file for records too
//! large to inline.
//!
//! ## Value format
//!
//! Each tree value starts with a marker byte:
//!
//! ```text
//! 0x00 | record bytes                         (inline)
//! 0xFE | total_len u64 LE | first_block u32 LE (blob pointer)
//! ```
//!
//! Records whose encoding exceeds the blob threshold move to the blob
//! file as a chain of `Blob` blocks linked through `next_sibling`, each
//! carrying its payload byte count in `entry_count`. The tree value then
//! holds only the 13-byte pointer, which keeps leaves dense regardless of
//! record size. Updating or deleting a spilled record reclaims its whole
//! chain.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{ensure, Result};
use tracing::debug;

use crate::btree::Tree;
use crate::error::StoreError;
use crate::guid::ObjectId;
use crate::storage::{
    BlockCache, BlockFile, BlockHeader, BlockKind, FileKind, BLOCK_HEADER_SIZE,
};

const INLINE_MARKER: u8 = 0x00;
const BLOB_MARKER: u8 = 0xFE;
const BLOB_POINTER_LEN: usize = 13;

/// Counters reported by [`ObjectFile::compute_statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStatistics {
    pub entry_count: u64,
    pub block_count: u32,
    pub free_block_count: u32,
    pub blob_block_count: u32,
    pub blob_free_count: u32,
    pub full_scan_count: u64,
}

pub struct ObjectFile {
    data: BlockFile,
    blobs: BlockFile,
    full_scans: AtomicU64,
}

impl ObjectFile {
    pub fn open(
        data_path: &Path,
        blob_path: &Path,
        file_ids: (u32, u32),
        cache: Arc<BlockCache>,
        blob_threshold: usize,
        lock_wait: Duration,
    ) -> Result<Self> {
        let data = BlockFile::open(
            data_path,
            FileKind::Data,
            file_ids.0,
            Arc::clone(&cache),
            blob_threshold,
            lock_wait,
        )?;
        let blobs = BlockFile::open(
            blob_path,
            FileKind::Blob,
            file_ids.1,
            cache,
            blob_threshold,
            lock_wait,
        )?;
        Ok(Self {
            data,
            blobs,
            full_scans: AtomicU64::new(0),
        })
    }

    pub fn file(&self) -> &BlockFile {
        &self.data
    }

    pub fn tree(&self) -> Tree<'_> {
        Tree::new(&self.data)
    }

    pub fn entry_count(&self) -> u64 {
        self.data.entry_count()
    }

    /// Bumped by the query layer whenever a filter degrades to walking
    /// every record.
    pub fn note_full_scan(&self) {
        self.full_scans.fetch_add(1, Ordering::Relaxed);
    }

    // -- record operations ---------------------------------------------

    /// Inserts a record under an id that must not be taken yet.
    pub fn save_new(&self, id: &ObjectId, record: &[u8]) -> Result<()> {
        ensure!(!id.is_nil(), "cannot save a record without an id");
        let _lock = self.data.lock_exclusive()?;
        let tree = self.tree();
        if tree.contains(id.as_bytes())? {
            return Err(StoreError::Capacity(format!("id {id} already in use")).into());
        }
        let value = self.encode_value(record)?;
        tree.insert(id.as_bytes(), &value)?;
        Ok(())
    }

    /// Replaces the record under an existing id, reclaiming any blob
    /// chain the old value held.
    pub fn update(&self, id: &ObjectId, record: &[u8]) -> Result<()> {
        let _lock = self.data.lock_exclusive()?;
        let tree = self.tree();
        let old = tree
            .get(id.as_bytes())?
            .ok_or(StoreError::NotFound { id: *id })?;
        let value = self.encode_value(record)?;
        tree.insert(id.as_bytes(), &value)?;
        self.release_value(&old)?;
        Ok(())
    }

    pub fn delete(&self, id: &ObjectId) -> Result<()> {
        let _lock = self.data.lock_exclusive()?;
        let old = self
            .tree()
            .remove(id.as_bytes())?
            .ok_or(StoreError::NotFound { id: *id })?;
        self.release_value(&old)?;
        Ok(())
    }

    pub fn load(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let _lock = self.data.lock_shared()?;
        let value = self
            .tree()
            .get(id.as_bytes())?
            .ok_or(StoreError::NotFound { id: *id })?;
        self.resolve(&value)
    }

    pub fn contains(&self, id: &ObjectId) -> Result<bool> {
        let _lock = self.data.lock_shared()?;
        self.tree().contains(id.as_bytes())
    }

    /// Drops every record, including all blob chains.
    pub fn clear(&self) -> Result<()> {
        let _lock = self.data.lock_exclusive()?;
        self.tree().clear()?;
        self.blobs.reset()?;
        Ok(())
    }

    // -- value encoding ------------------------------------------------

    /// Resolves a tree value back to the record bytes, following the blob
    /// pointer if the record was spilled.
    pub fn resolve(&self, value: &[u8]) -> Result<Vec<u8>> {
        match value.first() {
            Some(&INLINE_MARKER) => Ok(value[1..].to_vec()),
            Some(&BLOB_MARKER) if value.len() == BLOB_POINTER_LEN => {
                let total = u64::from_le_bytes(value[1..9].try_into().unwrap_or([0; 8]));
                let first = u32::from_le_bytes(value[9..13].try_into().unwrap_or([0; 4]));
                self.read_blob(first, total as usize)
            }
            _ => Err(StoreError::Corrupt("unrecognized value marker".to_owned()).into()),
        }
    }

    fn encode_value(&self, record: &[u8]) -> Result<Vec<u8>> {
        if record.len() <= self.data.blob_threshold() {
            let mut value = Vec::with_capacity(record.len() + 1);
            value.push(INLINE_MARKER);
            value.extend_from_slice(record);
            return Ok(value);
        }

        let first = self.write_blob(record)?;
        let mut value = Vec::with_capacity(BLOB_POINTER_LEN);
        value.push(BLOB_MARKER);
        value.extend_from_slice(&(record.len() as u64).to_le_bytes());
        value.extend_from_slice(&first.to_le_bytes());
        Ok(value)
    }

    fn release_value(&self, value: &[u8]) -> Result<()> {
        if value.first() == Some(&BLOB_MARKER) && value.len() == BLOB_POINTER_LEN {
            let first = u32::from_le_bytes(value[9..13].try_into().unwrap_or([0; 4]));
            self.free_blob(first)?;
        }
        Ok(())
    }

    // -- blob chains ---------------------------------------------------

    fn chunk_capacity(&self) -> usize {
        self.blobs.block_size() - BLOCK_HEADER_SIZE
    }

    fn write_blob(&self, record: &[u8]) -> Result<u32> {
        let capacity = self.chunk_capacity();
        let chunks: Vec<&[u8]> = record.chunks(capacity).collect();
        let blocks: Vec<u32> = (0..chunks.len())
            .map(|_| self.blobs.allocate_block())
            .collect::<Result<_>>()?;
        debug!(bytes = record.len(), blocks = blocks.len(), "spilling record to blob chain");

        for (i, (&block_no, chunk)) in blocks.iter().zip(&chunks).enumerate() {
            let next = blocks.get(i + 1).copied().unwrap_or(0);
            self.blobs.with_block_mut(block_no, |data| {
                let mut header = BlockHeader::new(BlockKind::Blob, data.len());
                header.set_entry_count(chunk.len() as u16);
                header.set_next_sibling(next);
                header.write_to(data)?;
                data[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
                Ok(())
            })?;
        }
        Ok(blocks[0])
    }

    fn read_blob(&self, first: u32, total: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(total);
        let mut block_no = first;
        while block_no != 0 {
            block_no = self.blobs.with_block(block_no, |data| {
                let header = BlockHeader::from_bytes(data)?;
                ensure!(
                    header.kind() == BlockKind::Blob,
                    "blob chain runs through a non-blob block"
                );
                let len = header.entry_count() as usize;
                ensure!(
                    BLOCK_HEADER_SIZE + len <= data.len(),
                    "blob payload length exceeds block"
                );
                out.extend_from_slice(&data[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + len]);
                Ok(header.next_sibling())
            })?;
        }
        if out.len() != total {
            return Err(StoreError::Corrupt(format!(
                "blob chain holds {} bytes, pointer says {}",
                out.len(),
                total
            ))
            .into());
        }
        Ok(out)
    }

    fn free_blob(&self, first: u32) -> Result<()> {
        let mut block_no = first;
        while block_no != 0 {
            let next = self.blobs.with_block(block_no, |data| {
                Ok(BlockHeader::from_bytes(data)?.next_sibling())
            })?;
            self.blobs.free_block(block_no)?;
            block_no = next;
        }
        Ok(())
    }

    // -- durability ----------------------------------------------------

    pub fn begin_bulk(&self) {
        self.data.begin_bulk();
        self.blobs.begin_bulk();
    }

    pub fn end_bulk(&self) -> Result<()> {
        self.data.end_bulk()?;
        self.blobs.end_bulk()
    }

    pub fn flush(&self) -> Result<()> {
        self.data.flush()?;
        self.blobs.flush()
    }

    pub fn compute_statistics(&self) -> FileStatistics {
        FileStatistics {
            entry_count: self.data.entry_count(),
            block_count: self.data.block_count(),
            free_block_count: self.data.freelist_count(),
            blob_block_count: self.blobs.block_count(),
            blob_free_count: self.blobs.freelist_count(),
            full_scan_count: self.full_scans.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;
    use crate::storage::DEFAULT_CACHE_CAPACITY;

    fn open(dir: &Path, cache: &Arc<BlockCache>) -> ObjectFile {
        ObjectFile::open(
            &dir.join("objects.db"),
            &dir.join("objects.blob"),
            (1, 2),
            Arc::clone(cache),
            200,
            Duration::from_millis(200),
        )
        .unwrap()
    }

    fn scratch() -> (tempfile::TempDir, Arc<BlockCache>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(DEFAULT_CACHE_CAPACITY, 1024).unwrap());
        (dir, cache)
    }

    #[test]
    fn inline_records_roundtrip() {
        let (dir, cache) = scratch();
        let objects = open(dir.path(), &cache);

        let id = ObjectId::random();
        objects.save_new(&id, b"small record").unwrap();
        assert!(objects.contains(&id).unwrap());
        assert_eq!(objects.load(&id).unwrap(), b"small record");
        // Nothing spilled.
        assert_eq!(objects.compute_statistics().blob_block_count, 1);
    }

    #[test]
    fn large_records_spill_to_blob_chains() {
        let (dir, cache) = scratch();
        let objects = open(dir.path(), &cache);

        // Three blob blocks at 1000 payload bytes each.
        let record: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let id = ObjectId::random();
        objects.save_new(&id, &record).unwrap();

        let stats = objects.compute_statistics();
        assert_eq!(stats.blob_block_count, 4); // header block + 3 chain blocks
        assert_eq!(objects.load(&id).unwrap(), record);
    }

    #[test]
    fn update_reclaims_the_old_chain() {
        let (dir, cache) = scratch();
        let objects = open(dir.path(), &cache);

        let id = ObjectId::random();
        objects.save_new(&id, &vec![7u8; 2500]).unwrap();
        let grown = objects.compute_statistics().blob_block_count;

        objects.update(&id, b"tiny now").unwrap();
        let stats = objects.compute_statistics();
        assert_eq!(stats.blob_block_count, grown);
        assert_eq!(stats.blob_free_count, 3);
        assert_eq!(objects.load(&id).unwrap(), b"tiny now");

        // The freed chain is reused by the next spill.
        objects.update(&id, &vec![9u8; 2500]).unwrap();
        assert_eq!(objects.compute_statistics().blob_block_count, grown);
    }

    #[test]
    fn delete_removes_record_and_chain() {
        let (dir, cache) = scratch();
        let objects = open(dir.path(), &cache);

        let id = ObjectId::random();
        objects.save_new(&id, &vec![3u8; 1500]).unwrap();
        objects.delete(&id).unwrap();

        assert!(!objects.contains(&id).unwrap());
        assert_eq!(objects.entry_count(), 0);
        let stats = objects.compute_statistics();
        assert_eq!(stats.blob_free_count, 2);

        let err = objects.load(&id).unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::NotFound { .. })));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let (dir, cache) = scratch();
        let objects = open(dir.path(), &cache);

        let id = ObjectId::random();
        objects.save_new(&id, b"first").unwrap();
        let err = objects.save_new(&id, b"second").unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::Capacity(_))));
        assert_eq!(objects.load(&id).unwrap(), b"first");
    }

    #[test]
    fn update_of_missing_id_is_not_found() {
        let (dir, cache) = scratch();
        let objects = open(dir.path(), &cache);
        let err = objects.update(&ObjectId::random(), b"x").unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::NotFound { .. })));
    }

    #[test]
    fn clear_resets_both_files() {
        let (dir, cache) = scratch();
        let objects = open(dir.path(), &cache);

        for _ in 0..10 {
            objects.save_new(&ObjectId::random(), &vec![1u8; 1500]).unwrap();
        }
        objects.clear().unwrap();

        let stats = objects.compute_statistics();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.blob_block_count, 1);
        assert_eq!(stats.blob_free_count, 0);
    }

    #[test]
    fn records_scan_in_id_order() {
        let (dir, cache) = scratch();
        let objects = open(dir.path(), &cache);

        let mut ids: Vec<ObjectId> = (0..50).map(|_| ObjectId::random()).collect();
        for id in &ids {
            objects.save_new(id, id.as_bytes()).unwrap();
        }
        ids.sort();

        let tree = objects.tree();
        let mut cursor = crate::btree::Cursor::before_first();
        let mut seen = Vec::new();
        while let Some((key, value)) = cursor.next(&tree).unwrap() {
            assert_eq!(objects.resolve(&value).unwrap(), key);
            seen.push(ObjectId::from_slice(&key).unwrap());
        }
        assert_eq!(seen, ids);
    }
}
