//! # SIEVE Block Cache with Lock Sharding
//!
//! One cache serves every file in a store, keyed by `(file_id, block_no)`.
//! Eviction uses the SIEVE algorithm: a `visited` flag is set on access and
//! a "hand" pointer scans for victims, clearing the flag once (second
//! chance) before evicting. Sequential scans therefore cannot flush out
//! blocks that other operations keep touching.
//!
//! The cache is split into [`super::CACHE_SHARD_COUNT`] shards, each behind
//! its own `RwLock`, with blocks assigned by
//! `(file_id * 31 + block_no) % shards`.
//!
//! ## Write-Back
//!
//! The cache is the write buffer: mutating a block only dirties its cached
//! image. Dirty blocks reach disk when their file flushes, or when the
//! eviction hand picks them, in which case the entry's own disk handle is
//! used for the write-back. Each entry therefore carries an
//! `Arc<DiskFile>`, so eviction never needs to look up which file a victim
//! belongs to.
//!
//! ## Pin Protocol
//!
//! Blocks are pinned while a [`BlockRef`] is alive and pinned blocks are
//! never evicted. `BlockRef` unpins on drop.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::{DiskFile, CACHE_SHARD_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub file_id: u32,
    pub block_no: u32,
}

impl BlockKey {
    pub fn new(file_id: u32, block_no: u32) -> Self {
        Self { file_id, block_no }
    }
}

struct CacheEntry {
    key: BlockKey,
    disk: Arc<DiskFile>,
    visited: AtomicBool,
    dirty: AtomicBool,
    pin_count: AtomicU32,
    data: Box<[u8]>,
}

impl CacheEntry {
    fn new(key: BlockKey, disk: Arc<DiskFile>, block_size: usize) -> Self {
        Self {
            key,
            disk,
            visited: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            data: vec![0u8; block_size].into_boxed_slice(),
        }
    }

    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned block");
    }

    fn mark_visited(&self) {
        self.visited.store(true, Ordering::Release);
    }

    fn clear_visited(&self) -> bool {
        self.visited.swap(false, Ordering::AcqRel)
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

struct CacheShard {
    entries: Vec<CacheEntry>,
    index: HashMap<BlockKey, usize>,
    hand: usize,
    capacity: usize,
}

impl CacheShard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    fn get(&self, key: &BlockKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// SIEVE victim selection. Returns the index of an unpinned entry whose
    /// visited flag was already clear, or None if everything is pinned.
    fn pick_victim(&mut self) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }

        let mut passes_at_start = 0usize;
        let start = self.hand;

        loop {
            let entry = &self.entries[self.hand];

            if entry.is_pinned() {
                self.hand = (self.hand + 1) % self.entries.len();
                if self.hand == start {
                    passes_at_start += 1;
                    if passes_at_start >= 2 {
                        return None;
                    }
                }
                continue;
            }

            if entry.clear_visited() {
                self.hand = (self.hand + 1) % self.entries.len();
                continue;
            }

            return Some(self.hand);
        }
    }

    fn remove(&mut self, idx: usize) -> CacheEntry {
        let entry = self.entries.swap_remove(idx);
        self.index.remove(&entry.key);

        if idx < self.entries.len() {
            let moved_key = self.entries[idx].key;
            self.index.insert(moved_key, idx);
        }

        if self.hand >= self.entries.len() {
            self.hand = 0;
        }

        entry
    }

    fn insert(&mut self, entry: CacheEntry) -> usize {
        let key = entry.key;
        let idx = self.entries.len();
        self.entries.push(entry);
        self.index.insert(key, idx);
        idx
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct BlockCache {
    shards: Vec<RwLock<CacheShard>>,
    block_size: usize,
}

impl BlockCache {
    pub fn new(total_capacity: usize, block_size: usize) -> Result<Self> {
        ensure!(
            total_capacity >= CACHE_SHARD_COUNT,
            "cache capacity {} must be at least {} (one block per shard)",
            total_capacity,
            CACHE_SHARD_COUNT
        );

        let per_shard = total_capacity / CACHE_SHARD_COUNT;
        let remainder = total_capacity % CACHE_SHARD_COUNT;

        let shards: Vec<_> = (0..CACHE_SHARD_COUNT)
            .map(|i| {
                let cap = if i < remainder { per_shard + 1 } else { per_shard };
                RwLock::new(CacheShard::new(cap))
            })
            .collect();

        Ok(Self { shards, block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn shard(&self, key: &BlockKey) -> &RwLock<CacheShard> {
        let hash = (key.file_id as usize)
            .wrapping_mul(31)
            .wrapping_add(key.block_no as usize);
        &self.shards[hash % CACHE_SHARD_COUNT]
    }

    /// Returns the cached block, pinned, loading it through `disk` on a
    /// miss. Eviction of a dirty victim writes it back first.
    pub fn get_or_load(&self, key: BlockKey, disk: &Arc<DiskFile>) -> Result<BlockRef<'_>> {
        {
            let guard = self.shard(&key).read();
            if let Some(idx) = guard.get(&key) {
                guard.entries[idx].pin();
                guard.entries[idx].mark_visited();
                return Ok(BlockRef { cache: self, key });
            }
        }

        let mut guard = self.shard(&key).write();

        // Raced with another loader.
        if let Some(idx) = guard.get(&key) {
            guard.entries[idx].pin();
            guard.entries[idx].mark_visited();
            return Ok(BlockRef { cache: self, key });
        }

        if guard.is_full() {
            match guard.pick_victim() {
                Some(idx) => {
                    let victim = guard.remove(idx);
                    if victim.is_dirty() {
                        victim.disk.write_block(victim.key.block_no, &victim.data)?;
                    }
                }
                None => eyre::bail!(
                    "cache shard full and every block pinned (capacity={})",
                    guard.capacity
                ),
            }
        }

        let mut entry = CacheEntry::new(key, Arc::clone(disk), self.block_size);
        disk.read_block_into(key.block_no, &mut entry.data)?;
        entry.pin();
        entry.mark_visited();
        guard.insert(entry);

        Ok(BlockRef { cache: self, key })
    }

    fn data(&self, key: &BlockKey) -> &[u8] {
        let guard = self.shard(key).read();
        let idx = guard.get(key).expect("block not in cache");
        let entry = &guard.entries[idx];
        let ptr = entry.data.as_ptr();
        let len = entry.data.len();
        // SAFETY: the buffer lives in a pinned entry (a BlockRef exists for
        // this key, so pin_count > 0) and pinned entries are never removed
        // or swap-relocated in a way that frees the Box. The Box allocation
        // is stable across Vec reallocation of the entries themselves.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    // SAFETY: returns a mutable slice while holding only a read lock. The
    // caller must hold the one-and-only BlockRef for this key mutably, so
    // no aliasing reference can exist.
    #[allow(clippy::mut_from_ref)]
    unsafe fn data_mut_unchecked(&self, key: &BlockKey) -> &mut [u8] {
        let guard = self.shard(key).read();
        let idx = guard.get(key).expect("block not in cache");
        let entry = &guard.entries[idx];
        entry.mark_dirty();
        let ptr = entry.data.as_ptr() as *mut u8;
        let len = entry.data.len();
        std::slice::from_raw_parts_mut(ptr, len)
    }

    fn unpin(&self, key: &BlockKey) {
        let guard = self.shard(key).read();
        if let Some(idx) = guard.get(key) {
            guard.entries[idx].unpin();
        }
    }

    /// Writes every dirty block belonging to `file_id` back to disk and
    /// clears its dirty flag. Returns the number of blocks written.
    pub fn flush_file(&self, file_id: u32) -> Result<usize> {
        let mut flushed = 0;
        for shard in &self.shards {
            let guard = shard.read();
            for entry in &guard.entries {
                if entry.key.file_id == file_id && entry.is_dirty() {
                    entry.disk.write_block(entry.key.block_no, &entry.data)?;
                    entry.clear_dirty();
                    flushed += 1;
                }
            }
        }
        Ok(flushed)
    }

    /// Drops every cached block of `file_id` without writing anything.
    /// Used by `clear`, where the file's contents are being discarded.
    pub fn discard_file(&self, file_id: u32) {
        for shard in &self.shards {
            let mut guard = shard.write();
            let mut i = 0;
            while i < guard.entries.len() {
                if guard.entries[i].key.file_id == file_id {
                    debug_assert!(!guard.entries[i].is_pinned());
                    guard.remove(i);
                } else {
                    i += 1;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pinned view of one cached block. The block cannot be evicted while this
/// guard is alive; mutation goes through `data_mut` and marks it dirty.
pub struct BlockRef<'a> {
    cache: &'a BlockCache,
    key: BlockKey,
}

impl<'a> BlockRef<'a> {
    pub fn key(&self) -> &BlockKey {
        &self.key
    }

    pub fn data(&self) -> &[u8] {
        self.cache.data(&self.key)
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: &mut self guarantees this is the only live reference
        // through this BlockRef, and the pin keeps the buffer alive.
        unsafe { self.cache.data_mut_unchecked(&self.key) }
    }
}

impl Drop for BlockRef<'_> {
    fn drop(&mut self) {
        self.cache.unpin(&self.key);
    }
}
