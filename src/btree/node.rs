//! # Slotted Tree Nodes
//!
//! A tree node is one block: the 24-byte header, a slot array of 2-byte
//! cell offsets growing upward from the header, and cell content growing
//! downward from the block end. Slots keep cells ordered without moving
//! content; deleting a cell drops its slot and counts the bytes as
//! fragmentation, reclaimed by compaction when an insert needs the room.
//!
//! ## Cells
//!
//! ```text
//! Leaf cell:      varint key_len | key | varint value_len | value
//! Interior cell:  child u32 LE | subtree_count u64 LE | varint key_len | key
//! ```
//!
//! An interior cell's key is a fence: an upper bound on every key in the
//! child's subtree, strictly below the next cell's fence. `subtree_count`
//! is the number of entries beneath the child, which is what makes
//! rank-based positioning a descent instead of a scan.

use eyre::{bail, ensure, Result};

use crate::serial::varint::{read_varint, varint_len, write_varint};
use crate::storage::{BlockHeader, BlockKind, BLOCK_HEADER_SIZE};

pub const SLOT_SIZE: usize = 2;
const INTERIOR_CELL_FIXED: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Search {
    Found(usize),
    /// Insertion point: the index of the first cell with a greater key.
    Missing(usize),
}

impl Search {
    pub fn index(self) -> usize {
        match self {
            Search::Found(i) | Search::Missing(i) => i,
        }
    }
}

pub fn leaf_cell(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut cell =
        Vec::with_capacity(varint_len(key.len() as u64) + key.len() + varint_len(value.len() as u64) + value.len());
    write_varint(&mut cell, key.len() as u64);
    cell.extend_from_slice(key);
    write_varint(&mut cell, value.len() as u64);
    cell.extend_from_slice(value);
    cell
}

pub fn interior_cell(child: u32, subtree_count: u64, fence: &[u8]) -> Vec<u8> {
    let mut cell = Vec::with_capacity(INTERIOR_CELL_FIXED + varint_len(fence.len() as u64) + fence.len());
    cell.extend_from_slice(&child.to_le_bytes());
    cell.extend_from_slice(&subtree_count.to_le_bytes());
    write_varint(&mut cell, fence.len() as u64);
    cell.extend_from_slice(fence);
    cell
}

/// Subtree count of a raw interior cell.
pub fn interior_cell_count(cell: &[u8]) -> Result<u64> {
    ensure!(cell.len() >= INTERIOR_CELL_FIXED, "interior cell too short");
    Ok(u64::from_le_bytes(cell[4..12].try_into().unwrap_or([0; 8])))
}

/// Key of a raw cell, independent of any node.
pub fn cell_key(kind: BlockKind, cell: &[u8]) -> Result<&[u8]> {
    let body = match kind {
        BlockKind::Leaf => cell,
        BlockKind::Interior => {
            ensure!(cell.len() >= INTERIOR_CELL_FIXED, "interior cell too short");
            &cell[INTERIOR_CELL_FIXED..]
        }
        other => bail!("not a tree node kind: {:?}", other),
    };
    let (klen, n) = read_varint(body)?;
    let end = n + klen as usize;
    ensure!(body.len() >= end, "cell key extends past cell");
    Ok(&body[n..end])
}

pub struct Node<'a> {
    data: &'a [u8],
}

impl<'a> Node<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let header = BlockHeader::from_bytes(data)?;
        ensure!(
            matches!(header.kind(), BlockKind::Leaf | BlockKind::Interior),
            "expected a tree node, found {:?}",
            header.kind()
        );
        Ok(Self { data })
    }

    pub fn kind(&self) -> BlockKind {
        BlockHeader::from_bytes(self.data)
            .map(|h| h.kind())
            .unwrap_or(BlockKind::Unknown)
    }

    pub fn is_leaf(&self) -> bool {
        self.kind() == BlockKind::Leaf
    }

    fn header(&self) -> Result<&BlockHeader> {
        BlockHeader::from_bytes(self.data)
    }

    pub fn count(&self) -> usize {
        self.header().map(|h| h.entry_count() as usize).unwrap_or(0)
    }

    pub fn next_sibling(&self) -> u32 {
        self.header().map(|h| h.next_sibling()).unwrap_or(0)
    }

    pub fn prev_sibling(&self) -> u32 {
        self.header().map(|h| h.prev_sibling()).unwrap_or(0)
    }

    fn slot(&self, index: usize) -> Result<usize> {
        ensure!(
            index < self.count(),
            "slot {} out of bounds (count={})",
            index,
            self.count()
        );
        let off = BLOCK_HEADER_SIZE + index * SLOT_SIZE;
        let raw = u16::from_le_bytes([self.data[off], self.data[off + 1]]);
        let cell_off = raw as usize;
        ensure!(
            cell_off >= BLOCK_HEADER_SIZE && cell_off < self.data.len(),
            "cell offset {} out of block",
            cell_off
        );
        Ok(cell_off)
    }

    /// Total length of the cell starting at `off`.
    fn cell_len_at(&self, off: usize) -> Result<usize> {
        match self.kind() {
            BlockKind::Leaf => {
                let (klen, kn) = read_varint(&self.data[off..])?;
                let voff = off + kn + klen as usize;
                ensure!(voff < self.data.len(), "leaf cell extends past block");
                let (vlen, vn) = read_varint(&self.data[voff..])?;
                Ok(kn + klen as usize + vn + vlen as usize)
            }
            _ => {
                let koff = off + INTERIOR_CELL_FIXED;
                ensure!(koff < self.data.len(), "interior cell extends past block");
                let (klen, kn) = read_varint(&self.data[koff..])?;
                Ok(INTERIOR_CELL_FIXED + kn + klen as usize)
            }
        }
    }

    pub fn cell(&self, index: usize) -> Result<&'a [u8]> {
        let off = self.slot(index)?;
        let len = self.cell_len_at(off)?;
        ensure!(off + len <= self.data.len(), "cell extends past block");
        Ok(&self.data[off..off + len])
    }

    pub fn key(&self, index: usize) -> Result<&'a [u8]> {
        let off = self.slot(index)?;
        let koff = if self.is_leaf() {
            off
        } else {
            off + INTERIOR_CELL_FIXED
        };
        let (klen, kn) = read_varint(&self.data[koff..])?;
        let start = koff + kn;
        let end = start + klen as usize;
        ensure!(end <= self.data.len(), "key extends past block");
        Ok(&self.data[start..end])
    }

    pub fn value(&self, index: usize) -> Result<&'a [u8]> {
        ensure!(self.is_leaf(), "interior cells carry no value");
        let off = self.slot(index)?;
        let (klen, kn) = read_varint(&self.data[off..])?;
        let voff = off + kn + klen as usize;
        let (vlen, vn) = read_varint(&self.data[voff..])?;
        let start = voff + vn;
        let end = start + vlen as usize;
        ensure!(end <= self.data.len(), "value extends past block");
        Ok(&self.data[start..end])
    }

    pub fn child(&self, index: usize) -> Result<u32> {
        ensure!(!self.is_leaf(), "leaf cells carry no child");
        let off = self.slot(index)?;
        Ok(u32::from_le_bytes(
            self.data[off..off + 4].try_into().unwrap_or([0; 4]),
        ))
    }

    pub fn subtree_count(&self, index: usize) -> Result<u64> {
        ensure!(!self.is_leaf(), "leaf cells carry no subtree count");
        let off = self.slot(index)?;
        Ok(u64::from_le_bytes(
            self.data[off + 4..off + 12].try_into().unwrap_or([0; 8]),
        ))
    }

    /// Binary search by key. For interior nodes this lands on the first
    /// fence >= the needle, which is the child to descend into.
    pub fn search(&self, needle: &[u8]) -> Result<Search> {
        let mut lo = 0usize;
        let mut hi = self.count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key(mid)?.cmp(needle) {
                std::cmp::Ordering::Equal => return Ok(Search::Found(mid)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(Search::Missing(lo))
    }

    /// Live bytes: slots plus cell content, excluding fragmentation.
    pub fn used_bytes(&self) -> Result<usize> {
        let mut used = self.count() * SLOT_SIZE;
        for i in 0..self.count() {
            let off = self.slot(i)?;
            used += self.cell_len_at(off)?;
        }
        Ok(used)
    }

    pub fn cells(&self) -> Result<Vec<Vec<u8>>> {
        (0..self.count()).map(|i| Ok(self.cell(i)?.to_vec())).collect()
    }
}

pub struct NodeMut<'a> {
    data: &'a mut [u8],
}

impl<'a> NodeMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<Self> {
        Node::new(data)?;
        Ok(Self { data })
    }

    /// Formats `data` as a fresh empty node.
    pub fn init(data: &'a mut [u8], kind: BlockKind) -> Result<Self> {
        data.fill(0);
        let block_size = data.len();
        BlockHeader::new(kind, block_size).write_to(data)?;
        Ok(Self { data })
    }

    pub fn node(&self) -> Node<'_> {
        Node { data: self.data }
    }

    fn header_mut(&mut self) -> Result<&mut BlockHeader> {
        BlockHeader::from_bytes_mut(self.data)
    }

    fn write_slot(&mut self, index: usize, cell_off: usize) {
        let off = BLOCK_HEADER_SIZE + index * SLOT_SIZE;
        self.data[off..off + 2].copy_from_slice(&(cell_off as u16).to_le_bytes());
    }

    pub fn set_next_sibling(&mut self, block_no: u32) -> Result<()> {
        self.header_mut()?.set_next_sibling(block_no);
        Ok(())
    }

    pub fn set_prev_sibling(&mut self, block_no: u32) -> Result<()> {
        self.header_mut()?.set_prev_sibling(block_no);
        Ok(())
    }

    /// In-place subtree count update; the cell's size never changes.
    pub fn set_subtree_count(&mut self, index: usize, count: u64) -> Result<()> {
        let off = self.node().slot(index)?;
        self.data[off + 4..off + 12].copy_from_slice(&count.to_le_bytes());
        Ok(())
    }

    /// Inserts a cell at slot `index`. Returns false when the node lacks
    /// the space even after compaction; the caller splits.
    pub fn insert_cell(&mut self, index: usize, cell: &[u8]) -> Result<bool> {
        let need = cell.len() + SLOT_SIZE;
        let header = BlockHeader::from_bytes(self.data)?;
        let free = header.free_space() as usize;
        let frag = header.frag_bytes() as usize;
        if free < need {
            if free + frag < need {
                return Ok(false);
            }
            self.compact()?;
        }

        let header = self.header_mut()?;
        let count = header.entry_count() as usize;
        ensure!(index <= count, "insert index {} out of bounds", index);
        let free_end = header.free_end() as usize - cell.len();
        header.set_free_end(free_end as u16);
        header.set_free_start(header.free_start() + SLOT_SIZE as u16);
        header.set_entry_count(count as u16 + 1);

        self.data[free_end..free_end + cell.len()].copy_from_slice(cell);

        let slot_base = BLOCK_HEADER_SIZE;
        let src = slot_base + index * SLOT_SIZE;
        let end = slot_base + count * SLOT_SIZE;
        self.data.copy_within(src..end, src + SLOT_SIZE);
        self.write_slot(index, free_end);
        Ok(true)
    }

    pub fn remove_cell(&mut self, index: usize) -> Result<()> {
        let off = self.node().slot(index)?;
        let len = self.node().cell_len_at(off)?;

        let header = self.header_mut()?;
        let count = header.entry_count() as usize;
        header.set_entry_count(count as u16 - 1);
        header.set_free_start(header.free_start() - SLOT_SIZE as u16);
        header.set_frag_bytes(header.frag_bytes() + len as u16);

        let slot_base = BLOCK_HEADER_SIZE;
        let src = slot_base + (index + 1) * SLOT_SIZE;
        let end = slot_base + count * SLOT_SIZE;
        self.data.copy_within(src..end, src - SLOT_SIZE);
        Ok(())
    }

    /// Swaps the cell at `index` for a new one. On false the old cell is
    /// already gone and the caller must rebuild the node.
    pub fn replace_cell(&mut self, index: usize, cell: &[u8]) -> Result<bool> {
        self.remove_cell(index)?;
        self.insert_cell(index, cell)
    }

    /// Rewrites the node from scratch with the given cells, in order.
    /// Returns false if they cannot fit in one node.
    pub fn write_all(&mut self, kind: BlockKind, cells: &[Vec<u8>]) -> Result<bool> {
        let capacity = self.data.len() - BLOCK_HEADER_SIZE;
        let need: usize = cells.iter().map(|c| c.len() + SLOT_SIZE).sum();
        if need > capacity {
            return Ok(false);
        }

        let block_size = self.data.len();
        self.data.fill(0);
        BlockHeader::new(kind, block_size).write_to(self.data)?;

        let mut free_end = block_size;
        for (i, cell) in cells.iter().enumerate() {
            free_end -= cell.len();
            self.data[free_end..free_end + cell.len()].copy_from_slice(cell);
            self.write_slot(i, free_end);
        }

        let header = self.header_mut()?;
        header.set_entry_count(cells.len() as u16);
        header.set_free_start((BLOCK_HEADER_SIZE + cells.len() * SLOT_SIZE) as u16);
        header.set_free_end(free_end as u16);
        Ok(true)
    }

    /// Rewrites cell content contiguously, reclaiming fragmented space.
    fn compact(&mut self) -> Result<()> {
        let kind = self.node().kind();
        let cells = self.node().cells()?;
        let next = self.node().next_sibling();
        let prev = self.node().prev_sibling();
        ensure!(self.write_all(kind, &cells)?, "compaction must fit");
        self.set_next_sibling(next)?;
        self.set_prev_sibling(prev)?;
        Ok(())
    }
}
