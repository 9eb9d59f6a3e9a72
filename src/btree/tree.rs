//! # Counted B+-Tree
//!
//! All entries live in leaves, chained bidirectionally for range scans.
//! Interior cells carry `(child, subtree_count, fence)` where the fence is
//! an upper bound on the child's keys and `subtree_count` the number of
//! entries beneath it. Counts make rank arithmetic a descent: the rank of
//! an entry is the sum of the subtree counts left of the path down to it,
//! which is what `seek_rank` and `rank_of` exploit for O(depth) paging.
//!
//! ## Fences
//!
//! Fences are created at splits and merges and never tightened otherwise,
//! so the last fence of a node may sit below the actual subtree maximum
//! after appends beyond it. Every descent therefore clamps to the last
//! child when the search key exceeds all fences; no operation relies on
//! fence tightness, only on the separator property between siblings.
//!
//! ## Structural Changes
//!
//! Inserts split bottom-up: a full leaf splits at its byte midpoint, the
//! parent replaces the child's cell and inserts one for the new right
//! node, splitting itself if needed, up to a root split that adds a level.
//! Deletes unlink and free a leaf the moment it empties, merge an
//! underfull leaf into its sibling when both fit in one node, and collapse
//! the root while it is an interior with a single child. Deleting every
//! entry always ends with a single empty root leaf.
//!
//! The tree does no locking; callers serialize writers through the file's
//! structural lock.

use eyre::{ensure, Result};

use crate::error::StoreError;
use crate::storage::{BlockFile, BlockKind, BLOCK_HEADER_SIZE};

use super::node::{
    cell_key, interior_cell, interior_cell_count, leaf_cell, Node, NodeMut, Search, SLOT_SIZE,
};

/// A stable reference to one entry: the leaf block, the slot inside it,
/// and the entry's rank in the whole tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub block: u32,
    pub slot: usize,
    pub rank: u64,
}

enum Ins {
    Done {
        added: bool,
        old: Option<Vec<u8>>,
    },
    Split {
        left_count: u64,
        left_max: Vec<u8>,
        right_block: u32,
        right_count: u64,
        right_max: Vec<u8>,
        added: bool,
        old: Option<Vec<u8>>,
    },
}

enum Del {
    Missing,
    Removed { old: Vec<u8>, now_empty: bool },
}

pub struct Tree<'a> {
    file: &'a BlockFile,
}

impl<'a> Tree<'a> {
    pub fn new(file: &'a BlockFile) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &BlockFile {
        self.file
    }

    pub fn len(&self) -> u64 {
        self.file.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest accepted key. Keys are a fixed fraction of the block so a
    /// node always holds several cells.
    pub fn max_key_len(&self) -> usize {
        self.file.block_size() / 8
    }

    fn ensure_root(&self) -> Result<u32> {
        let root = self.file.root_block();
        if root != 0 {
            return Ok(root);
        }
        let block = self.file.allocate_block()?;
        self.file.with_block_mut(block, |data| {
            NodeMut::init(data, BlockKind::Leaf)?;
            Ok(())
        })?;
        self.file.set_root_block(block);
        Ok(block)
    }

    // -- point reads ---------------------------------------------------

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        enum Step {
            Descend(u32),
            Hit(Vec<u8>),
            Miss,
        }

        let mut block = self.file.root_block();
        if block == 0 {
            return Ok(None);
        }
        loop {
            let step = self.file.with_block(block, |data| {
                let node = Node::new(data)?;
                if node.is_leaf() {
                    return match node.search(key)? {
                        Search::Found(i) => Ok(Step::Hit(node.value(i)?.to_vec())),
                        Search::Missing(_) => Ok(Step::Miss),
                    };
                }
                let n = node.count();
                ensure!(n > 0, "interior node without children");
                let idx = node.search(key)?.index().min(n - 1);
                Ok(Step::Descend(node.child(idx)?))
            })?;
            match step {
                Step::Descend(child) => block = child,
                Step::Hit(value) => return Ok(Some(value)),
                Step::Miss => return Ok(None),
            }
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    // -- mutation ------------------------------------------------------

    /// Inserts or replaces, returning the previous value if the key was
    /// already present.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.len() > self.max_key_len() {
            return Err(StoreError::Capacity(format!(
                "key of {} bytes exceeds the {}-byte limit",
                key.len(),
                self.max_key_len()
            ))
            .into());
        }
        let cell = leaf_cell(key, value);
        let capacity = self.file.block_size() - BLOCK_HEADER_SIZE;
        if cell.len() + SLOT_SIZE > capacity / 2 {
            return Err(StoreError::Capacity(format!(
                "entry of {} bytes exceeds the {}-byte cell limit",
                cell.len(),
                capacity / 2
            ))
            .into());
        }

        let root = self.ensure_root()?;
        let result = self.insert_at(root, key, &cell)?;
        let (added, old) = match result {
            Ins::Done { added, old } => (added, old),
            Ins::Split {
                left_count,
                left_max,
                right_block,
                right_count,
                right_max,
                added,
                old,
            } => {
                let new_root = self.file.allocate_block()?;
                self.file.with_block_mut(new_root, |data| {
                    let mut node = NodeMut::init(data, BlockKind::Interior)?;
                    ensure!(
                        node.insert_cell(0, &interior_cell(root, left_count, &left_max))?,
                        "root cell must fit an empty node"
                    );
                    ensure!(
                        node.insert_cell(1, &interior_cell(right_block, right_count, &right_max))?,
                        "root cell must fit an empty node"
                    );
                    Ok(())
                })?;
                self.file.set_root_block(new_root);
                (added, old)
            }
        };
        if added {
            self.file.adjust_entry_count(1);
        }
        Ok(old)
    }

    fn insert_at(&self, block: u32, key: &[u8], cell: &[u8]) -> Result<Ins> {
        let is_leaf = self
            .file
            .with_block(block, |data| Ok(Node::new(data)?.is_leaf()))?;
        if is_leaf {
            self.insert_leaf(block, key, cell)
        } else {
            self.insert_interior(block, key, cell)
        }
    }

    fn insert_leaf(&self, block: u32, key: &[u8], cell: &[u8]) -> Result<Ins> {
        enum Out {
            Done { added: bool, old: Option<Vec<u8>> },
            Overflow { cells: Vec<Vec<u8>>, next: u32, old: Option<Vec<u8>> },
        }

        let out = self.file.with_block_mut(block, |data| {
            let mut node = NodeMut::new(data)?;
            let (idx, old) = match node.node().search(key)? {
                Search::Found(i) => (i, Some(node.node().value(i)?.to_vec())),
                Search::Missing(i) => (i, None),
            };
            let fits = if old.is_some() {
                node.replace_cell(idx, cell)?
            } else {
                node.insert_cell(idx, cell)?
            };
            if fits {
                return Ok(Out::Done {
                    added: old.is_none(),
                    old,
                });
            }
            // The old cell, if any, is already gone; splice the new one in.
            let mut cells = node.node().cells()?;
            cells.insert(idx, cell.to_vec());
            Ok(Out::Overflow {
                cells,
                next: node.node().next_sibling(),
                old,
            })
        })?;

        let (cells, next, old) = match out {
            Out::Done { added, old } => return Ok(Ins::Done { added, old }),
            Out::Overflow { cells, next, old } => (cells, next, old),
        };

        let right_block = self.file.allocate_block()?;
        let split = split_point(&cells);
        let (left_cells, right_cells) = cells.split_at(split);

        self.file.with_block_mut(block, |data| {
            let mut node = NodeMut::new(data)?;
            let prev = node.node().prev_sibling();
            ensure!(
                node.write_all(BlockKind::Leaf, left_cells)?,
                "left half of a split must fit"
            );
            node.set_prev_sibling(prev)?;
            node.set_next_sibling(right_block)
        })?;
        self.file.with_block_mut(right_block, |data| {
            let mut node = NodeMut::init(data, BlockKind::Leaf)?;
            ensure!(
                node.write_all(BlockKind::Leaf, right_cells)?,
                "right half of a split must fit"
            );
            node.set_prev_sibling(block)?;
            node.set_next_sibling(next)
        })?;
        if next != 0 {
            self.file
                .with_block_mut(next, |data| NodeMut::new(data)?.set_prev_sibling(right_block))?;
        }

        Ok(Ins::Split {
            left_count: left_cells.len() as u64,
            left_max: last_key(BlockKind::Leaf, left_cells)?,
            right_block,
            right_count: right_cells.len() as u64,
            right_max: last_key(BlockKind::Leaf, right_cells)?,
            added: old.is_none(),
            old,
        })
    }

    fn insert_interior(&self, block: u32, key: &[u8], cell: &[u8]) -> Result<Ins> {
        let (idx, child) = self.file.with_block(block, |data| {
            let node = Node::new(data)?;
            let n = node.count();
            ensure!(n > 0, "interior node without children");
            let idx = node.search(key)?.index().min(n - 1);
            Ok((idx, node.child(idx)?))
        })?;

        match self.insert_at(child, key, cell)? {
            Ins::Done { added, old } => {
                if added {
                    self.file.with_block_mut(block, |data| {
                        let mut node = NodeMut::new(data)?;
                        let count = node.node().subtree_count(idx)?;
                        node.set_subtree_count(idx, count + 1)
                    })?;
                }
                Ok(Ins::Done { added, old })
            }
            Ins::Split {
                left_count,
                left_max,
                right_block,
                right_count,
                right_max,
                added,
                old,
            } => {
                let replacement = [
                    interior_cell(child, left_count, &left_max),
                    interior_cell(right_block, right_count, &right_max),
                ];
                match self.splice_interior(block, idx, &replacement)? {
                    None => Ok(Ins::Done { added, old }),
                    Some((left_count, left_max, right_block, right_count, right_max)) => {
                        Ok(Ins::Split {
                            left_count,
                            left_max,
                            right_block,
                            right_count,
                            right_max,
                            added,
                            old,
                        })
                    }
                }
            }
        }
    }

    /// Replaces the interior cell at `idx` with `new_cells`, splitting the
    /// node when they no longer fit. Returns the split description, if any.
    #[allow(clippy::type_complexity)]
    fn splice_interior(
        &self,
        block: u32,
        idx: usize,
        new_cells: &[Vec<u8>],
    ) -> Result<Option<(u64, Vec<u8>, u32, u64, Vec<u8>)>> {
        let cells = self.file.with_block_mut(block, |data| {
            let mut node = NodeMut::new(data)?;
            let mut cells = node.node().cells()?;
            cells.splice(idx..idx + 1, new_cells.iter().cloned());
            if node.write_all(BlockKind::Interior, &cells)? {
                return Ok(None);
            }
            Ok(Some(cells))
        })?;
        let Some(cells) = cells else {
            return Ok(None);
        };

        let right_block = self.file.allocate_block()?;
        let split = split_point(&cells);
        let (left_cells, right_cells) = cells.split_at(split);

        self.file.with_block_mut(block, |data| {
            let mut node = NodeMut::new(data)?;
            ensure!(
                node.write_all(BlockKind::Interior, left_cells)?,
                "left half of a split must fit"
            );
            Ok(())
        })?;
        self.file.with_block_mut(right_block, |data| {
            let mut node = NodeMut::init(data, BlockKind::Interior)?;
            ensure!(
                node.write_all(BlockKind::Interior, right_cells)?,
                "right half of a split must fit"
            );
            Ok(())
        })?;

        Ok(Some((
            subtree_sum(left_cells)?,
            last_key(BlockKind::Interior, left_cells)?,
            right_block,
            subtree_sum(right_cells)?,
            last_key(BlockKind::Interior, right_cells)?,
        )))
    }

    /// Removes a key, returning its value if it was present.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let root = self.file.root_block();
        if root == 0 {
            return Ok(None);
        }

        let removed = match self.remove_at(root, key)? {
            Del::Missing => return Ok(None),
            Del::Removed { old, now_empty } => {
                self.file.adjust_entry_count(-1);
                if now_empty {
                    let is_leaf = self
                        .file
                        .with_block(root, |data| Ok(Node::new(data)?.is_leaf()))?;
                    if !is_leaf {
                        // Every child is gone; the root becomes the empty leaf.
                        self.file.with_block_mut(root, |data| {
                            NodeMut::init(data, BlockKind::Leaf)?;
                            Ok(())
                        })?;
                    }
                } else {
                    self.collapse_root()?;
                }
                old
            }
        };
        Ok(Some(removed))
    }

    fn remove_at(&self, block: u32, key: &[u8]) -> Result<Del> {
        let is_leaf = self
            .file
            .with_block(block, |data| Ok(Node::new(data)?.is_leaf()))?;
        if is_leaf {
            self.remove_leaf(block, key)
        } else {
            self.remove_interior(block, key)
        }
    }

    fn remove_leaf(&self, block: u32, key: &[u8]) -> Result<Del> {
        self.file.with_block_mut(block, |data| {
            let mut node = NodeMut::new(data)?;
            match node.node().search(key)? {
                Search::Found(i) => {
                    let old = node.node().value(i)?.to_vec();
                    node.remove_cell(i)?;
                    Ok(Del::Removed {
                        old,
                        now_empty: node.node().count() == 0,
                    })
                }
                Search::Missing(_) => Ok(Del::Missing),
            }
        })
    }

    fn remove_interior(&self, block: u32, key: &[u8]) -> Result<Del> {
        let (idx, child, n) = self.file.with_block(block, |data| {
            let node = Node::new(data)?;
            let n = node.count();
            ensure!(n > 0, "interior node without children");
            let idx = node.search(key)?.index().min(n - 1);
            Ok((idx, node.child(idx)?, n))
        })?;

        match self.remove_at(child, key)? {
            Del::Missing => Ok(Del::Missing),
            Del::Removed { old, now_empty } => {
                if now_empty {
                    self.unlink_leaf_chain(child)?;
                    self.file.free_block(child)?;
                    self.file
                        .with_block_mut(block, |data| NodeMut::new(data)?.remove_cell(idx))?;
                    return Ok(Del::Removed {
                        old,
                        now_empty: n == 1,
                    });
                }
                self.file.with_block_mut(block, |data| {
                    let mut node = NodeMut::new(data)?;
                    let count = node.node().subtree_count(idx)?;
                    ensure!(count > 0, "subtree count underflow");
                    node.set_subtree_count(idx, count - 1)
                })?;
                self.maybe_merge(block, idx)?;
                Ok(Del::Removed {
                    old,
                    now_empty: false,
                })
            }
        }
    }

    /// Detaches an empty leaf from the sibling chain. Interior blocks are
    /// not chained, so this is a no-op for them.
    fn unlink_leaf_chain(&self, block: u32) -> Result<()> {
        let (is_leaf, prev, next) = self.file.with_block(block, |data| {
            let node = Node::new(data)?;
            Ok((node.is_leaf(), node.prev_sibling(), node.next_sibling()))
        })?;
        if !is_leaf {
            return Ok(());
        }
        if prev != 0 {
            self.file
                .with_block_mut(prev, |data| NodeMut::new(data)?.set_next_sibling(next))?;
        }
        if next != 0 {
            self.file
                .with_block_mut(next, |data| NodeMut::new(data)?.set_prev_sibling(prev))?;
        }
        Ok(())
    }

    /// Merges two adjacent leaf children of `parent` when one of them is
    /// underfull and both fit in a single node.
    fn maybe_merge(&self, parent: u32, idx: usize) -> Result<()> {
        let pair = self.file.with_block(parent, |data| {
            let node = Node::new(data)?;
            let n = node.count();
            let li = if idx + 1 < n {
                idx
            } else if idx > 0 {
                idx - 1
            } else {
                return Ok(None);
            };
            Ok(Some((li, node.child(li)?, node.child(li + 1)?)))
        })?;
        let Some((li, left, right)) = pair else {
            return Ok(());
        };

        let probe = |block: u32| {
            self.file.with_block(block, |data| {
                let node = Node::new(data)?;
                Ok((node.is_leaf(), node.used_bytes()?))
            })
        };
        let (left_leaf, left_used) = probe(left)?;
        let (right_leaf, right_used) = probe(right)?;
        if !left_leaf || !right_leaf {
            return Ok(());
        }

        let quarter = self.file.block_size() / 4;
        if left_used >= quarter && right_used >= quarter {
            return Ok(());
        }
        if left_used + right_used > self.file.block_size() - BLOCK_HEADER_SIZE {
            return Ok(());
        }

        let (right_cells, right_next) = self.file.with_block(right, |data| {
            let node = Node::new(data)?;
            Ok((node.cells()?, node.next_sibling()))
        })?;

        self.file.with_block_mut(left, |data| {
            let mut node = NodeMut::new(data)?;
            for cell in &right_cells {
                let at = node.node().count();
                ensure!(node.insert_cell(at, cell)?, "merged cells must fit");
            }
            node.set_next_sibling(right_next)
        })?;
        if right_next != 0 {
            self.file
                .with_block_mut(right_next, |data| NodeMut::new(data)?.set_prev_sibling(left))?;
        }
        self.file.free_block(right)?;

        self.file.with_block_mut(parent, |data| {
            let mut node = NodeMut::new(data)?;
            let fence = node.node().key(li + 1)?.to_vec();
            let total = node.node().subtree_count(li)? + node.node().subtree_count(li + 1)?;
            node.remove_cell(li + 1)?;
            ensure!(
                node.replace_cell(li, &interior_cell(left, total, &fence))?,
                "merge replacement must fit"
            );
            Ok(())
        })
    }

    /// While the root is an interior node with a single child, that child
    /// becomes the root.
    fn collapse_root(&self) -> Result<()> {
        loop {
            let root = self.file.root_block();
            if root == 0 {
                return Ok(());
            }
            let only_child = self.file.with_block(root, |data| {
                let node = Node::new(data)?;
                if !node.is_leaf() && node.count() == 1 {
                    Ok(Some(node.child(0)?))
                } else {
                    Ok(None)
                }
            })?;
            match only_child {
                Some(child) => {
                    self.file.set_root_block(child);
                    self.file.free_block(root)?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Drops every entry, leaving a single empty root leaf.
    pub fn clear(&self) -> Result<()> {
        self.file.reset()?;
        let block = self.file.allocate_block()?;
        self.file.with_block_mut(block, |data| {
            NodeMut::init(data, BlockKind::Leaf)?;
            Ok(())
        })?;
        self.file.set_root_block(block);
        Ok(())
    }

    // -- positioning ---------------------------------------------------

    pub fn first(&self) -> Result<Option<Position>> {
        enum Step {
            Descend(u32),
            Empty,
            Here,
        }

        let mut block = self.file.root_block();
        if block == 0 {
            return Ok(None);
        }
        loop {
            let step = self.file.with_block(block, |data| {
                let node = Node::new(data)?;
                if node.is_leaf() {
                    return Ok(if node.count() == 0 { Step::Empty } else { Step::Here });
                }
                ensure!(node.count() > 0, "interior node without children");
                Ok(Step::Descend(node.child(0)?))
            })?;
            match step {
                Step::Descend(child) => block = child,
                Step::Empty => return Ok(None),
                Step::Here => {
                    return Ok(Some(Position {
                        block,
                        slot: 0,
                        rank: 0,
                    }))
                }
            }
        }
    }

    pub fn last(&self) -> Result<Option<Position>> {
        let mut block = self.file.root_block();
        if block == 0 {
            return Ok(None);
        }
        let mut rank: u64 = 0;
        loop {
            enum Step {
                Descend(u32, u64),
                Leaf(usize),
            }
            let step = self.file.with_block(block, |data| {
                let node = Node::new(data)?;
                if node.is_leaf() {
                    return Ok(Step::Leaf(node.count()));
                }
                let n = node.count();
                ensure!(n > 0, "interior node without children");
                let mut before = 0u64;
                for i in 0..n - 1 {
                    before += node.subtree_count(i)?;
                }
                Ok(Step::Descend(node.child(n - 1)?, before))
            })?;
            match step {
                Step::Descend(child, before) => {
                    rank += before;
                    block = child;
                }
                Step::Leaf(0) => return Ok(None),
                Step::Leaf(count) => {
                    return Ok(Some(Position {
                        block,
                        slot: count - 1,
                        rank: rank + count as u64 - 1,
                    }))
                }
            }
        }
    }

    /// First entry with key >= `key`.
    pub fn seek_at_or_after(&self, key: &[u8]) -> Result<Option<Position>> {
        enum Step {
            Descend(u32, u64),
            At(usize),
            NextLeaf(u32, usize),
        }

        let mut block = self.file.root_block();
        if block == 0 {
            return Ok(None);
        }
        let mut rank: u64 = 0;
        loop {
            let step = self.file.with_block(block, |data| {
                let node = Node::new(data)?;
                if node.is_leaf() {
                    let count = node.count();
                    let i = node.search(key)?.index();
                    if i < count {
                        return Ok(Step::At(i));
                    }
                    return Ok(Step::NextLeaf(node.next_sibling(), count));
                }
                let n = node.count();
                ensure!(n > 0, "interior node without children");
                let idx = node.search(key)?.index().min(n - 1);
                let mut before = 0u64;
                for i in 0..idx {
                    before += node.subtree_count(i)?;
                }
                Ok(Step::Descend(node.child(idx)?, before))
            })?;
            match step {
                Step::Descend(child, before) => {
                    rank += before;
                    block = child;
                }
                Step::At(slot) => {
                    return Ok(Some(Position {
                        block,
                        slot,
                        rank: rank + slot as u64,
                    }))
                }
                Step::NextLeaf(0, _) => return Ok(None),
                Step::NextLeaf(next, count) => {
                    return Ok(Some(Position {
                        block: next,
                        slot: 0,
                        rank: rank + count as u64,
                    }))
                }
            }
        }
    }

    /// First entry with key strictly greater than `key`.
    pub fn seek_after(&self, key: &[u8]) -> Result<Option<Position>> {
        let mut successor = Vec::with_capacity(key.len() + 1);
        successor.extend_from_slice(key);
        successor.push(0);
        self.seek_at_or_after(&successor)
    }

    /// Last entry with key <= `key`.
    pub fn seek_at_or_before(&self, key: &[u8]) -> Result<Option<Position>> {
        self.seek_floor(key, true)
    }

    /// Last entry with key strictly less than `key`.
    pub fn seek_before(&self, key: &[u8]) -> Result<Option<Position>> {
        self.seek_floor(key, false)
    }

    fn seek_floor(&self, key: &[u8], allow_equal: bool) -> Result<Option<Position>> {
        enum Step {
            Descend(u32, u64),
            At(usize),
            StepBack,
        }

        let mut block = self.file.root_block();
        if block == 0 {
            return Ok(None);
        }
        let mut rank: u64 = 0;
        loop {
            let step = self.file.with_block(block, |data| {
                let node = Node::new(data)?;
                if node.is_leaf() {
                    let i = match node.search(key)? {
                        Search::Found(i) if allow_equal => return Ok(Step::At(i)),
                        Search::Found(i) => i,
                        Search::Missing(i) => i,
                    };
                    if i > 0 {
                        return Ok(Step::At(i - 1));
                    }
                    return Ok(Step::StepBack);
                }
                let n = node.count();
                ensure!(n > 0, "interior node without children");
                let idx = node.search(key)?.index().min(n - 1);
                let mut before = 0u64;
                for i in 0..idx {
                    before += node.subtree_count(i)?;
                }
                Ok(Step::Descend(node.child(idx)?, before))
            })?;
            match step {
                Step::Descend(child, before) => {
                    rank += before;
                    block = child;
                }
                Step::At(slot) => {
                    return Ok(Some(Position {
                        block,
                        slot,
                        rank: rank + slot as u64,
                    }))
                }
                Step::StepBack => {
                    // The floor is the last entry of the previous leaf.
                    if rank == 0 {
                        return Ok(None);
                    }
                    let prev = self
                        .file
                        .with_block(block, |data| Ok(Node::new(data)?.prev_sibling()))?;
                    ensure!(prev != 0, "rank {} but no previous leaf", rank);
                    let slot = self
                        .file
                        .with_block(prev, |data| Ok(Node::new(data)?.count()))?
                        - 1;
                    return Ok(Some(Position {
                        block: prev,
                        slot,
                        rank: rank - 1,
                    }));
                }
            }
        }
    }

    /// Entry with the given rank (0-based), if in range.
    pub fn seek_rank(&self, rank: u64) -> Result<Option<Position>> {
        if rank >= self.len() {
            return Ok(None);
        }
        let mut block = self.file.root_block();
        ensure!(block != 0, "non-zero entry count without a root");
        let mut remaining = rank;
        loop {
            enum Step {
                Descend(u32),
                Leaf(usize),
            }
            let step = self.file.with_block(block, |data| {
                let node = Node::new(data)?;
                if node.is_leaf() {
                    ensure!(
                        (remaining as usize) < node.count(),
                        "rank out of range in leaf"
                    );
                    return Ok(Step::Leaf(remaining as usize));
                }
                let n = node.count();
                for i in 0..n {
                    let count = node.subtree_count(i)?;
                    if remaining < count {
                        return Ok(Step::Descend(node.child(i)?));
                    }
                    remaining -= count;
                }
                eyre::bail!("rank exceeds subtree counts")
            })?;
            match step {
                Step::Descend(child) => block = child,
                Step::Leaf(slot) => {
                    return Ok(Some(Position {
                        block,
                        slot,
                        rank,
                    }))
                }
            }
        }
    }

    /// Rank of an exact key, or None when absent.
    pub fn rank_of(&self, key: &[u8]) -> Result<Option<u64>> {
        match self.seek_at_or_after(key)? {
            Some(pos) => {
                let (found, _) = self.entry_at(pos)?;
                Ok((found == key).then_some(pos.rank))
            }
            None => Ok(None),
        }
    }

    /// Copies out the entry at a position.
    pub fn entry_at(&self, pos: Position) -> Result<(Vec<u8>, Vec<u8>)> {
        self.file.with_block(pos.block, |data| {
            let node = Node::new(data)?;
            ensure!(node.is_leaf(), "position does not reference a leaf");
            Ok((node.key(pos.slot)?.to_vec(), node.value(pos.slot)?.to_vec()))
        })
    }
}

fn split_point(cells: &[Vec<u8>]) -> usize {
    let total: usize = cells.iter().map(|c| c.len() + SLOT_SIZE).sum();
    let mut acc = 0;
    for (i, cell) in cells.iter().enumerate() {
        acc += cell.len() + SLOT_SIZE;
        if acc * 2 >= total && i + 1 < cells.len() {
            return i + 1;
        }
    }
    cells.len() - 1
}

fn last_key(kind: BlockKind, cells: &[Vec<u8>]) -> Result<Vec<u8>> {
    let last = cells.last().ok_or_else(|| eyre::eyre!("empty cell run"))?;
    Ok(cell_key(kind, last)?.to_vec())
}

fn subtree_sum(cells: &[Vec<u8>]) -> Result<u64> {
    let mut sum = 0u64;
    for cell in cells {
        sum += interior_cell_count(cell)?;
    }
    Ok(sum)
}
