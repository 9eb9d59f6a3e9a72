//! # Tree Cursors
//!
//! A cursor walks entries in key order without holding block pins between
//! steps. It remembers the last key it yielded and the file version it
//! observed; when the version moves (a writer ran between steps), the
//! saved leaf position may be stale, so the cursor re-seeks from the last
//! key instead of trusting it. Steps are O(1) in the common case and one
//! descent after a mutation.

use eyre::Result;

use super::tree::{Position, Tree};

enum State {
    BeforeFirst,
    /// Positioned, but the entry at `Position` has not been yielded yet.
    Pending(Position),
    On(Position),
    AfterLast,
}

pub struct Cursor {
    state: State,
    last_key: Option<Vec<u8>>,
    version: u64,
}

impl Cursor {
    pub fn before_first() -> Self {
        Self {
            state: State::BeforeFirst,
            last_key: None,
            version: 0,
        }
    }

    pub fn after_last() -> Self {
        Self {
            state: State::AfterLast,
            last_key: None,
            version: 0,
        }
    }

    /// A cursor that yields the entry at `pos` on its first step, in
    /// either direction.
    pub fn starting_at(tree: &Tree<'_>, pos: Position) -> Self {
        Self {
            state: State::Pending(pos),
            last_key: None,
            version: tree.file().version(),
        }
    }

    /// Rank of the entry most recently yielded.
    pub fn rank(&self) -> Option<u64> {
        match self.state {
            State::On(pos) => Some(pos.rank),
            _ => None,
        }
    }

    /// Advances to the next entry in ascending key order.
    pub fn next(&mut self, tree: &Tree<'_>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let pos = match &self.state {
            State::AfterLast => return Ok(None),
            State::BeforeFirst => tree.first()?,
            State::Pending(pos) => Some(*pos),
            State::On(pos) => {
                if self.version == tree.file().version() {
                    self.advance(tree, *pos)?
                } else {
                    let key = self.last_key.as_deref().unwrap_or_default();
                    tree.seek_after(key)?
                }
            }
        };
        self.land(tree, pos)
    }

    /// Steps to the previous entry in ascending key order.
    pub fn prev(&mut self, tree: &Tree<'_>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let pos = match &self.state {
            State::BeforeFirst => return Ok(None),
            State::AfterLast => tree.last()?,
            State::Pending(pos) => Some(*pos),
            State::On(pos) => {
                if self.version == tree.file().version() {
                    self.retreat(tree, *pos)?
                } else {
                    let key = self.last_key.as_deref().unwrap_or_default();
                    tree.seek_before(key)?
                }
            }
        };
        match self.land(tree, pos)? {
            Some(entry) => Ok(Some(entry)),
            None => {
                self.state = State::BeforeFirst;
                Ok(None)
            }
        }
    }

    fn land(
        &mut self,
        tree: &Tree<'_>,
        pos: Option<Position>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match pos {
            Some(pos) => {
                let (key, value) = tree.entry_at(pos)?;
                self.state = State::On(pos);
                self.last_key = Some(key.clone());
                self.version = tree.file().version();
                Ok(Some((key, value)))
            }
            None => {
                self.state = State::AfterLast;
                Ok(None)
            }
        }
    }

    fn advance(&self, tree: &Tree<'_>, pos: Position) -> Result<Option<Position>> {
        tree.file().with_block(pos.block, |data| {
            let node = super::node::Node::new(data)?;
            if pos.slot + 1 < node.count() {
                return Ok(Some(Position {
                    block: pos.block,
                    slot: pos.slot + 1,
                    rank: pos.rank + 1,
                }));
            }
            let next = node.next_sibling();
            if next == 0 {
                return Ok(None);
            }
            Ok(Some(Position {
                block: next,
                slot: 0,
                rank: pos.rank + 1,
            }))
        })
    }

    fn retreat(&self, tree: &Tree<'_>, pos: Position) -> Result<Option<Position>> {
        if pos.slot > 0 {
            return Ok(Some(Position {
                block: pos.block,
                slot: pos.slot - 1,
                rank: pos.rank - 1,
            }));
        }
        if pos.rank == 0 {
            return Ok(None);
        }
        let prev = tree
            .file()
            .with_block(pos.block, |data| Ok(super::node::Node::new(data)?.prev_sibling()))?;
        eyre::ensure!(prev != 0, "rank {} but no previous leaf", pos.rank);
        let slot = tree
            .file()
            .with_block(prev, |data| Ok(super::node::Node::new(data)?.count()))?
            - 1;
        Ok(Some(Position {
            block: prev,
            slot,
            rank: pos.rank - 1,
        }))
    }
}
