//! # Secondary Index File
//!
//! One B+-tree per index, keyed by the order-preserving encoding of the
//! indexed fields with the object id as final tiebreak. Values are empty;
//! everything a scan needs is in the key.
//!
//! The field list (with `-` prefixes for descending fields) is persisted
//! in the reserved region of block 0. On open, a missing or differing
//! persisted list discards the tree and flags the index for
//! regeneration, so an index definition can change between runs without
//! a migration step.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use eyre::{ensure, Result};
use tracing::info;

use crate::btree::{Cursor, Tree};
use crate::guid::ObjectId;
use crate::serial::varint::{read_varint, write_varint};
use crate::serial::GenericObject;
use crate::storage::{BlockCache, BlockFile, FileKind, StructureReadGuard};
use crate::value::Value;

use super::key::{encode_entry, encode_field};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenerationPolicy {
    /// Rebuild only when the file is new or its field list changed.
    IfNeeded,
    /// Rebuild unconditionally on open.
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexField {
    pub name: String,
    pub descending: bool,
}

impl IndexField {
    fn parse(raw: &str) -> Self {
        match raw.strip_prefix('-') {
            Some(name) => Self {
                name: name.to_owned(),
                descending: true,
            },
            None => Self {
                name: raw.to_owned(),
                descending: false,
            },
        }
    }
}

pub struct IndexFile {
    file: BlockFile,
    raw: Vec<String>,
    fields: Vec<IndexField>,
    needs_regen: bool,
}

impl IndexFile {
    pub fn open(
        path: &Path,
        file_id: u32,
        cache: Arc<BlockCache>,
        field_names: &[String],
        policy: RegenerationPolicy,
        lock_wait: Duration,
    ) -> Result<Self> {
        ensure!(!field_names.is_empty(), "an index needs at least one field");
        let file = BlockFile::open(path, FileKind::Index, file_id, cache, 0, lock_wait)?;
        let raw: Vec<String> = field_names.to_vec();
        let fields: Vec<IndexField> = raw.iter().map(|f| IndexField::parse(f)).collect();

        let persisted = load_spec(&file)?;
        let mut needs_regen = policy == RegenerationPolicy::Always;
        match persisted {
            Some(existing) if existing == raw => {}
            Some(_) => {
                info!(file = file.file_name(), "index field list changed, discarding entries");
                Tree::new(&file).clear()?;
                store_spec(&file, &raw)?;
                needs_regen = true;
            }
            None => {
                store_spec(&file, &raw)?;
                needs_regen = true;
            }
        }

        Ok(Self {
            file,
            raw,
            fields,
            needs_regen,
        })
    }

    pub fn file(&self) -> &BlockFile {
        &self.file
    }

    pub fn tree(&self) -> Tree<'_> {
        Tree::new(&self.file)
    }

    pub fn fields(&self) -> &[IndexField] {
        &self.fields
    }

    pub fn field_names(&self) -> &[String] {
        &self.raw
    }

    /// True until the owner has rebuilt the entries from the primary file.
    pub fn needs_regeneration(&self) -> bool {
        self.needs_regen
    }

    pub fn mark_regenerated(&mut self) {
        self.needs_regen = false;
    }

    pub fn lock_shared(&self) -> Result<StructureReadGuard> {
        self.file.lock_shared()
    }

    /// Opens a cursor over the entries. A locked cursor holds the file's
    /// shared structural lock for its lifetime, so conflicting writers
    /// time out with `LockTimeout` instead of mutating under it.
    pub fn typed_cursor(&self, locked: bool) -> Result<IndexCursor<'_>> {
        let guard = if locked {
            Some(self.file.lock_shared()?)
        } else {
            None
        };
        Ok(IndexCursor {
            tree: Tree::new(&self.file),
            cursor: Cursor::before_first(),
            _guard: guard,
        })
    }

    /// Rank the record's entry currently holds, derived from its indexed
    /// field values, or `None` when the record has no entry.
    pub fn rank_of_id(&self, obj: &GenericObject) -> Result<Option<u64>> {
        self.tree().rank_of(&self.key_of(obj))
    }

    // -- entries -------------------------------------------------------

    /// The entry key this record gets, missing fields indexing as `Null`.
    pub fn key_of(&self, obj: &GenericObject) -> Vec<u8> {
        let values: Vec<Value> = self.fields.iter().map(|f| obj.field(&f.name)).collect();
        let parts: Vec<(&Value, bool)> = values
            .iter()
            .zip(&self.fields)
            .map(|(v, f)| (v, f.descending))
            .collect();
        encode_entry(&parts, &obj.id)
    }

    /// Encodes the leading fields of a key, for range bounds. `values`
    /// may be shorter than the field list.
    pub fn encode_prefix(&self, values: &[Value]) -> Vec<u8> {
        let mut out = Vec::new();
        for (value, field) in values.iter().zip(&self.fields) {
            encode_field(&mut out, value, field.descending);
        }
        out
    }

    pub fn add(&self, obj: &GenericObject) -> Result<()> {
        let _lock = self.file.lock_exclusive()?;
        self.tree().insert(&self.key_of(obj), &[])?;
        Ok(())
    }

    pub fn remove(&self, obj: &GenericObject) -> Result<()> {
        let _lock = self.file.lock_exclusive()?;
        self.tree().remove(&self.key_of(obj))?;
        Ok(())
    }

    /// Moves the entry when the update changed any indexed field.
    pub fn update(&self, old: &GenericObject, new: &GenericObject) -> Result<()> {
        let old_key = self.key_of(old);
        let new_key = self.key_of(new);
        if old_key != new_key {
            let _lock = self.file.lock_exclusive()?;
            let tree = self.tree();
            tree.remove(&old_key)?;
            tree.insert(&new_key, &[])?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let _lock = self.file.lock_exclusive()?;
        Tree::new(&self.file).clear()
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}

/// Rank-tracking cursor over one index's entries.
pub struct IndexCursor<'a> {
    tree: Tree<'a>,
    cursor: Cursor,
    _guard: Option<StructureReadGuard>,
}

impl IndexCursor<'_> {
    /// Back to before the first entry.
    pub fn reset(&mut self) {
        self.cursor = Cursor::before_first();
    }

    /// Rank of the entry most recently yielded.
    pub fn rank(&self) -> Option<u64> {
        self.cursor.rank()
    }

    pub fn next(&mut self) -> Result<Option<(Vec<u8>, ObjectId)>> {
        match self.cursor.next(&self.tree)? {
            Some((key, _)) => {
                let id = id_of_entry(&key)?;
                Ok(Some((key, id)))
            }
            None => Ok(None),
        }
    }

    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, ObjectId)>> {
        match self.cursor.prev(&self.tree)? {
            Some((key, _)) => {
                let id = id_of_entry(&key)?;
                Ok(Some((key, id)))
            }
            None => Ok(None),
        }
    }

    /// Positions on the entry holding `rank`; the next step yields it.
    /// False leaves the cursor after the last entry.
    pub fn seek_rank(&mut self, rank: u64) -> Result<bool> {
        match self.tree.seek_rank(rank)? {
            Some(pos) => {
                self.cursor = Cursor::starting_at(&self.tree, pos);
                Ok(true)
            }
            None => {
                self.cursor = Cursor::after_last();
                Ok(false)
            }
        }
    }

    /// Positions on the first entry at or above `key`.
    pub fn seek_first_ge(&mut self, key: &[u8]) -> Result<bool> {
        match self.tree.seek_at_or_after(key)? {
            Some(pos) => {
                self.cursor = Cursor::starting_at(&self.tree, pos);
                Ok(true)
            }
            None => {
                self.cursor = Cursor::after_last();
                Ok(false)
            }
        }
    }

    /// Positions on the last entry at or below `key`.
    pub fn seek_last_le(&mut self, key: &[u8]) -> Result<bool> {
        match self.tree.seek_at_or_before(key)? {
            Some(pos) => {
                self.cursor = Cursor::starting_at(&self.tree, pos);
                Ok(true)
            }
            None => {
                self.cursor = Cursor::before_first();
                Ok(false)
            }
        }
    }
}

/// Object id carried at the tail of every entry key.
pub fn id_of_entry(key: &[u8]) -> Result<ObjectId> {
    ensure!(key.len() >= ObjectId::LEN, "index entry key too short");
    ObjectId::from_slice(&key[key.len() - ObjectId::LEN..])
}

fn store_spec(file: &BlockFile, raw: &[String]) -> Result<()> {
    let mut buf = Vec::new();
    write_varint(&mut buf, raw.len() as u64);
    for field in raw {
        write_varint(&mut buf, field.len() as u64);
        buf.extend_from_slice(field.as_bytes());
    }
    file.write_reserved(&buf)
}

fn load_spec(file: &BlockFile) -> Result<Option<Vec<String>>> {
    let buf = file.read_reserved()?;
    let (count, mut pos) = read_varint(&buf)?;
    if count == 0 {
        return Ok(None);
    }
    let mut raw = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (len, n) = read_varint(&buf[pos..])?;
        pos += n;
        let end = pos + len as usize;
        ensure!(end <= buf.len(), "index field list overruns block 0");
        raw.push(String::from_utf8(buf[pos..end].to_vec())?);
        pos = end;
    }
    Ok(Some(raw))
}
