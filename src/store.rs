//! # Store
//!
//! The embedded database facade. A store is a directory of block files
//! sharing one cache:
//!
//! - `objects.db` and `objects.blob`, the primary file keyed by object id
//!   with its blob overflow.
//! - `fields.db`, the persisted field-name-to-code assignments, replayed
//!   on open. These records belong to the reserved collection and are
//!   encoded with verbatim names, so they decode before any table exists.
//! - one `.idx` file per registered index.
//!
//! Point operations keep every index in step with the primary file.
//! `find` compiles its filter against the registered indexes and streams
//! results through a [`FindCursor`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{ensure, Result};
use tracing::{debug, info, warn};

use crate::btree::{Cursor, Tree};
use crate::error::StoreError;
use crate::guid::ObjectId;
use crate::index::{IndexFile, RegenerationPolicy};
use crate::objects::{FileStatistics, ObjectFile};
use crate::query::{plan_find, Filter, FindCursor, QueryContext};
use crate::serial::{
    decode_record, encode_record, lower, CodecRegistry, FieldTables, GenericObject, Persistent,
    RESERVED_COLLECTION,
};
use crate::storage::{BlockCache, BlockFile, FileKind, DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_CAPACITY};
use crate::value::Value;

const OBJECTS_FILE_ID: u32 = 1;
const BLOBS_FILE_ID: u32 = 2;
const FIELDS_FILE_ID: u32 = 3;
const INDEX_FILE_ID_BASE: u32 = 4;

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Builder for [`Store::open`]. Block size and blob threshold take
/// effect when the files are created; reopening keeps the sizes already
/// on disk.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    path: PathBuf,
    block_size: usize,
    cache_capacity: usize,
    blob_threshold: Option<usize>,
    lock_wait: Duration,
}

impl StoreOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            blob_threshold: None,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn cache_capacity(mut self, blocks: usize) -> Self {
        self.cache_capacity = blocks;
        self
    }

    /// Records longer than this spill to the blob file. Defaults to an
    /// eighth of the block size.
    pub fn blob_threshold(mut self, bytes: usize) -> Self {
        self.blob_threshold = Some(bytes);
        self
    }

    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn open(self) -> Result<Store> {
        Store::open(self)
    }
}

pub struct Store {
    dir: PathBuf,
    cache: Arc<BlockCache>,
    objects: ObjectFile,
    fields: BlockFile,
    indexes: Vec<IndexFile>,
    index_names: Vec<String>,
    tables: FieldTables,
    registry: CodecRegistry,
    lock_wait: Duration,
}

impl Store {
    pub fn open(options: StoreOptions) -> Result<Store> {
        fs::create_dir_all(&options.path)?;
        let cache = Arc::new(BlockCache::new(options.cache_capacity, options.block_size)?);
        let blob_threshold = options
            .blob_threshold
            .unwrap_or(options.block_size / 8);

        let objects = ObjectFile::open(
            &options.path.join("objects.db"),
            &options.path.join("objects.blob"),
            (OBJECTS_FILE_ID, BLOBS_FILE_ID),
            Arc::clone(&cache),
            blob_threshold,
            options.lock_wait,
        )?;
        let fields = BlockFile::open(
            &options.path.join("fields.db"),
            FileKind::Data,
            FIELDS_FILE_ID,
            Arc::clone(&cache),
            0,
            options.lock_wait,
        )?;

        let tables = FieldTables::new();
        replay_field_codes(&fields, &tables)?;

        info!(
            path = %options.path.display(),
            records = objects.entry_count(),
            "store opened"
        );

        Ok(Store {
            dir: options.path,
            cache,
            objects,
            fields,
            indexes: Vec::new(),
            index_names: Vec::new(),
            tables,
            registry: CodecRegistry::new(),
            lock_wait: options.lock_wait,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    pub fn record_count(&self) -> u64 {
        self.objects.entry_count()
    }

    // -- point operations ----------------------------------------------

    /// Persists a new record, assigning a fresh id when the caller left
    /// it nil.
    pub fn save(&self, obj: &mut GenericObject) -> Result<()> {
        ensure!(
            obj.collection != RESERVED_COLLECTION,
            "collection name {RESERVED_COLLECTION:?} is reserved"
        );
        if obj.id.is_nil() {
            obj.id = ObjectId::random();
        }
        let bytes = encode_record(obj, &self.tables)?;
        self.objects.save_new(&obj.id, &bytes)?;
        for index in &self.indexes {
            index.add(obj)?;
        }
        self.persist_field_codes()
    }

    /// Rewrites an existing record and moves its index entries.
    pub fn update(&self, obj: &GenericObject) -> Result<()> {
        let old = self.load(&obj.id)?;
        let bytes = encode_record(obj, &self.tables)?;
        self.objects.update(&obj.id, &bytes)?;
        for index in &self.indexes {
            index.update(&old, obj)?;
        }
        self.persist_field_codes()
    }

    pub fn delete(&self, id: &ObjectId) -> Result<()> {
        let old = self.load(id)?;
        self.objects.delete(id)?;
        for index in &self.indexes {
            index.remove(&old)?;
        }
        Ok(())
    }

    pub fn load(&self, id: &ObjectId) -> Result<GenericObject> {
        let bytes = self.objects.load(id)?;
        decode_record(&bytes, &self.tables)
    }

    pub fn contains(&self, id: &ObjectId) -> Result<bool> {
        self.objects.contains(id)
    }

    /// Drops every record and every index entry. Field-code assignments
    /// survive; any record encoded under them stays decodable.
    pub fn clear(&self) -> Result<()> {
        self.objects.clear()?;
        for index in &self.indexes {
            index.clear()?;
        }
        Ok(())
    }

    // -- typed operations ----------------------------------------------

    pub fn insert<T: Persistent>(&self, value: &mut T) -> Result<ObjectId> {
        let mut obj = lower(value);
        self.save(&mut obj)?;
        value.set_object_id(obj.id);
        Ok(obj.id)
    }

    pub fn load_as<T: Persistent>(&self, id: &ObjectId) -> Result<T> {
        T::from_generic(&self.load(id)?)
    }

    // -- indexes -------------------------------------------------------

    /// Opens (or creates) the named index over `fields` and registers it
    /// with the store. A `-` prefix on a field name orders it descending.
    /// A fresh or out-of-date index is rebuilt from the primary file
    /// before this returns.
    pub fn index_file(
        &mut self,
        name: &str,
        fields: &[String],
        policy: RegenerationPolicy,
    ) -> Result<usize> {
        if let Some(pos) = self.index_names.iter().position(|n| n == name) {
            ensure!(
                self.indexes[pos].field_names() == fields,
                "index {name:?} is already registered over {:?}",
                self.indexes[pos].field_names()
            );
            return Ok(pos);
        }

        let file_id = INDEX_FILE_ID_BASE + self.indexes.len() as u32;
        let mut index = IndexFile::open(
            &self.dir.join(format!("{name}.idx")),
            file_id,
            Arc::clone(&self.cache),
            fields,
            policy,
            self.lock_wait,
        )?;
        if index.needs_regeneration() {
            self.regenerate(&index)?;
            index.mark_regenerated();
        }
        self.indexes.push(index);
        self.index_names.push(name.to_owned());
        Ok(self.indexes.len() - 1)
    }

    pub fn indexes(&self) -> &[IndexFile] {
        &self.indexes
    }

    fn regenerate(&self, index: &IndexFile) -> Result<()> {
        debug!(fields = ?index.field_names(), "rebuilding index");
        index.file().begin_bulk();
        let result = (|| -> Result<()> {
            let tree = self.objects.tree();
            let mut cursor = Cursor::before_first();
            let mut added = 0u64;
            while let Some((_, value)) = cursor.next(&tree)? {
                let bytes = self.objects.resolve(&value)?;
                let obj = decode_record(&bytes, &self.tables)?;
                index.add(&obj)?;
                added += 1;
            }
            debug!(entries = added, "index rebuilt");
            Ok(())
        })();
        index.file().end_bulk()?;
        result
    }

    // -- queries -------------------------------------------------------

    /// Runs a filtered, paged query and collects the page.
    pub fn find(
        &self,
        offset: u64,
        limit: Option<u64>,
        filter: Option<&Filter>,
        ascending: bool,
        sort_fields: &[String],
    ) -> Result<Vec<GenericObject>> {
        self.find_cursor(offset, limit, filter, ascending, sort_fields)?
            .collect_all()
    }

    /// As [`find`](Store::find), streaming instead of collecting. The
    /// cursor holds a shared lock on the index it scans, so writers block
    /// until it is dropped.
    pub fn find_cursor(
        &self,
        offset: u64,
        limit: Option<u64>,
        filter: Option<&Filter>,
        ascending: bool,
        sort_fields: &[String],
    ) -> Result<FindCursor<'_>> {
        let refs: Vec<&IndexFile> = self.indexes.iter().collect();
        let (plan, order) = plan_find(filter, sort_fields, ascending, &refs);
        let ctx = QueryContext {
            objects: &self.objects,
            indexes: &self.indexes,
            tables: &self.tables,
        };
        FindCursor::new(ctx, plan, order, offset, limit, ascending)
    }

    pub fn find_as<T: Persistent>(
        &self,
        offset: u64,
        limit: Option<u64>,
        filter: Option<&Filter>,
        ascending: bool,
        sort_fields: &[String],
    ) -> Result<Vec<T>> {
        self.find(offset, limit, filter, ascending, sort_fields)?
            .iter()
            .map(T::from_generic)
            .collect()
    }

    // -- maintenance ---------------------------------------------------

    pub fn compute_statistics(&self) -> FileStatistics {
        self.objects.compute_statistics()
    }

    /// Defers flushing until the matching [`end_bulk`](Store::end_bulk),
    /// for import-sized batches. Calls nest.
    pub fn start_bulk(&self) {
        self.objects.begin_bulk();
        self.fields.begin_bulk();
        for index in &self.indexes {
            index.file().begin_bulk();
        }
    }

    pub fn end_bulk(&self) -> Result<()> {
        self.objects.end_bulk()?;
        self.fields.end_bulk()?;
        for index in &self.indexes {
            index.file().end_bulk()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.objects.flush()?;
        self.fields.flush()?;
        for index in &self.indexes {
            index.flush()?;
        }
        Ok(())
    }

    // -- field-code persistence ----------------------------------------

    fn persist_field_codes(&self) -> Result<()> {
        let pending = self.tables.take_pending();
        if pending.is_empty() {
            return Ok(());
        }
        let _lock = self.fields.lock_exclusive()?;
        let tree = Tree::new(&self.fields);
        for (collection, field, code) in pending {
            let mut rec = GenericObject::new(RESERVED_COLLECTION, "FieldCode");
            rec.id = ObjectId::random();
            rec.set("Collection", Value::Str(collection))
                .set("Field", Value::Str(field))
                .set("Code", Value::U32(code));
            let bytes = encode_record(&rec, &self.tables)?;
            tree.insert(rec.id.as_bytes(), &bytes)?;
        }
        Ok(())
    }
}

fn replay_field_codes(fields: &BlockFile, tables: &FieldTables) -> Result<()> {
    let tree = Tree::new(fields);
    let mut cursor = Cursor::before_first();
    while let Some((_, value)) = cursor.next(&tree)? {
        let rec = decode_record(&value, tables)?;
        let (collection, field, code) = match (
            rec.field("Collection"),
            rec.field("Field"),
            rec.field("Code"),
        ) {
            (Value::Str(c), Value::Str(f), Value::U32(code)) => (c, f, code),
            _ => {
                return Err(
                    StoreError::Corrupt("malformed field-code record".to_owned()).into(),
                )
            }
        };
        tables.learn(&collection, &field, code);
    }
    Ok(())
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(path = %self.dir.display(), "flush on close failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;

    fn open(dir: &Path) -> Store {
        StoreOptions::new(dir)
            .block_size(1024)
            .lock_wait(Duration::from_millis(200))
            .open()
            .unwrap()
    }

    fn person(age: u8, name: &str) -> GenericObject {
        GenericObject::new("people", "Person")
            .with("age", Value::U8(age))
            .with("name", Value::Str(name.into()))
    }

    #[test]
    fn save_assigns_an_id_and_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        let mut obj = person(36, "ada");
        store.save(&mut obj).unwrap();
        assert!(!obj.id.is_nil());

        let loaded = store.load(&obj.id).unwrap();
        assert_eq!(loaded, obj);
        assert!(store.contains(&obj.id).unwrap());
    }

    #[test]
    fn field_codes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = open(dir.path());
            let mut obj = person(36, "ada");
            store.save(&mut obj).unwrap();
            obj.id
        };

        let store = open(dir.path());
        let loaded = store.load(&id).unwrap();
        assert_eq!(loaded.field("name"), Value::Str("ada".into()));
        assert_eq!(loaded.field("age"), Value::U8(36));
    }

    #[test]
    fn update_and_delete_keep_indexes_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path());
        store
            .index_file("by-age", &["age".into()], RegenerationPolicy::IfNeeded)
            .unwrap();

        let mut obj = person(36, "ada");
        store.save(&mut obj).unwrap();

        obj.set("age", Value::U8(40));
        store.update(&obj).unwrap();
        let hits = store
            .find(0, None, Some(&Filter::eq("age", Value::U8(40))), true, &[])
            .unwrap();
        assert_eq!(hits.len(), 1);
        let stale = store
            .find(0, None, Some(&Filter::eq("age", Value::U8(36))), true, &[])
            .unwrap();
        assert!(stale.is_empty());

        store.delete(&obj.id).unwrap();
        assert!(store
            .find(0, None, Some(&Filter::eq("age", Value::U8(40))), true, &[])
            .unwrap()
            .is_empty());
        let err = store.load(&obj.id).unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::NotFound { .. })));
    }

    #[test]
    fn late_index_registration_backfills_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path());
        for age in 0..20u8 {
            store.save(&mut person(age, "x")).unwrap();
        }

        store
            .index_file("by-age", &["age".into()], RegenerationPolicy::IfNeeded)
            .unwrap();
        let before = store.compute_statistics().full_scan_count;
        let hits = store
            .find(
                0,
                None,
                Some(&Filter::ge("age", Value::U8(15))),
                true,
                &[],
            )
            .unwrap();
        assert_eq!(hits.len(), 5);
        // Served by the fresh index.
        assert_eq!(store.compute_statistics().full_scan_count, before);
    }

    #[test]
    fn typed_records_roundtrip_through_the_registry() {
        #[derive(Debug, PartialEq)]
        struct Event {
            id: ObjectId,
            kind: String,
        }
        impl Persistent for Event {
            fn type_name() -> &'static str {
                "Event"
            }
            fn collection() -> &'static str {
                "events"
            }
            fn object_id(&self) -> ObjectId {
                self.id
            }
            fn set_object_id(&mut self, id: ObjectId) {
                self.id = id;
            }
            fn to_generic(&self) -> GenericObject {
                GenericObject::new(Self::collection(), Self::type_name())
                    .with("kind", Value::Str(self.kind.clone()))
            }
            fn from_generic(obj: &GenericObject) -> Result<Self> {
                match obj.field("kind") {
                    Value::Str(kind) => Ok(Event { id: obj.id, kind }),
                    other => Err(eyre::eyre!("kind: unexpected value {other:?}")),
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.registry().register::<Event>();

        let mut event = Event {
            id: ObjectId::NIL,
            kind: "login".into(),
        };
        let id = store.insert(&mut event).unwrap();
        assert_eq!(event.id, id);
        assert_eq!(store.load_as::<Event>(&id).unwrap(), event);
    }

    #[test]
    fn reserved_collection_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut obj = GenericObject::new(RESERVED_COLLECTION, "FieldCode");
        assert!(store.save(&mut obj).is_err());
    }

    #[test]
    fn clear_empties_records_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path());
        store
            .index_file("by-age", &["age".into()], RegenerationPolicy::IfNeeded)
            .unwrap();
        for age in 0..10u8 {
            store.save(&mut person(age, "x")).unwrap();
        }

        store.clear().unwrap();
        assert_eq!(store.record_count(), 0);
        assert!(store.find(0, None, None, true, &[]).unwrap().is_empty());
        assert_eq!(store.indexes()[0].tree().len(), 0);
    }

    #[test]
    fn bulk_import_defers_flush_but_stays_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store.start_bulk();
        let mut ids = Vec::new();
        for age in 0..50u8 {
            let mut obj = person(age, "bulk");
            store.save(&mut obj).unwrap();
            ids.push(obj.id);
        }
        // Reads see the batch before the flush lands.
        assert_eq!(store.record_count(), 50);
        store.end_bulk().unwrap();

        for id in &ids {
            assert!(store.contains(id).unwrap());
        }
    }
}
