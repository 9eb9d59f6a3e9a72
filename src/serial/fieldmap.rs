//! # Field-Code Tables
//!
//! Field names repeat in every record of a collection, so the encoder
//! replaces them with small varint codes assigned per collection: first
//! name seen gets code 1, the next 2, and so on. Code 0 is the field-list
//! terminator and is never assigned. Codes grow monotonically and are
//! never reused, even for names that stop occurring, so any record ever
//! written stays decodable.
//!
//! Assignments are durable: the store persists each new one as an
//! ordinary record in the reserved collection and replays that collection
//! on open. Records of the reserved collection itself are always encoded
//! with verbatim names, otherwise decoding the table would need the
//! table.

use hashbrown::HashMap;
use parking_lot::RwLock;

/// Collection holding the persisted name-to-code assignments.
pub const RESERVED_COLLECTION: &str = "__field_codes";

#[derive(Default)]
struct FieldTable {
    by_name: HashMap<String, u32>,
    by_code: HashMap<u32, String>,
    next: u32,
}

impl FieldTable {
    fn assign(&mut self, name: &str) -> u32 {
        if let Some(&code) = self.by_name.get(name) {
            return code;
        }
        self.next += 1;
        let code = self.next;
        self.by_name.insert(name.to_owned(), code);
        self.by_code.insert(code, name.to_owned());
        code
    }

    fn learn(&mut self, name: &str, code: u32) {
        self.by_name.insert(name.to_owned(), code);
        self.by_code.insert(code, name.to_owned());
        self.next = self.next.max(code);
    }
}

/// All per-collection tables plus the queue of assignments not yet
/// persisted.
#[derive(Default)]
pub struct FieldTables {
    tables: RwLock<HashMap<String, FieldTable>>,
    pending: RwLock<Vec<(String, String, u32)>>,
}

impl FieldTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Code for a field name, assigning the next one on first sight. New
    /// assignments are queued for persistence.
    pub fn code_for(&self, collection: &str, name: &str) -> u32 {
        {
            let tables = self.tables.read();
            if let Some(code) = tables.get(collection).and_then(|t| t.by_name.get(name)) {
                return *code;
            }
        }
        let mut tables = self.tables.write();
        let table = tables.entry(collection.to_owned()).or_default();
        let known = table.by_name.contains_key(name);
        let code = table.assign(name);
        if !known {
            self.pending
                .write()
                .push((collection.to_owned(), name.to_owned(), code));
        }
        code
    }

    pub fn name_for(&self, collection: &str, code: u32) -> Option<String> {
        self.tables
            .read()
            .get(collection)
            .and_then(|t| t.by_code.get(&code))
            .cloned()
    }

    /// Replays a persisted assignment without queueing it again.
    pub fn learn(&self, collection: &str, name: &str, code: u32) {
        self.tables
            .write()
            .entry(collection.to_owned())
            .or_default()
            .learn(name, code);
    }

    /// Drains the assignments made since the last call, for persistence.
    pub fn take_pending(&self) -> Vec<(String, String, u32)> {
        std::mem::take(&mut *self.pending.write())
    }
}
