//! # Binary Record Encoder
//!
//! Every record becomes one frame:
//!
//! ```text
//! varint content_len | object id (16 bytes) | body
//! ```
//!
//! The length comes first so scans can skip a record without decoding it.
//! The body is a flags byte, the type name, the collection name, and the
//! field list as (label, tag, payload) triples closed by a zero label.
//! Labels are field codes from the collection's table, except for the
//! reserved collection, which always writes names verbatim so the table
//! can be decoded before it exists. Embedded objects are written inline
//! as a body with no frame; their id travels behind a presence flag.
//!
//! Scalars are fixed-width little-endian; strings, byte arrays and field
//! lists are varint-length-prefixed.

use eyre::{ensure, Result};

use crate::guid::ObjectId;
use crate::value::Value;

use super::fieldmap::{FieldTables, RESERVED_COLLECTION};
use super::generic::GenericObject;
use super::tags::Tag;
use super::varint::write_varint;

pub const FLAG_CODED_LABELS: u8 = 0b01;
pub const FLAG_EMBEDDED_ID: u8 = 0b10;

#[derive(Default)]
pub struct BinWriter {
    buf: Vec<u8>,
}

impl BinWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_varint(&mut self, value: u64) {
        write_varint(&mut self.buf, value);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_varint(value.len() as u64);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_guid(&mut self, id: &ObjectId) {
        self.buf.extend_from_slice(id.as_bytes());
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Tag byte followed by the payload.
    pub fn write_tagged(&mut self, value: &Value, tables: &FieldTables) -> Result<()> {
        self.write_u8(Tag::of(value) as u8);
        self.write_payload(value, tables)
    }

    pub fn write_payload(&mut self, value: &Value, tables: &FieldTables) -> Result<()> {
        match value {
            Value::Null => {}
            Value::Bool(v) => self.write_u8(*v as u8),
            Value::U8(v) => self.write_u8(*v),
            Value::U16(v) => self.write_raw(&v.to_le_bytes()),
            Value::U32(v) => self.write_raw(&v.to_le_bytes()),
            Value::U64(v) => self.write_raw(&v.to_le_bytes()),
            Value::I8(v) => self.write_raw(&v.to_le_bytes()),
            Value::I16(v) => self.write_raw(&v.to_le_bytes()),
            Value::I32(v) => self.write_raw(&v.to_le_bytes()),
            Value::I64(v) => self.write_raw(&v.to_le_bytes()),
            Value::F32(v) => self.write_raw(&v.to_le_bytes()),
            Value::F64(v) => self.write_raw(&v.to_le_bytes()),
            Value::Decimal { mantissa, scale } => {
                self.write_u8(*scale);
                self.write_raw(&mantissa.to_le_bytes());
            }
            Value::DateTime(dt) => self.write_raw(&dt.timestamp_micros().to_le_bytes()),
            Value::TimeSpan(us) => self.write_raw(&us.to_le_bytes()),
            Value::Char(c) => self.write_raw(&(*c as u32).to_le_bytes()),
            Value::Str(s) | Value::CiStr(s) => self.write_str(s),
            Value::Bytes(b) => {
                self.write_varint(b.len() as u64);
                self.write_raw(b);
            }
            Value::Guid(id) => self.write_guid(id),
            Value::Array(items) => self.write_array(items, tables)?,
            Value::Object(obj) => self.write_object(obj, tables, true)?,
        }
        Ok(())
    }

    /// Homogeneous arrays carry one element tag; anything mixed or
    /// containing nulls falls back to per-element tags, signalled by an
    /// element tag of `Null`.
    fn write_array(&mut self, items: &[Value], tables: &FieldTables) -> Result<()> {
        self.write_varint(items.len() as u64);

        let uniform = items
            .first()
            .map(|first| Tag::of(first))
            .filter(|&tag| tag != Tag::Null)
            .filter(|&tag| items.iter().all(|item| Tag::of(item) == tag));

        match uniform {
            Some(tag) => {
                self.write_u8(tag as u8);
                for item in items {
                    self.write_payload(item, tables)?;
                }
            }
            None => {
                self.write_u8(Tag::Null as u8);
                for item in items {
                    self.write_tagged(item, tables)?;
                }
            }
        }
        Ok(())
    }

    /// Object body. Top-level records leave the id to the frame;
    /// embedded objects carry theirs behind a flag when they have one.
    pub fn write_object(
        &mut self,
        obj: &GenericObject,
        tables: &FieldTables,
        embedded: bool,
    ) -> Result<()> {
        let coded = obj.collection != RESERVED_COLLECTION;
        let with_id = embedded && !obj.id.is_nil();

        let mut flags = 0u8;
        if coded {
            flags |= FLAG_CODED_LABELS;
        }
        if with_id {
            flags |= FLAG_EMBEDDED_ID;
        }
        self.write_u8(flags);
        if with_id {
            self.write_guid(&obj.id);
        }
        self.write_str(&obj.type_name);
        self.write_str(&obj.collection);

        for (name, value) in &obj.fields {
            if coded {
                let code = tables.code_for(&obj.collection, name);
                ensure!(code != 0, "field code 0 is the terminator");
                self.write_varint(code as u64);
            } else {
                self.write_str(name);
            }
            self.write_tagged(value, tables)?;
        }
        // Code 0 and the empty name both encode as a single zero byte.
        self.write_u8(0);
        Ok(())
    }
}

/// Encodes a record into its framed storage form.
pub fn encode_record(obj: &GenericObject, tables: &FieldTables) -> Result<Vec<u8>> {
    let mut body = BinWriter::new();
    body.write_object(obj, tables, false)?;
    let body = body.into_bytes();

    let mut out = Vec::with_capacity(body.len() + ObjectId::LEN + 5);
    write_varint(&mut out, (ObjectId::LEN + body.len()) as u64);
    out.extend_from_slice(obj.id.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}
