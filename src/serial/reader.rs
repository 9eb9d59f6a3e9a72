//! # Binary Record Decoder
//!
//! Mirror of the encoder. Every read is bounds-checked against the frame;
//! running off the end, an unknown tag, an unknown field code or invalid
//! UTF-8 all surface as [`StoreError::Corrupt`] rather than panicking,
//! since the bytes come from disk.

use chrono::DateTime;
use eyre::Result;

use crate::error::StoreError;
use crate::guid::ObjectId;
use crate::value::Value;

use super::fieldmap::FieldTables;
use super::generic::GenericObject;
use super::tags::Tag;
use super::varint::read_varint;
use super::writer::{FLAG_CODED_LABELS, FLAG_EMBEDDED_ID};

pub struct BinReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

fn corrupt(what: &str) -> eyre::Report {
    StoreError::Corrupt(what.to_owned()).into()
}

impl<'a> BinReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(corrupt("record truncated"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let (value, used) =
            read_varint(&self.buf[self.pos..]).map_err(|_| corrupt("bad varint in record"))?;
        self.pos += used;
        Ok(value)
    }

    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_varint()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("invalid utf-8 in string"))
    }

    pub fn read_guid(&mut self) -> Result<ObjectId> {
        ObjectId::from_slice(self.take(ObjectId::LEN)?)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_value(&mut self, tag: Tag, tables: &FieldTables) -> Result<Value> {
        let value = match tag {
            Tag::Null => Value::Null,
            Tag::Bool => Value::Bool(self.read_u8()? != 0),
            Tag::U8 => Value::U8(self.read_u8()?),
            Tag::U16 => Value::U16(u16::from_le_bytes(self.read_array()?)),
            Tag::U32 => Value::U32(u32::from_le_bytes(self.read_array()?)),
            Tag::U64 => Value::U64(u64::from_le_bytes(self.read_array()?)),
            Tag::I8 => Value::I8(i8::from_le_bytes(self.read_array()?)),
            Tag::I16 => Value::I16(i16::from_le_bytes(self.read_array()?)),
            Tag::I32 => Value::I32(i32::from_le_bytes(self.read_array()?)),
            Tag::I64 => Value::I64(i64::from_le_bytes(self.read_array()?)),
            Tag::F32 => Value::F32(f32::from_le_bytes(self.read_array()?)),
            Tag::F64 => Value::F64(f64::from_le_bytes(self.read_array()?)),
            Tag::Decimal => {
                let scale = self.read_u8()?;
                let mantissa = i128::from_le_bytes(self.read_array()?);
                Value::Decimal { mantissa, scale }
            }
            Tag::DateTime => {
                let us = i64::from_le_bytes(self.read_array()?);
                let dt = DateTime::from_timestamp_micros(us)
                    .ok_or_else(|| corrupt("timestamp out of range"))?;
                Value::DateTime(dt)
            }
            Tag::TimeSpan => Value::TimeSpan(i64::from_le_bytes(self.read_array()?)),
            Tag::Char => {
                let code = u32::from_le_bytes(self.read_array()?);
                Value::Char(char::from_u32(code).ok_or_else(|| corrupt("invalid char"))?)
            }
            Tag::Str => Value::Str(self.read_str()?),
            Tag::CiStr => Value::CiStr(self.read_str()?),
            Tag::Bytes => {
                let len = self.read_varint()? as usize;
                Value::Bytes(self.take(len)?.to_vec())
            }
            Tag::Guid => Value::Guid(self.read_guid()?),
            Tag::Array => self.read_value_array(tables)?,
            Tag::Object => Value::Object(self.read_object(tables)?),
        };
        Ok(value)
    }

    fn read_value_array(&mut self, tables: &FieldTables) -> Result<Value> {
        let count = self.read_varint()? as usize;
        // Every element costs at least one byte in either form.
        if count > self.remaining() {
            return Err(corrupt("array length exceeds record"));
        }
        let elem_tag = Tag::from_byte(self.read_u8()?)?;

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = match elem_tag {
                Tag::Null => Tag::from_byte(self.read_u8()?)?,
                uniform => uniform,
            };
            items.push(self.read_value(tag, tables)?);
        }
        Ok(Value::Array(items))
    }

    /// Object body: flags, optional embedded id, names, then the field
    /// list up to the zero label.
    pub fn read_object(&mut self, tables: &FieldTables) -> Result<GenericObject> {
        let flags = self.read_u8()?;
        let coded = flags & FLAG_CODED_LABELS != 0;
        let id = if flags & FLAG_EMBEDDED_ID != 0 {
            self.read_guid()?
        } else {
            ObjectId::NIL
        };
        let type_name = self.read_str()?;
        let collection = self.read_str()?;

        let mut obj = GenericObject::new(collection, type_name);
        obj.id = id;

        loop {
            let name = if coded {
                let code = self.read_varint()?;
                if code == 0 {
                    break;
                }
                let code = u32::try_from(code).map_err(|_| corrupt("field code overflow"))?;
                tables
                    .name_for(&obj.collection, code)
                    .ok_or_else(|| corrupt("unknown field code"))?
            } else {
                let name = self.read_str()?;
                if name.is_empty() {
                    break;
                }
                name
            };
            let tag = Tag::from_byte(self.read_u8()?)?;
            let value = self.read_value(tag, tables)?;
            obj.fields.push((name, value));
        }
        Ok(obj)
    }
}

/// Decodes one framed record. The frame length must match the body
/// exactly; slack either way means the bytes are not a record.
pub fn decode_record(bytes: &[u8], tables: &FieldTables) -> Result<GenericObject> {
    let mut reader = BinReader::new(bytes);
    let content_len = reader.read_varint()? as usize;
    if content_len < ObjectId::LEN || content_len > reader.remaining() {
        return Err(corrupt("bad record frame length"));
    }
    let end = reader.pos + content_len;
    let id = reader.read_guid()?;
    let mut obj = reader.read_object(tables)?;
    if reader.pos != end {
        return Err(corrupt("record frame length mismatch"));
    }
    obj.id = id;
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::fieldmap::RESERVED_COLLECTION;
    use crate::serial::writer::encode_record;
    use chrono::{TimeZone, Utc};

    fn sample() -> GenericObject {
        let mut obj = GenericObject::new("people", "Person");
        obj.id = ObjectId::random();
        obj.set("name", Value::Str("Ada Lovelace".into()))
            .set("nick", Value::CiStr("ADA".into()))
            .set("age", Value::U8(36))
            .set("height", Value::F64(1.65))
            .set(
                "balance",
                Value::Decimal {
                    mantissa: -123456789,
                    scale: 4,
                },
            )
            .set(
                "born",
                Value::DateTime(Utc.with_ymd_and_hms(1815, 12, 10, 9, 30, 0).unwrap()),
            )
            .set("tenure", Value::TimeSpan(-42_000_000))
            .set("initial", Value::Char('λ'))
            .set("photo", Value::Bytes(vec![0, 1, 2, 0xFF]))
            .set("ref", Value::Guid(ObjectId::random()))
            .set("gone", Value::Null)
            .set(
                "scores",
                Value::Array(vec![Value::I32(1), Value::I32(-2), Value::I32(3)]),
            )
            .set(
                "mixed",
                Value::Array(vec![Value::Str("x".into()), Value::Null, Value::U8(9)]),
            );
        obj
    }

    #[test]
    fn record_roundtrips_every_value_shape() {
        let tables = FieldTables::new();
        let obj = sample();
        let bytes = encode_record(&obj, &tables).unwrap();
        let back = decode_record(&bytes, &tables).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn embedded_object_keeps_its_id() {
        let tables = FieldTables::new();
        let mut inner = GenericObject::new("pets", "Pet");
        inner.id = ObjectId::random();
        inner.set("name", Value::Str("rex".into()));

        let mut obj = GenericObject::new("people", "Person");
        obj.id = ObjectId::random();
        obj.set("pet", Value::Object(inner.clone()));

        let bytes = encode_record(&obj, &tables).unwrap();
        let back = decode_record(&bytes, &tables).unwrap();
        assert_eq!(back.field("pet"), Value::Object(inner));
    }

    #[test]
    fn reserved_collection_writes_names_verbatim() {
        let tables = FieldTables::new();
        let mut obj = GenericObject::new(RESERVED_COLLECTION, "FieldCode");
        obj.id = ObjectId::random();
        obj.set("Collection", Value::Str("people".into()));

        let bytes = encode_record(&obj, &tables).unwrap();
        // No code was assigned for the label.
        assert!(tables.take_pending().is_empty());
        // The label appears as raw text in the encoding.
        let needle = b"Collection";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));

        let back = decode_record(&bytes, &tables).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn coded_labels_need_the_table() {
        let tables = FieldTables::new();
        let obj = sample();
        let bytes = encode_record(&obj, &tables).unwrap();

        // A reader without the assignments cannot resolve the codes.
        let blank = FieldTables::new();
        let err = decode_record(&bytes, &blank).unwrap_err();
        assert!(matches!(
            crate::error::store_error(&err),
            Some(StoreError::Corrupt(_))
        ));

        // Replaying them makes the record decodable again.
        for (collection, name, code) in tables.take_pending() {
            blank.learn(&collection, &name, code);
        }
        assert_eq!(decode_record(&bytes, &blank).unwrap(), obj);
    }

    #[test]
    fn truncated_and_oversized_frames_are_corrupt() {
        let tables = FieldTables::new();
        let bytes = encode_record(&sample(), &tables).unwrap();

        for cut in [0, 1, 10, bytes.len() - 1] {
            let err = decode_record(&bytes[..cut], &tables).unwrap_err();
            assert!(
                matches!(
                    crate::error::store_error(&err),
                    Some(StoreError::Corrupt(_))
                ),
                "cut at {cut}"
            );
        }

        let mut padded = bytes.clone();
        padded[0] += 1; // frame claims one byte more than the body has
        padded.push(0);
        assert!(decode_record(&padded, &tables).is_err());
    }

    #[test]
    fn unknown_tag_in_body_is_corrupt() {
        let tables = FieldTables::new();
        let mut obj = GenericObject::new("people", "Person");
        obj.id = ObjectId::random();
        obj.set("age", Value::U8(1));
        let mut bytes = encode_record(&obj, &tables).unwrap();

        // The tag byte of the only field sits right before its payload.
        let len = bytes.len();
        bytes[len - 3] = 0x63;
        let err = decode_record(&bytes, &tables).unwrap_err();
        assert!(matches!(
            crate::error::store_error(&err),
            Some(StoreError::Corrupt(_))
        ));
    }
}
