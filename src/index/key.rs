//! # Order-Preserving Key Encoding
//!
//! Index entries are plain B+-tree keys, so the whole ordering contract
//! lives here: for any two values, byte comparison of their encodings
//! must agree with [`Value::compare`]. Each field encoding starts with a
//! type-class byte matching the class order, followed by a class-specific
//! payload:
//!
//! - numbers widen to f64 and use the sign-flip trick (negative values
//!   have all bits inverted, positive ones only the sign bit), giving a
//!   big-endian image whose byte order is the numeric order
//! - timestamps and durations flip the sign bit of their i64 microseconds
//! - text and byte strings are escaped (`00 -> 00 FF`, `FF -> FF 00`) and
//!   closed with `00 00`, so no encoding is a strict prefix of another
//!   and the terminator survives byte complement intact
//! - arrays concatenate element encodings and close with a single `00`,
//!   below every class byte
//!
//! A descending field is the byte complement of its ascending encoding.
//! Field encodings are self-delimiting, so composite keys are simple
//! concatenation, with the object id appended as the final tiebreak.

use crate::guid::ObjectId;
use crate::value::Value;

// Class bytes. 0x00 stays free for the array terminator.
const CLASS_NULL: u8 = 0x01;
const CLASS_BOOL: u8 = 0x02;
const CLASS_NUMBER: u8 = 0x03;
const CLASS_DATETIME: u8 = 0x04;
const CLASS_TIMESPAN: u8 = 0x05;
const CLASS_TEXT: u8 = 0x06;
const CLASS_BYTES: u8 = 0x07;
const CLASS_GUID: u8 = 0x08;
const CLASS_ARRAY: u8 = 0x09;
const CLASS_OBJECT: u8 = 0x0A;

const ARRAY_END: u8 = 0x00;

fn push_f64(out: &mut Vec<u8>, value: f64) {
    let bits = value.to_bits();
    let ordered = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    out.extend_from_slice(&ordered.to_be_bytes());
}

fn push_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&(value as u64 ^ (1 << 63)).to_be_bytes());
}

fn push_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        match b {
            0x00 => out.extend_from_slice(&[0x00, 0xFF]),
            0xFF => out.extend_from_slice(&[0xFF, 0x00]),
            other => out.push(other),
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
}

fn push_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(CLASS_NULL),
        Value::Bool(v) => {
            out.push(CLASS_BOOL);
            out.push(*v as u8);
        }
        Value::DateTime(dt) => {
            out.push(CLASS_DATETIME);
            push_i64(out, dt.timestamp_micros());
        }
        Value::TimeSpan(us) => {
            out.push(CLASS_TIMESPAN);
            push_i64(out, *us);
        }
        Value::Char(c) => {
            out.push(CLASS_TEXT);
            push_escaped(out, c.to_string().as_bytes());
        }
        Value::Str(s) => {
            out.push(CLASS_TEXT);
            push_escaped(out, s.as_bytes());
        }
        Value::CiStr(s) => {
            // The index order is the case-folded order.
            out.push(CLASS_TEXT);
            push_escaped(out, s.to_lowercase().as_bytes());
        }
        Value::Bytes(b) => {
            out.push(CLASS_BYTES);
            push_escaped(out, b);
        }
        Value::Guid(id) => {
            out.push(CLASS_GUID);
            out.extend_from_slice(id.as_bytes());
        }
        Value::Array(items) => {
            out.push(CLASS_ARRAY);
            for item in items {
                push_value(out, item);
            }
            out.push(ARRAY_END);
        }
        Value::Object(obj) => {
            out.push(CLASS_OBJECT);
            push_escaped(out, obj.collection.as_bytes());
            push_escaped(out, obj.type_name.as_bytes());
            out.extend_from_slice(obj.id.as_bytes());
        }
        numeric => {
            out.push(CLASS_NUMBER);
            push_f64(out, numeric.as_f64().unwrap_or(f64::NAN));
        }
    }
}

/// Appends one field encoding, byte-complemented when descending.
pub fn encode_field(out: &mut Vec<u8>, value: &Value, descending: bool) {
    let start = out.len();
    push_value(out, value);
    if descending {
        for b in &mut out[start..] {
            *b = !*b;
        }
    }
}

/// Full entry key: every indexed field followed by the object id.
pub fn encode_entry(fields: &[(&Value, bool)], id: &ObjectId) -> Vec<u8> {
    let mut out = Vec::with_capacity(fields.len() * 12 + ObjectId::LEN);
    for (value, descending) in fields {
        encode_field(&mut out, value, *descending);
    }
    out.extend_from_slice(id.as_bytes());
    out
}

/// True when the key image of `value` is shared with no other value that
/// [`Value::compare`] distinguishes. Numbers collate through f64, so
/// integers at or past the 2^53 mantissa limit can land on the same
/// image as their exact neighbors; bounds on such values must be
/// re-checked against the record instead of trusted as byte bounds.
pub fn collates_exactly(value: &Value) -> bool {
    const MANTISSA_LIMIT: u64 = 1 << 53;
    match *value {
        Value::U64(v) => v < MANTISSA_LIMIT,
        Value::I64(v) => v.unsigned_abs() < MANTISSA_LIMIT,
        Value::Array(ref items) => items.iter().all(collates_exactly),
        _ => true,
    }
}

/// Smallest byte string strictly greater than every string starting with
/// `prefix`, or `None` when the prefix is all `0xFF`.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last != 0xFF {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::cmp::Ordering;

    fn enc(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        encode_field(&mut out, value, false);
        out
    }

    fn agree(a: &Value, b: &Value) {
        assert_eq!(
            enc(a).cmp(&enc(b)),
            a.compare(b),
            "encoding order disagrees for {a:?} vs {b:?}"
        );
    }

    #[test]
    fn encoding_order_matches_value_order() {
        let values = [
            Value::Null,
            Value::Bool(false),
            Value::Bool(true),
            Value::F64(f64::NEG_INFINITY),
            Value::I64(-1_000_000),
            Value::I32(-1),
            Value::U8(0),
            Value::F32(0.5),
            Value::I16(3),
            Value::Decimal {
                mantissa: 314,
                scale: 2,
            },
            Value::U64(1 << 40),
            Value::DateTime(Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 59).unwrap()),
            Value::DateTime(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            Value::TimeSpan(-5),
            Value::TimeSpan(7),
            Value::Str("".into()),
            Value::Str("a".into()),
            Value::Str("a\u{0}b".into()),
            Value::Str("ab".into()),
            Value::Char('b'),
            Value::Bytes(vec![]),
            Value::Bytes(vec![0x00]),
            Value::Bytes(vec![0x00, 0x01]),
            Value::Bytes(vec![0xFF]),
            Value::Guid(ObjectId::from_bytes([1; 16])),
            Value::Array(vec![Value::I32(1)]),
            Value::Array(vec![Value::I32(1), Value::I32(2)]),
            Value::Array(vec![Value::I32(2)]),
        ];
        for a in &values {
            for b in &values {
                agree(a, b);
            }
        }
    }

    #[test]
    fn case_insensitive_text_folds_in_the_key() {
        assert_eq!(enc(&Value::CiStr("HeLLo".into())), enc(&Value::Str("hello".into())));
    }

    #[test]
    fn descending_reverses_the_order() {
        let mut lo = Vec::new();
        let mut hi = Vec::new();
        encode_field(&mut lo, &Value::I32(1), true);
        encode_field(&mut hi, &Value::I32(2), true);
        assert_eq!(lo.cmp(&hi), Ordering::Greater);
    }

    #[test]
    fn no_field_encoding_is_a_prefix_of_another() {
        // A shared text prefix must not make one whole key a prefix of
        // the other once the terminator lands.
        let a = enc(&Value::Str("ab".into()));
        let b = enc(&Value::Str("abc".into()));
        assert!(!b.starts_with(&a));
        assert!(a < b);
    }

    #[test]
    fn entry_keys_break_ties_by_id() {
        let lo_id = ObjectId::from_bytes([1; 16]);
        let hi_id = ObjectId::from_bytes([2; 16]);
        let v = Value::Str("same".into());
        let a = encode_entry(&[(&v, false)], &hi_id);
        let b = encode_entry(&[(&v, false)], &lo_id);
        assert!(b < a);
        assert!(a.ends_with(hi_id.as_bytes()));
    }

    #[test]
    fn integers_past_the_mantissa_limit_share_a_key_image() {
        let limit: u64 = 1 << 53;
        // The two largest distinguishable-by-compare values below collate
        // to the same bytes, which is exactly what `collates_exactly`
        // reports.
        assert_eq!(enc(&Value::U64(limit)), enc(&Value::U64(limit + 1)));
        assert!(!collates_exactly(&Value::U64(limit)));
        assert!(!collates_exactly(&Value::I64(-(limit as i64))));
        assert!(collates_exactly(&Value::U64(limit - 1)));
        assert!(collates_exactly(&Value::I64(-(limit as i64) + 1)));
        assert!(collates_exactly(&Value::F64(9e18)));
        assert!(collates_exactly(&Value::Str("x".into())));
        assert!(!collates_exactly(&Value::Array(vec![Value::U64(limit)])));
    }

    #[test]
    fn prefix_successor_bounds_the_prefix() {
        assert_eq!(prefix_successor(&[1, 2, 3]), Some(vec![1, 2, 4]));
        assert_eq!(prefix_successor(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);

        let prefix = enc(&Value::Str("abc".into()));
        let next = prefix_successor(&prefix).unwrap();
        let within = enc(&Value::Str("abc".into()));
        assert!(within < next);
    }
}
