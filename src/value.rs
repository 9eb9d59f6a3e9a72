//! # Runtime Value Representation
//!
//! `Value` is the schema-flexible runtime representation of a single field:
//! every scalar the binary codec supports, plus arrays and embedded objects.
//! It is the currency between the codec, the index key deriver, and the
//! filter evaluator.
//!
//! ## Comparison Semantics
//!
//! `Value::compare` defines a **total** order used both by index key
//! derivation and by filter predicates, so that an index range scan and an
//! independent predicate evaluation always agree. The order is:
//!
//! ```text
//! Null < Bool < numbers < DateTime < TimeSpan < text < Bytes < Guid < Array < Object
//! ```
//!
//! Within the numeric class, all integer widths, floats and decimals compare
//! as widened numbers (exact for same-width integers, via f64 across
//! variants). `Char` belongs to the text class and compares as a one-character
//! string. `CiStr` is a case-insensitive string: when either side of a text
//! comparison is case-insensitive, both sides are compared case-folded.
//!
//! Missing fields evaluate as `Null`, and `Null` sorts before everything,
//! so `field < x` matches records lacking the field. This is deliberate:
//! the same rule applies in the index order and in residual evaluation.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::guid::ObjectId;
use crate::serial::GenericObject;

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Fixed-point decimal: `mantissa / 10^scale`.
    Decimal { mantissa: i128, scale: u8 },
    DateTime(DateTime<Utc>),
    /// Duration in microseconds.
    TimeSpan(i64),
    Char(char),
    Str(String),
    /// Case-insensitive string: compares and indexes case-folded, but
    /// round-trips with original casing preserved.
    CiStr(String),
    Bytes(Vec<u8>),
    Guid(ObjectId),
    Array(Vec<Value>),
    Object(GenericObject),
}

/// Coarse ordering class; the leading discriminator of the total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeClass {
    Null = 0,
    Bool = 1,
    Number = 2,
    DateTime = 3,
    TimeSpan = 4,
    Text = 5,
    Bytes = 6,
    Guid = 7,
    Array = 8,
    Object = 9,
}

impl Value {
    pub fn type_class(&self) -> TypeClass {
        match self {
            Value::Null => TypeClass::Null,
            Value::Bool(_) => TypeClass::Bool,
            Value::U8(_)
            | Value::U16(_)
            | Value::U32(_)
            | Value::U64(_)
            | Value::I8(_)
            | Value::I16(_)
            | Value::I32(_)
            | Value::I64(_)
            | Value::F32(_)
            | Value::F64(_)
            | Value::Decimal { .. } => TypeClass::Number,
            Value::DateTime(_) => TypeClass::DateTime,
            Value::TimeSpan(_) => TypeClass::TimeSpan,
            Value::Char(_) | Value::Str(_) | Value::CiStr(_) => TypeClass::Text,
            Value::Bytes(_) => TypeClass::Bytes,
            Value::Guid(_) => TypeClass::Guid,
            Value::Array(_) => TypeClass::Array,
            Value::Object(_) => TypeClass::Object,
        }
    }

    /// Widens any numeric variant to f64. Exact for magnitudes below 2^53.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::U8(v) => Some(v as f64),
            Value::U16(v) => Some(v as f64),
            Value::U32(v) => Some(v as f64),
            Value::U64(v) => Some(v as f64),
            Value::I8(v) => Some(v as f64),
            Value::I16(v) => Some(v as f64),
            Value::I32(v) => Some(v as f64),
            Value::I64(v) => Some(v as f64),
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            Value::Decimal { mantissa, scale } => {
                Some(mantissa as f64 / 10f64.powi(scale as i32))
            }
            _ => None,
        }
    }

    /// Signed integer view, when the variant is an integer that fits i128.
    fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::U8(v) => Some(v as i128),
            Value::U16(v) => Some(v as i128),
            Value::U32(v) => Some(v as i128),
            Value::U64(v) => Some(v as i128),
            Value::I8(v) => Some(v as i128),
            Value::I16(v) => Some(v as i128),
            Value::I32(v) => Some(v as i128),
            Value::I64(v) => Some(v as i128),
            _ => None,
        }
    }

    fn text_repr(&self) -> Option<(String, bool)> {
        match self {
            Value::Char(c) => Some((c.to_string(), false)),
            Value::Str(s) => Some((s.clone(), false)),
            Value::CiStr(s) => Some((s.clone(), true)),
            _ => None,
        }
    }

    /// String rendering used by regex filters. Scalars render via their
    /// natural display form; arrays and objects do not match regexes.
    pub fn regex_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(v) => Some(v.to_string()),
            Value::Char(c) => Some(c.to_string()),
            Value::Str(s) | Value::CiStr(s) => Some(s.clone()),
            Value::Guid(id) => Some(id.to_string()),
            Value::DateTime(dt) => Some(dt.to_rfc3339()),
            Value::U8(_) | Value::U16(_) | Value::U32(_) | Value::U64(_) => {
                self.as_i128().map(|v| v.to_string())
            }
            Value::I8(_) | Value::I16(_) | Value::I32(_) | Value::I64(_) => {
                self.as_i128().map(|v| v.to_string())
            }
            Value::F32(v) => Some(v.to_string()),
            Value::F64(v) => Some(v.to_string()),
            _ => None,
        }
    }

    /// Total-order comparison across all value shapes. See the module doc
    /// for the class order and the numeric/text widening rules.
    pub fn compare(&self, other: &Value) -> Ordering {
        let class = self.type_class().cmp(&other.type_class());
        if class != Ordering::Equal {
            return class;
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::TimeSpan(a), Value::TimeSpan(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Guid(a), Value::Guid(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => (&a.collection, &a.type_name, a.id)
                .cmp(&(&b.collection, &b.type_name, b.id)),
            _ if self.type_class() == TypeClass::Number => {
                if let (Some(a), Some(b)) = (self.as_i128(), other.as_i128()) {
                    return a.cmp(&b);
                }
                let a = self.as_f64().unwrap_or(f64::NAN);
                let b = other.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            _ => {
                // Text class: Char/Str/CiStr.
                let (a, a_ci) = self.text_repr().unwrap_or_default();
                let (b, b_ci) = other.text_repr().unwrap_or_default();
                if a_ci || b_ci {
                    a.to_lowercase().cmp(&b.to_lowercase())
                } else {
                    a.cmp(&b)
                }
            }
        }
    }
}
