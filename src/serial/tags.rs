//! Wire type tags. One byte per field value, fixed forever; decoding an
//! unknown tag means the record bytes are not ours and is fatal.

use eyre::Result;

use crate::error::StoreError;
use crate::value::Value;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Bool = 0,
    U8 = 1,
    I16 = 2,
    I32 = 3,
    I64 = 4,
    I8 = 5,
    U16 = 6,
    U32 = 7,
    U64 = 8,
    Decimal = 9,
    F64 = 10,
    F32 = 11,
    DateTime = 12,
    TimeSpan = 13,
    Char = 14,
    Str = 15,
    CiStr = 16,
    Bytes = 17,
    Guid = 18,
    Null = 19,
    Array = 20,
    Object = 21,
}

impl Tag {
    pub fn from_byte(byte: u8) -> Result<Self> {
        let tag = match byte {
            0 => Tag::Bool,
            1 => Tag::U8,
            2 => Tag::I16,
            3 => Tag::I32,
            4 => Tag::I64,
            5 => Tag::I8,
            6 => Tag::U16,
            7 => Tag::U32,
            8 => Tag::U64,
            9 => Tag::Decimal,
            10 => Tag::F64,
            11 => Tag::F32,
            12 => Tag::DateTime,
            13 => Tag::TimeSpan,
            14 => Tag::Char,
            15 => Tag::Str,
            16 => Tag::CiStr,
            17 => Tag::Bytes,
            18 => Tag::Guid,
            19 => Tag::Null,
            20 => Tag::Array,
            21 => Tag::Object,
            other => {
                return Err(
                    StoreError::Corrupt(format!("unknown type tag {:#04x}", other)).into(),
                )
            }
        };
        Ok(tag)
    }

    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Tag::Null,
            Value::Bool(_) => Tag::Bool,
            Value::U8(_) => Tag::U8,
            Value::U16(_) => Tag::U16,
            Value::U32(_) => Tag::U32,
            Value::U64(_) => Tag::U64,
            Value::I8(_) => Tag::I8,
            Value::I16(_) => Tag::I16,
            Value::I32(_) => Tag::I32,
            Value::I64(_) => Tag::I64,
            Value::F32(_) => Tag::F32,
            Value::F64(_) => Tag::F64,
            Value::Decimal { .. } => Tag::Decimal,
            Value::DateTime(_) => Tag::DateTime,
            Value::TimeSpan(_) => Tag::TimeSpan,
            Value::Char(_) => Tag::Char,
            Value::Str(_) => Tag::Str,
            Value::CiStr(_) => Tag::CiStr,
            Value::Bytes(_) => Tag::Bytes,
            Value::Guid(_) => Tag::Guid,
            Value::Array(_) => Tag::Array,
            Value::Object(_) => Tag::Object,
        }
    }
}
