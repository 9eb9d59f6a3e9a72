//! # Generic Objects
//!
//! `GenericObject` is the schema-free form every record passes through:
//! typed records are lowered to it before encoding and lifted from it
//! after decoding, and records whose type name has no registered decoder
//! stay in this form instead of failing. Field order is preserved so an
//! untouched object re-encodes to the same bytes it came from.

use crate::guid::ObjectId;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenericObject {
    pub collection: String,
    pub type_name: String,
    pub id: ObjectId,
    pub fields: Vec<(String, Value)>,
}

impl GenericObject {
    pub fn new(collection: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            type_name: type_name.into(),
            id: ObjectId::NIL,
            fields: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Field lookup as the filter and index layers see it: a missing
    /// field is `Null`.
    pub fn field(&self, name: &str) -> Value {
        self.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Sets a field, replacing an existing one of the same name.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(field, _)| *field == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }
}
