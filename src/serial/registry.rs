//! # Typed Record Registry
//!
//! The store itself only moves [`GenericObject`]s. Application types opt
//! in by implementing [`Persistent`], which lowers them to the generic
//! form before encoding and lifts them back after decoding. The registry
//! records which collection each type name lives in so a typed load can
//! be routed without the caller naming the collection.
//!
//! A record whose type name was never registered is not an error: it
//! simply stays a `GenericObject`.

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::guid::ObjectId;

use super::generic::GenericObject;

pub trait Persistent: Sized {
    fn type_name() -> &'static str;
    fn collection() -> &'static str;

    /// The stored identifier, `ObjectId::NIL` before the first persist.
    fn object_id(&self) -> ObjectId;
    fn set_object_id(&mut self, id: ObjectId);

    fn to_generic(&self) -> GenericObject;
    fn from_generic(obj: &GenericObject) -> Result<Self>;
}

#[derive(Default)]
pub struct CodecRegistry {
    collections: RwLock<HashMap<String, String>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Persistent>(&self) {
        self.collections
            .write()
            .insert(T::type_name().to_owned(), T::collection().to_owned());
    }

    pub fn collection_of(&self, type_name: &str) -> Option<String> {
        self.collections.read().get(type_name).cloned()
    }
}

/// Lowers a typed value, stamping type and collection names so a
/// hand-written `to_generic` cannot mislabel the record.
pub fn lower<T: Persistent>(value: &T) -> GenericObject {
    let mut obj = value.to_generic();
    obj.type_name = T::type_name().to_owned();
    obj.collection = T::collection().to_owned();
    obj.id = value.object_id();
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use eyre::eyre;

    #[derive(Debug, PartialEq)]
    struct Person {
        id: ObjectId,
        name: String,
        age: u8,
    }

    impl Persistent for Person {
        fn type_name() -> &'static str {
            "Person"
        }
        fn collection() -> &'static str {
            "people"
        }
        fn object_id(&self) -> ObjectId {
            self.id
        }
        fn set_object_id(&mut self, id: ObjectId) {
            self.id = id;
        }
        fn to_generic(&self) -> GenericObject {
            GenericObject::new(Self::collection(), Self::type_name())
                .with("name", Value::Str(self.name.clone()))
                .with("age", Value::U8(self.age))
        }
        fn from_generic(obj: &GenericObject) -> Result<Self> {
            let name = match obj.field("name") {
                Value::Str(s) => s,
                other => return Err(eyre!("name: unexpected value {other:?}")),
            };
            let age = match obj.field("age") {
                Value::U8(v) => v,
                other => return Err(eyre!("age: unexpected value {other:?}")),
            };
            Ok(Person {
                id: obj.id,
                name,
                age,
            })
        }
    }

    #[test]
    fn lower_stamps_names_and_id() {
        let person = Person {
            id: ObjectId::random(),
            name: "ada".into(),
            age: 36,
        };
        let obj = lower(&person);
        assert_eq!(obj.type_name, "Person");
        assert_eq!(obj.collection, "people");
        assert_eq!(obj.id, person.id);
        assert_eq!(Person::from_generic(&obj).unwrap(), person);
    }

    #[test]
    fn registry_routes_type_names() {
        let registry = CodecRegistry::new();
        registry.register::<Person>();
        assert_eq!(registry.collection_of("Person").as_deref(), Some("people"));
        assert_eq!(registry.collection_of("Ghost"), None);
    }
}
