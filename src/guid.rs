//! # Object Identifiers
//!
//! Every persisted record is keyed by a 128-bit identifier, assigned on first
//! persist and immutable afterward. Identifiers order by raw byte comparison
//! (not insertion order), which fixes the iteration order of unfiltered
//! scans over the primary file.
//!
//! New identifiers are random (UUID v4); the all-zero value `ObjectId::NIL`
//! is reserved as "no identifier assigned yet".

use std::fmt;

use eyre::{ensure, Result};
use uuid::Uuid;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 16]);

impl ObjectId {
    pub const NIL: ObjectId = ObjectId([0u8; 16]);
    pub const LEN: usize = 16;

    /// Generates a fresh random identifier. Never returns `NIL`.
    pub fn random() -> Self {
        ObjectId(*Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ObjectId(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() == Self::LEN,
            "object id must be {} bytes, got {}",
            Self::LEN,
            bytes.len()
        );
        let mut buf = [0u8; 16];
        buf.copy_from_slice(bytes);
        Ok(ObjectId(buf))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

/// The default is `NIL`: a fresh, not-yet-persisted record.
impl Default for ObjectId {
    fn default() -> Self {
        Self::NIL
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}
