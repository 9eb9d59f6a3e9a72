//! # Error Kinds
//!
//! All fallible operations in objdb return `eyre::Result`. Most failures are
//! plain reports, but the categories a caller is expected to branch on are
//! raised as `StoreError` values so they can be recovered with
//! `Report::downcast_ref::<StoreError>()`:
//!
//! - `NotFound`: point lookup/update/delete on a missing identifier.
//! - `LockTimeout`: a writer could not acquire a file lock within the
//!   configured wait bound (typically because a locked cursor is open).
//! - `Corrupt`: checksum mismatch, unrecognized type tag, or a structural
//!   invariant violation. Always fatal, never retried or repaired silently.
//! - `HeaderMismatch`: reopening a file whose header (magic, version, block
//!   size) does not match. Fatal.
//! - `InvalidFilter`: malformed client-supplied filter input (e.g. a regex
//!   pattern that fails to compile). Raised at compile time, before any
//!   storage access.
//! - `Capacity`: record exceeds blob chain limits, or an identifier
//!   collision (treated as fatal).

use crate::guid::ObjectId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {id}")]
    NotFound { id: ObjectId },

    #[error("lock wait timed out on {file}")]
    LockTimeout { file: String },

    #[error("corrupt storage: {0}")]
    Corrupt(String),

    #[error("file header mismatch: expected {expected}, found {found}")]
    HeaderMismatch { expected: String, found: String },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),
}

impl StoreError {
    /// True for error kinds a caller is expected to branch on and recover
    /// from. Corruption and format errors are never recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. } | StoreError::LockTimeout { .. }
        )
    }
}

/// Extracts the `StoreError` kind from an eyre report, if the failure
/// carries one.
pub fn store_error(report: &eyre::Report) -> Option<&StoreError> {
    report.downcast_ref::<StoreError>()
}
