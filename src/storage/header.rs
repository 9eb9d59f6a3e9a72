//! # File Header
//!
//! Block 0 of every file starts with a 64-byte header carrying the magic
//! bytes of the file kind, the format version, and the creation-time
//! geometry (block size, blob-inline threshold). The remainder of block 0
//! is auxiliary space owned by the file's user (index files keep their
//! field-spec descriptor there).
//!
//! Reopening a file whose magic, version, or block size does not match is a
//! fatal `StoreError::HeaderMismatch`; there is no format negotiation.
//!
//! ## Layout (64 bytes)
//!
//! ```text
//! Offset  Size  Field
//! 0       8     magic            per file kind
//! 8       2     version
//! 10      2     flags
//! 12      4     block_size
//! 16      4     root_block
//! 20      4     block_count      total blocks, including block 0
//! 24      4     freelist_head    first trunk block (0 = none)
//! 28      4     freelist_count   free blocks across all trunks
//! 32      8     entry_count      entries in the file's tree
//! 40      4     blob_threshold   inline payload limit (data files)
//! 44      20    reserved
//! ```

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::StoreError;
use super::FILE_HEADER_SIZE;

pub const DATA_MAGIC: &[u8; 8] = b"objdb-da";
pub const INDEX_MAGIC: &[u8; 8] = b"objdb-ix";
pub const BLOB_MAGIC: &[u8; 8] = b"objdb-bl";

pub const FORMAT_VERSION: u16 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 8],
    version: U16,
    flags: U16,
    block_size: U32,
    root_block: U32,
    block_count: U32,
    freelist_head: U32,
    freelist_count: U32,
    entry_count: U64,
    blob_threshold: U32,
    reserved: [u8; 20],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(magic: &[u8; 8], block_size: usize, blob_threshold: usize) -> Self {
        Self {
            magic: *magic,
            version: U16::new(FORMAT_VERSION),
            flags: U16::new(0),
            block_size: U32::new(block_size as u32),
            root_block: U32::new(0),
            block_count: U32::new(1),
            freelist_head: U32::new(0),
            freelist_count: U32::new(0),
            entry_count: U64::new(0),
            blob_threshold: U32::new(blob_threshold as u32),
            reserved: [0u8; 20],
        }
    }

    /// Parses and verifies a header against the expected magic and the
    /// block size the store was opened with.
    pub fn from_bytes(bytes: &[u8], magic: &[u8; 8], block_size: usize) -> Result<Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::read_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))?;

        if &header.magic != magic {
            return Err(StoreError::HeaderMismatch {
                expected: String::from_utf8_lossy(magic).into_owned(),
                found: String::from_utf8_lossy(&header.magic).into_owned(),
            }
            .into());
        }
        if header.version.get() != FORMAT_VERSION {
            return Err(StoreError::HeaderMismatch {
                expected: format!("version {FORMAT_VERSION}"),
                found: format!("version {}", header.version.get()),
            }
            .into());
        }
        if header.block_size.get() as usize != block_size {
            return Err(StoreError::HeaderMismatch {
                expected: format!("block size {block_size}"),
                found: format!("block size {}", header.block_size.get()),
            }
            .into());
        }

        Ok(header)
    }

    pub fn block_size(&self) -> usize {
        self.block_size.get() as usize
    }

    pub fn root_block(&self) -> u32 {
        self.root_block.get()
    }

    pub fn set_root_block(&mut self, block_no: u32) {
        self.root_block = U32::new(block_no);
    }

    pub fn block_count(&self) -> u32 {
        self.block_count.get()
    }

    pub fn set_block_count(&mut self, count: u32) {
        self.block_count = U32::new(count);
    }

    pub fn freelist_head(&self) -> u32 {
        self.freelist_head.get()
    }

    pub fn set_freelist_head(&mut self, block_no: u32) {
        self.freelist_head = U32::new(block_no);
    }

    pub fn freelist_count(&self) -> u32 {
        self.freelist_count.get()
    }

    pub fn set_freelist_count(&mut self, count: u32) {
        self.freelist_count = U32::new(count);
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count.get()
    }

    pub fn set_entry_count(&mut self, count: u64) {
        self.entry_count = U64::new(count);
    }

    pub fn blob_threshold(&self) -> usize {
        self.blob_threshold.get() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;
    use zerocopy::IntoBytes;

    #[test]
    fn header_is_64_bytes() {
        assert_eq!(std::mem::size_of::<FileHeader>(), FILE_HEADER_SIZE);
    }

    #[test]
    fn roundtrip_through_bytes() {
        let mut header = FileHeader::new(DATA_MAGIC, 4096, 512);
        header.set_root_block(7);
        header.set_block_count(42);
        header.set_entry_count(1000);

        let bytes = header.as_bytes().to_vec();
        let parsed = FileHeader::from_bytes(&bytes, DATA_MAGIC, 4096).unwrap();

        assert_eq!(parsed.root_block(), 7);
        assert_eq!(parsed.block_count(), 42);
        assert_eq!(parsed.entry_count(), 1000);
        assert_eq!(parsed.blob_threshold(), 512);
    }

    #[test]
    fn wrong_magic_is_header_mismatch() {
        let header = FileHeader::new(DATA_MAGIC, 4096, 512);
        let bytes = header.as_bytes().to_vec();

        let err = FileHeader::from_bytes(&bytes, INDEX_MAGIC, 4096).unwrap_err();
        assert!(matches!(
            store_error(&err),
            Some(crate::error::StoreError::HeaderMismatch { .. })
        ));
    }

    #[test]
    fn mismatched_block_size_is_fatal() {
        let header = FileHeader::new(DATA_MAGIC, 4096, 512);
        let bytes = header.as_bytes().to_vec();

        let err = FileHeader::from_bytes(&bytes, DATA_MAGIC, 8192).unwrap_err();
        assert!(err.to_string().contains("block size"));
    }
}
