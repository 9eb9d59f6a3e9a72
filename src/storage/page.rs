//! # Block Types and Header Layout
//!
//! Every block begins with a 24-byte header describing its contents. The
//! header is read and written in place through `zerocopy`, so no copies are
//! made when inspecting cached block buffers.
//!
//! ## Block Header Layout (24 bytes)
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  ------------  ------------------------------------------
//! 0       1     kind          Block kind (Leaf, Interior, Blob, FreeTrunk)
//! 1       1     flags         Reserved flag bits
//! 2       2     entry_count   Cells in a tree node / payload bytes in a blob
//! 4       2     free_start    End of the slot array (grows upward)
//! 6       2     free_end      Start of cell content (grows downward)
//! 8       4     prev_sibling  Leaf chain: previous leaf (0 = none)
//! 12      4     next_sibling  Leaf chain: next leaf / blob & trunk chain
//! 16      2     frag_bytes    Dead bytes inside the cell area
//! 18      2     reserved
//! 20      4     checksum      CRC-32 (ISCSI) of the block minus this field
//! ```
//!
//! ## Cell Layout
//!
//! Tree nodes use a slot array for ordered access without moving content:
//!
//! ```text
//! +--------------------+
//! | Header (24 bytes)  |
//! +--------------------+
//! | Slot Pointers      |  <- 2 bytes each, grows downward in address
//! +--------------------+
//! | Free Space         |
//! +--------------------+
//! | Cell Content       |  <- grows upward from block end
//! +--------------------+
//! ```
//!
//! `free_start` is the first byte past the slot array, `free_end` the lowest
//! cell offset. Deleting a cell removes only its slot and adds the cell's
//! size to `frag_bytes`; the content area is compacted lazily when an insert
//! needs the fragmented space.
//!
//! ## Checksum
//!
//! The checksum is stamped by the disk layer on write-back and verified on
//! every read. An all-zero block (freshly allocated, never written) is
//! considered valid.

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const BLOCK_HEADER_SIZE: usize = 24;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const CHECKSUM_OFFSET: usize = 20;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Unknown = 0x00,
    Interior = 0x01,
    Leaf = 0x02,
    Blob = 0x20,
    FreeTrunk = 0x30,
}

impl BlockKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => BlockKind::Interior,
            0x02 => BlockKind::Leaf,
            0x20 => BlockKind::Blob,
            0x30 => BlockKind::FreeTrunk,
            _ => BlockKind::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BlockHeader {
    kind: u8,
    flags: u8,
    entry_count: U16,
    free_start: U16,
    free_end: U16,
    prev_sibling: U32,
    next_sibling: U32,
    frag_bytes: U16,
    reserved: [u8; 2],
    checksum: U32,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

impl BlockHeader {
    pub fn new(kind: BlockKind, block_size: usize) -> Self {
        Self {
            kind: kind as u8,
            flags: 0,
            entry_count: U16::new(0),
            free_start: U16::new(BLOCK_HEADER_SIZE as u16),
            free_end: U16::new(block_size as u16),
            prev_sibling: U32::new(0),
            next_sibling: U32::new(0),
            frag_bytes: U16::new(0),
            reserved: [0; 2],
            checksum: U32::new(0),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= BLOCK_HEADER_SIZE,
            "buffer too small for BlockHeader: {} < {}",
            data.len(),
            BLOCK_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..BLOCK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read BlockHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= BLOCK_HEADER_SIZE,
            "buffer too small for BlockHeader: {} < {}",
            data.len(),
            BLOCK_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..BLOCK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read BlockHeader: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= BLOCK_HEADER_SIZE,
            "buffer too small for BlockHeader: {} < {}",
            data.len(),
            BLOCK_HEADER_SIZE
        );
        data[..BLOCK_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn kind(&self) -> BlockKind {
        BlockKind::from_byte(self.kind)
    }

    pub fn set_kind(&mut self, kind: BlockKind) {
        self.kind = kind as u8;
    }

    pub fn entry_count(&self) -> u16 {
        self.entry_count.get()
    }

    pub fn set_entry_count(&mut self, count: u16) {
        self.entry_count = U16::new(count);
    }

    pub fn free_start(&self) -> u16 {
        self.free_start.get()
    }

    pub fn set_free_start(&mut self, offset: u16) {
        self.free_start = U16::new(offset);
    }

    pub fn free_end(&self) -> u16 {
        self.free_end.get()
    }

    pub fn set_free_end(&mut self, offset: u16) {
        self.free_end = U16::new(offset);
    }

    pub fn free_space(&self) -> u16 {
        self.free_end.get().saturating_sub(self.free_start.get())
    }

    pub fn prev_sibling(&self) -> u32 {
        self.prev_sibling.get()
    }

    pub fn set_prev_sibling(&mut self, block_no: u32) {
        self.prev_sibling = U32::new(block_no);
    }

    pub fn next_sibling(&self) -> u32 {
        self.next_sibling.get()
    }

    pub fn set_next_sibling(&mut self, block_no: u32) {
        self.next_sibling = U32::new(block_no);
    }

    pub fn frag_bytes(&self) -> u16 {
        self.frag_bytes.get()
    }

    pub fn set_frag_bytes(&mut self, bytes: u16) {
        self.frag_bytes = U16::new(bytes);
    }
}

/// Stamps the CRC-32 into a block image prior to writing it out.
pub fn stamp_checksum(data: &mut [u8]) {
    let sum = content_checksum(data);
    data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&sum.to_le_bytes());
}

/// Verifies a block image read from disk. All-zero blocks pass (freshly
/// allocated space that was never written back).
pub fn verify_checksum(data: &[u8]) -> bool {
    if data.iter().all(|&b| b == 0) {
        return true;
    }
    let stored = u32::from_le_bytes(
        data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]
            .try_into()
            .expect("checksum field is 4 bytes"),
    );
    stored == content_checksum(data)
}

fn content_checksum(data: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&data[..CHECKSUM_OFFSET]);
    digest.update(&data[CHECKSUM_OFFSET + 4..]);
    digest.finalize()
}

/// Structural validation of a cached block image. Violations are storage
/// corruption, reported to the caller and never repaired in place.
pub fn validate_block(data: &[u8], block_size: usize) -> Result<()> {
    ensure!(
        data.len() == block_size,
        "invalid block size: {} != {}",
        data.len(),
        block_size
    );

    let header = BlockHeader::from_bytes(data)?;

    let is_zeroed = header.kind == 0
        && header.entry_count.get() == 0
        && header.free_start.get() == 0
        && header.free_end.get() == 0;
    if is_zeroed {
        return Ok(());
    }

    ensure!(
        header.kind() != BlockKind::Unknown,
        "invalid block kind: {:02x}",
        header.kind
    );
    ensure!(
        header.free_start() >= BLOCK_HEADER_SIZE as u16,
        "free_start {} < header size {}",
        header.free_start(),
        BLOCK_HEADER_SIZE
    );
    ensure!(
        header.free_end() as usize <= block_size,
        "free_end {} > block size {}",
        header.free_end(),
        block_size
    );
    ensure!(
        header.free_start() <= header.free_end(),
        "free_start {} > free_end {}",
        header.free_start(),
        header.free_end()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_header_size_is_24_bytes() {
        assert_eq!(std::mem::size_of::<BlockHeader>(), BLOCK_HEADER_SIZE);
    }

    #[test]
    fn block_kind_from_byte() {
        assert_eq!(BlockKind::from_byte(0x01), BlockKind::Interior);
        assert_eq!(BlockKind::from_byte(0x02), BlockKind::Leaf);
        assert_eq!(BlockKind::from_byte(0x20), BlockKind::Blob);
        assert_eq!(BlockKind::from_byte(0x30), BlockKind::FreeTrunk);
        assert_eq!(BlockKind::from_byte(0x77), BlockKind::Unknown);
    }

    #[test]
    fn new_header_spans_whole_block() {
        let header = BlockHeader::new(BlockKind::Leaf, 4096);
        assert_eq!(header.kind(), BlockKind::Leaf);
        assert_eq!(header.free_start(), BLOCK_HEADER_SIZE as u16);
        assert_eq!(header.free_end(), 4096);
        assert_eq!(header.free_space(), 4096 - BLOCK_HEADER_SIZE as u16);
    }

    #[test]
    fn header_roundtrip_through_bytes() {
        let mut data = vec![0u8; 4096];
        {
            let header = BlockHeader::from_bytes_mut(&mut data).unwrap();
            header.set_kind(BlockKind::Interior);
            header.set_entry_count(17);
            header.set_next_sibling(42);
        }
        let header = BlockHeader::from_bytes(&data).unwrap();
        assert_eq!(header.kind(), BlockKind::Interior);
        assert_eq!(header.entry_count(), 17);
        assert_eq!(header.next_sibling(), 42);
    }

    #[test]
    fn checksum_roundtrip_and_detection() {
        let mut data = vec![0u8; 1024];
        BlockHeader::new(BlockKind::Leaf, 1024)
            .write_to(&mut data)
            .unwrap();
        data[100] = 0xAA;

        stamp_checksum(&mut data);
        assert!(verify_checksum(&data));

        data[100] = 0xAB;
        assert!(!verify_checksum(&data));
    }

    #[test]
    fn zeroed_block_passes_checksum_and_validation() {
        let data = vec![0u8; 2048];
        assert!(verify_checksum(&data));
        assert!(validate_block(&data, 2048).is_ok());
    }

    #[test]
    fn validate_rejects_inverted_free_window() {
        let mut data = vec![0u8; 1024];
        {
            let header = BlockHeader::from_bytes_mut(&mut data).unwrap();
            header.set_kind(BlockKind::Leaf);
            header.set_free_start(800);
            header.set_free_end(100);
        }
        let err = validate_block(&data, 1024).unwrap_err();
        assert!(err.to_string().contains("free_start"));
    }

    #[test]
    fn validate_rejects_wrong_length() {
        let data = vec![0u8; 100];
        assert!(validate_block(&data, 1024).is_err());
    }
}
