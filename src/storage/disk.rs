//! # Positioned Block I/O
//!
//! `DiskFile` is the lowest storage layer: it maps block numbers to byte
//! ranges of an ordinary file and performs seek+read/seek+write under a
//! mutex. Checksums are stamped on every block write and verified on every
//! block read; a mismatch is fatal corruption.
//!
//! Reads past the current end of file return a zeroed block: allocation
//! only bumps the logical block count, and the file grows when a block is
//! first written back.
//!
//! Block 0 (the file header) bypasses the checksum scheme and is accessed
//! through the `*_raw` methods.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use parking_lot::Mutex;

use crate::error::StoreError;
use super::page::{stamp_checksum, verify_checksum};

pub struct DiskFile {
    file: Mutex<File>,
    path: PathBuf,
    block_size: usize,
}

impl DiskFile {
    pub fn open(path: &Path, block_size: usize) -> Result<(Self, bool)> {
        let created = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("opening {}", path.display()))?;

        Ok((
            Self {
                file: Mutex::new(file),
                path: path.to_path_buf(),
                block_size,
            },
            created,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Reads a block into `buf`, verifying its checksum. Unwritten blocks
    /// read back as zeroes.
    pub fn read_block_into(&self, block_no: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        let offset = block_no as u64 * self.block_size as u64;

        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if offset >= len {
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
            .wrap_err_with(|| format!("reading block {} of {}", block_no, self.file_name()))?;
        drop(file);

        if block_no != 0 && !verify_checksum(buf) {
            return Err(StoreError::Corrupt(format!(
                "checksum mismatch on block {} of {}",
                block_no,
                self.file_name()
            ))
            .into());
        }
        Ok(())
    }

    /// Writes a block image, stamping the checksum first. Takes the image
    /// by value of a scratch copy so cached buffers stay checksum-free.
    pub fn write_block(&self, block_no: u32, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.block_size);
        let mut image = data.to_vec();
        if block_no != 0 {
            stamp_checksum(&mut image);
        }

        let offset = block_no as u64 * self.block_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&image)
            .wrap_err_with(|| format!("writing block {} of {}", block_no, self.file_name()))?;
        Ok(())
    }

    /// Raw read of a byte range, used for the file header.
    pub fn read_raw(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if offset >= len {
            buf.fill(0);
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Raw write of a byte range, used for the file header.
    pub fn write_raw(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Truncates the file to `block_count` blocks. Used by `Clear`.
    pub fn truncate(&self, block_count: u32) -> Result<()> {
        let file = self.file.lock();
        file.set_len(block_count as u64 * self.block_size as u64)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;
    use crate::storage::page::{BlockHeader, BlockKind};

    fn scratch(block_size: usize) -> (tempfile::TempDir, DiskFile) {
        let dir = tempfile::tempdir().unwrap();
        let (disk, created) = DiskFile::open(&dir.path().join("t.db"), block_size).unwrap();
        assert!(created);
        (dir, disk)
    }

    #[test]
    fn unwritten_blocks_read_as_zero() {
        let (_dir, disk) = scratch(1024);
        let mut buf = vec![0xFFu8; 1024];
        disk.read_block_into(5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn block_roundtrip_with_checksum() {
        let (_dir, disk) = scratch(1024);
        let mut block = vec![0u8; 1024];
        BlockHeader::new(BlockKind::Leaf, 1024)
            .write_to(&mut block)
            .unwrap();
        block[500] = 0x42;

        disk.write_block(3, &block).unwrap();

        let mut back = vec![0u8; 1024];
        disk.read_block_into(3, &mut back).unwrap();
        assert_eq!(back[500], 0x42);
        assert_eq!(BlockHeader::from_bytes(&back).unwrap().kind(), BlockKind::Leaf);
    }

    #[test]
    fn corrupted_block_is_detected() {
        let (_dir, disk) = scratch(1024);
        let mut block = vec![0u8; 1024];
        BlockHeader::new(BlockKind::Leaf, 1024)
            .write_to(&mut block)
            .unwrap();
        disk.write_block(2, &block).unwrap();

        // Flip a payload byte behind the checksum's back.
        let mut raw = vec![0u8; 1024];
        disk.read_raw(2 * 1024, &mut raw).unwrap();
        raw[900] ^= 0xFF;
        disk.write_raw(2 * 1024, &raw).unwrap();

        let mut buf = vec![0u8; 1024];
        let err = disk.read_block_into(2, &mut buf).unwrap_err();
        assert!(matches!(
            store_error(&err),
            Some(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn raw_header_roundtrip() {
        let (_dir, disk) = scratch(1024);
        disk.write_raw(0, b"objdb-da test header").unwrap();
        let mut buf = [0u8; 8];
        disk.read_raw(0, &mut buf).unwrap();
        assert_eq!(&buf, b"objdb-da");
    }
}
