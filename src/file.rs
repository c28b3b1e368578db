//! Low-level file primitives for page-aligned I/O.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::types::PageIndex;

/// Wrapper around the database file handle.
#[derive(Debug)]
pub struct DbFile {
    file: File,
    path: PathBuf,
}

impl DbFile {
    /// Open the database file, creating it if absent.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io("open", e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Return the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a full page into the provided buffer.
    pub fn read_page(&mut self, idx: PageIndex, out: &mut [u8; PAGE_SIZE]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(page_offset(idx)))
            .map_err(|e| Error::io("seek_read", e))?;
        match self.file.read_exact(out) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::corrupt(
                "file.short_read",
                format!("file shorter than expected reading page {}", idx),
            )),
            Err(e) => Err(Error::io("read_page", e)),
        }
    }

    /// Write a full page from the provided buffer.
    pub fn write_page(&mut self, idx: PageIndex, data: &[u8; PAGE_SIZE]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(page_offset(idx)))
            .map_err(|e| Error::io("seek_write", e))?;
        self.file
            .write_all(data)
            .map_err(|e| Error::io("write_page", e))
    }

    /// Overwrite the first `prefix.len()` bytes of page 0.
    pub fn write_page_zero_prefix(&mut self, prefix: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::io("seek_write", e))?;
        self.file
            .write_all(prefix)
            .map_err(|e| Error::io("write_header", e))
    }

    /// Return the number of pages in the file, rejecting unaligned lengths.
    pub fn page_count(&mut self) -> Result<u32> {
        let len = self
            .file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| Error::io("file_len", e))?;
        if len % PAGE_SIZE as u64 != 0 {
            return Err(Error::corrupt(
                "file.len_alignment",
                format!("length {} is not a multiple of page size {}", len, PAGE_SIZE),
            ));
        }
        let pages = len / PAGE_SIZE as u64;
        if pages > u32::MAX as u64 {
            return Err(Error::corrupt(
                "file.page_count",
                "page count exceeds u32::MAX",
            ));
        }
        Ok(pages as u32)
    }
}

fn page_offset(idx: PageIndex) -> u64 {
    idx.0 as u64 * PAGE_SIZE as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn page_io_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let mut f = DbFile::open(&path).unwrap();
        assert_eq!(f.page_count().unwrap(), 0);

        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xAA;
        page[PAGE_SIZE - 1] = 0xBB;
        f.write_page(PageIndex(2), &page).unwrap();
        assert_eq!(f.page_count().unwrap(), 3);

        let mut out = [0u8; PAGE_SIZE];
        f.read_page(PageIndex(2), &mut out).unwrap();
        assert_eq!(out[0], 0xAA);
        assert_eq!(out[PAGE_SIZE - 1], 0xBB);
    }

    #[test]
    fn unaligned_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.db");
        {
            let mut raw = std::fs::File::create(&path).unwrap();
            raw.write_all(&[0u8; 100]).unwrap();
        }
        let mut f = DbFile::open(&path).unwrap();
        let err = f.page_count().unwrap_err();
        assert!(matches!(
            err,
            Error::CorruptFile { context: "file.len_alignment", .. }
        ));
    }

    #[test]
    fn reading_past_end_is_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.db");
        let mut f = DbFile::open(&path).unwrap();
        let mut out = [0u8; PAGE_SIZE];
        let err = f.read_page(PageIndex(0), &mut out).unwrap_err();
        assert!(matches!(
            err,
            Error::CorruptFile { context: "file.short_read", .. }
        ));
    }
}
