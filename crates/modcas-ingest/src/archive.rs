//! In-memory module archive reader
//!
//! Entries are read one at a time into a caller-owned buffer. Nothing borrowed
//! from the zip reader outlives [`ModuleArchive::read_entry`], so callers are
//! free to await between entries.

use std::io::{Cursor, Read};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::ArchiveError;

/// Upper bound on the capacity reserved from an entry's declared size.
const MAX_RESERVE: usize = 64 * 1024 * 1024;

/// Zip archive backed by a byte slice
pub struct ModuleArchive<'a> {
    zip: ZipArchive<Cursor<&'a [u8]>>,
}

impl<'a> ModuleArchive<'a> {
    /// Parse the central directory of `bytes`.
    pub fn open(bytes: &'a [u8]) -> Result<Self, ArchiveError> {
        let zip = ZipArchive::new(Cursor::new(bytes))?;
        Ok(Self { zip })
    }

    /// Number of entries, directories included.
    pub fn len(&self) -> usize {
        self.zip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zip.is_empty()
    }

    /// Decompress entry `index` into `buf`, replacing its contents.
    ///
    /// Returns the entry name, or `None` for directories (which leave `buf`
    /// untouched).
    pub fn read_entry(&mut self, index: usize, buf: &mut Vec<u8>) -> Result<Option<String>, ArchiveError> {
        let mut entry = self.zip.by_index(index)?;
        if entry.is_dir() {
            return Ok(None);
        }

        let name = entry.name().to_string();
        buf.clear();
        let declared = usize::try_from(entry.size()).unwrap_or(usize::MAX);
        buf.reserve(declared.min(MAX_RESERVE));
        entry.read_to_end(buf).map_err(ZipError::Io)?;

        Ok(Some(name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Build a zip with the given files; names ending in `/` become directories.
    pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn read_all(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = ModuleArchive::open(bytes).unwrap();
        let mut buf = Vec::new();
        let mut out = Vec::new();
        for index in 0..archive.len() {
            if let Some(name) = archive.read_entry(index, &mut buf).unwrap() {
                out.push((name, buf.clone()));
            }
        }
        out
    }

    #[test]
    fn test_reads_files_in_order() {
        let bytes = build_zip(&[
            ("example.com/m@v1.0.0/go.mod", b"module example.com/m\n"),
            ("example.com/m@v1.0.0/m.go", b"package m\n"),
        ]);

        let entries = read_all(&bytes);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "example.com/m@v1.0.0/go.mod");
        assert_eq!(entries[1].1, b"package m\n");
    }

    #[test]
    fn test_directories_are_skipped() {
        let bytes = build_zip(&[("m@v1/", b""), ("m@v1/a.go", b"package a\n")]);

        let mut archive = ModuleArchive::open(&bytes).unwrap();
        assert_eq!(archive.len(), 2);

        let mut buf = b"untouched".to_vec();
        assert_eq!(archive.read_entry(0, &mut buf).unwrap(), None);
        assert_eq!(buf, b"untouched");
        assert_eq!(read_all(&bytes).len(), 1);
    }

    #[test]
    fn test_buffer_is_replaced_per_entry() {
        let bytes = build_zip(&[("long.txt", b"a much longer payload"), ("short.txt", b"tiny")]);
        let mut archive = ModuleArchive::open(&bytes).unwrap();
        let mut buf = Vec::new();

        archive.read_entry(0, &mut buf).unwrap();
        archive.read_entry(1, &mut buf).unwrap();
        assert_eq!(buf, b"tiny");
    }

    #[test]
    fn test_empty_archive() {
        let bytes = build_zip(&[]);
        let archive = ModuleArchive::open(&bytes).unwrap();
        assert!(archive.is_empty());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ModuleArchive::open(b"<html>not found</html>").is_err());
    }
}
