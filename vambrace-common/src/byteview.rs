//! Memory-mapped access to an input binary.

use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

/// A shared, read-only memory mapping of an input file.
///
/// The container parser needs cheap random access to arbitrary byte ranges
/// of the file; a memory map provides that without per-read I/O. Cloning
/// only bumps a reference count, so the FAT slices of one file all share a
/// single mapping.
///
/// Empty files cannot be mapped by the OS and are represented without a
/// mapping; they dereference to an empty slice.
#[derive(Clone, Debug)]
pub struct ByteView {
    mapping: Arc<Option<Mmap>>,
}

impl ByteView {
    /// Memory-maps the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let file = File::open(path)?;
        let mapping = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => Some(mmap),
            // the OS rejects zero-length mappings; treat the file as empty
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => None,
            Err(err) => return Err(err),
        };

        Ok(ByteView {
            mapping: Arc::new(mapping),
        })
    }

    /// The mapped bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self.mapping.as_ref() {
            Some(mmap) => mmap,
            None => &[],
        }
    }
}

impl Deref for ByteView {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use similar_asserts::assert_eq;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_empty_file() -> Result<(), std::io::Error> {
        let tmp = NamedTempFile::new()?;

        let view = ByteView::open(tmp.path())?;
        assert_eq!(&*view, b"");

        Ok(())
    }

    #[test]
    fn test_open_file() -> Result<(), std::io::Error> {
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(b"1234")?;
        tmp.flush()?;

        let view = ByteView::open(tmp.path())?;
        assert_eq!(&*view, b"1234");

        Ok(())
    }

    #[test]
    fn test_clones_share_one_mapping() -> Result<(), std::io::Error> {
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(b"abcd")?;
        tmp.flush()?;

        let view = ByteView::open(tmp.path())?;
        let copy = view.clone();
        assert_eq!(view.as_slice().as_ptr(), copy.as_slice().as_ptr());

        Ok(())
    }
}
