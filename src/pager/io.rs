#![forbid(unsafe_code)]

//! Positioned file I/O, abstracted behind a trait so tests can swap in an
//! in-memory fake without touching the rest of the pager.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use crate::error::{GbpError, Result};

/// Positioned reads/writes against the tree's backing file.
///
/// Implementations must not assume calls are serialized: the pager may issue
/// concurrent reads from multiple cursors against non-overlapping offsets.
pub trait FileIo: Send + Sync + 'static {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    fn sync_all(&self) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod platform {
    use super::*;
    use std::os::unix::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let n = file.read_at(dst, off)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF"));
            }
            let (_, tail) = dst.split_at_mut(n);
            dst = tail;
            off += n as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let n = file.write_at(src, off)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "write_at wrote zero bytes"));
            }
            src = &src[n..];
            off += n as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::os::windows::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let n = file.seek_read(dst, off)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "seek_read reached EOF"));
            }
            let (_, tail) = dst.split_at_mut(n);
            dst = tail;
            off += n as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let n = file.seek_write(src, off)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "seek_write wrote zero bytes"));
            }
            src = &src[n..];
            off += n as u64;
        }
        Ok(())
    }
}

/// [`FileIo`] backed by a real OS file, using positioned reads/writes so
/// callers never need a shared seek cursor.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    pub fn new(file: File) -> Self {
        Self { inner: Arc::new(file) }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        platform::read_exact(self.file(), off, dst).map_err(GbpError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        platform::write_all(self.file(), off, src).map_err(GbpError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(GbpError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(GbpError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("io.bin")).unwrap();

        io.write_at(0, b"hello gbptree").unwrap();
        io.sync_all().unwrap();

        let mut buf = vec![0u8; b"hello gbptree".len()];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello gbptree");
    }

    #[test]
    fn read_past_eof_errors() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("io.bin")).unwrap();
        let mut buf = [0u8; 8];
        match io.read_at(0, &mut buf).unwrap_err() {
            GbpError::Io(inner) => assert_eq!(inner.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn truncate_extends_with_zeros() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("io.bin")).unwrap();
        io.truncate(4096).unwrap();
        assert_eq!(io.len().unwrap(), 4096);
        let mut buf = vec![0xffu8; 4096];
        io.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
