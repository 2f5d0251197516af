#![forbid(unsafe_code)]

//! The paged file: fixed-size page I/O with a shared LRU cache, pin/unpin
//! cursors, buffered ID reuse, and the stable/unstable generation pair.
//!
//! This is the layer every tree module sits on top of. It knows nothing
//! about node layout, keys, or values - just bytes, page IDs, and
//! generations.

pub mod cursor;
pub mod generation;
pub mod gsp;
pub mod id_allocator;
pub mod io;

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

pub use cursor::{Cursor, Mode, PinTracer, TracerSnapshot};
pub use generation::GenerationKeeper;
pub use id_allocator::IdAllocator;

use crate::error::Result;
use crate::pager::cursor::Frame;
use crate::pager::io::{FileIo, StdFileIo};
use crate::types::{Generation, PageId};

pub const DEFAULT_PAGE_SIZE: usize = 8192;
pub const DEFAULT_CACHE_SIZE: usize = 1024;

/// Page `0` is reserved for the tree's metadata; real nodes start at page 1.
pub const FIRST_DATA_PAGE: u64 = 1;

pub(crate) struct PagedFileInner {
    io: Arc<dyn FileIo>,
    page_size: usize,
    cache: Mutex<LruCache<PageId, Arc<Frame>>>,
    pub(crate) tracer: PinTracer,
    pub(crate) ids: IdAllocator,
    pub(crate) generations: GenerationKeeper,
    read_only: bool,
}

impl PagedFileInner {
    fn load_frame(self: &Arc<Self>, page_id: PageId) -> Result<Arc<Frame>> {
        {
            let mut cache = self.cache.lock();
            if let Some(frame) = cache.get(&page_id) {
                self.tracer.record_hit();
                return Ok(Arc::clone(frame));
            }
        }
        self.tracer.record_miss();

        let frame = Arc::new(Frame::new(page_id, self.page_size));
        let file_len = self.io.len()?;
        let offset = page_id.0 * self.page_size as u64;
        if file_len >= offset + self.page_size as u64 {
            let mut buf = vec![0u8; self.page_size];
            self.io.read_at(offset, &mut buf)?;
            *frame.buf.write() = buf.into_boxed_slice();
        }

        let mut cache = self.cache.lock();
        cache.put(page_id, Arc::clone(&frame));
        Ok(frame)
    }

    fn pin(self: &Arc<Self>, page_id: PageId, mode: Mode) -> Result<Cursor> {
        if mode == Mode::Write && self.read_only {
            return Err(crate::error::GbpError::ReadOnly);
        }
        let frame = self.load_frame(page_id)?;
        frame.pin_count.fetch_add(1, Ordering::AcqRel);
        self.tracer.record_pin();
        trace!(page = page_id.0, mode = ?mode, "pin");
        match mode {
            Mode::Read => Ok(Cursor::new_read(Arc::clone(self), frame)),
            Mode::Write => Ok(Cursor::new_write(Arc::clone(self), frame)),
        }
    }
}

/// Handle to an open paged file. Cheap to clone; clones share the cache,
/// ID allocator, and generation pair.
#[derive(Clone)]
pub struct PagedFile {
    inner: Arc<PagedFileInner>,
}

impl PagedFile {
    fn new(io: Arc<dyn FileIo>, page_size: usize, cache_size: usize, next_free: u64, read_only: bool) -> Result<Self> {
        let cache_size = NonZeroUsize::new(cache_size)
            .ok_or_else(|| crate::error::GbpError::InvalidArgument("cache size must be greater than zero".into()))?;
        Ok(Self {
            inner: Arc::new(PagedFileInner {
                io,
                page_size,
                cache: Mutex::new(LruCache::new(cache_size)),
                tracer: PinTracer::default(),
                ids: IdAllocator::new(next_free.max(FIRST_DATA_PAGE)),
                generations: GenerationKeeper::fresh(),
                read_only,
            }),
        })
    }

    /// Create a brand new paged file, reserving page 0 for metadata.
    pub fn create(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        io.truncate(page_size as u64)?;
        Self::new(Arc::new(io), page_size, DEFAULT_CACHE_SIZE, FIRST_DATA_PAGE, false)
    }

    /// Open an existing paged file for read-write access.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        let next_free = (io.len()? / page_size as u64).max(FIRST_DATA_PAGE);
        Self::new(Arc::new(io), page_size, DEFAULT_CACHE_SIZE, next_free, false)
    }

    /// Open an existing paged file read-only; any `pin(.., Mode::Write)`
    /// call fails with [`crate::error::GbpError::ReadOnly`].
    pub fn open_read_only(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let io = StdFileIo::open_read_only(path)?;
        let next_free = (io.len()? / page_size as u64).max(FIRST_DATA_PAGE);
        Self::new(Arc::new(io), page_size, DEFAULT_CACHE_SIZE, next_free, true)
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Result<Self> {
        let cache_size = NonZeroUsize::new(cache_size)
            .ok_or_else(|| crate::error::GbpError::InvalidArgument("cache size must be greater than zero".into()))?;
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_cache_size must be called before the PagedFile is shared");
        inner.cache = Mutex::new(LruCache::new(cache_size));
        Ok(self)
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    pub fn pin(&self, page_id: PageId, mode: Mode) -> Result<Cursor> {
        self.inner.pin(page_id, mode)
    }

    pub fn allocate_page(&self) -> Result<PageId> {
        Ok(self.inner.ids.allocate(&self.inner.generations))
    }

    pub fn release_page(&self, page_id: PageId, released_at: Generation) {
        self.inner.ids.release(page_id, released_at);
    }

    pub fn generations(&self) -> &GenerationKeeper {
        &self.inner.generations
    }

    /// Restore the stable/unstable pair read back from the metadata page at
    /// open time. Only valid before any writer has touched the tree.
    pub fn restore_generations(&self, stable: Generation, unstable: Generation) {
        self.inner.generations.restore(stable, unstable);
    }

    pub fn tracer(&self) -> &PinTracer {
        &self.inner.tracer
    }

    pub fn ids(&self) -> &IdAllocator {
        &self.inner.ids
    }

    /// Write every dirty frame currently cached back to the file. Does not
    /// fsync; callers that need durability call [`PagedFile::sync`] after.
    pub fn flush_dirty(&self) -> Result<()> {
        let cache = self.inner.cache.lock();
        for (page_id, frame) in cache.iter() {
            if frame.dirty.swap(false, Ordering::AcqRel) {
                let offset = page_id.0 * self.inner.page_size as u64;
                let bytes = frame.buf.read();
                self.inner.io.write_at(offset, &bytes)?;
            }
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.io.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_reserves_page_zero_and_allocates_from_one() {
        let dir = tempdir().unwrap();
        let pf = PagedFile::create(dir.path().join("t.db"), 4096).unwrap();
        assert_eq!(pf.allocate_page().unwrap(), PageId(1));
        assert_eq!(pf.allocate_page().unwrap(), PageId(2));
    }

    #[test]
    fn flush_then_reopen_preserves_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let pf = PagedFile::create(&path, 4096).unwrap();
            let page = pf.allocate_page().unwrap();
            {
                let mut cur = pf.pin(page, Mode::Write).unwrap();
                cur.bytes_mut()[..5].copy_from_slice(b"hello");
            }
            pf.flush_dirty().unwrap();
            pf.sync().unwrap();
        }
        let reopened = PagedFile::open(&path, 4096).unwrap();
        let cur = reopened.pin(PageId(1), Mode::Read).unwrap();
        assert_eq!(&cur.bytes()[..5], b"hello");
    }

    #[test]
    fn read_only_file_rejects_write_pin() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let pf = PagedFile::create(&path, 4096).unwrap();
            pf.allocate_page().unwrap();
            pf.flush_dirty().unwrap();
        }
        let ro = PagedFile::open_read_only(&path, 4096).unwrap();
        assert!(ro.pin(PageId(1), Mode::Write).is_err());
        assert!(ro.pin(PageId(1), Mode::Read).is_ok());
    }
}
