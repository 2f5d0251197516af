#![forbid(unsafe_code)]

//! Frames, pin tracking, and the read/write cursor handed out by [`super::PagedFile`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock};

use crate::error::Result;
use crate::types::PageId;

use super::PagedFileInner;

/// Which direction a [`Cursor`] was pinned for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Read,
    Write,
}

/// One page-sized buffer, shared by every cursor currently pinning it.
///
/// `write_seq` is bumped each time a write cursor releases the page; a read
/// cursor compares the value it observed at pin time against the current
/// value to decide whether its snapshot may be stale.
pub struct Frame {
    pub id: PageId,
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub write_seq: AtomicU64,
    pub pin_count: AtomicU32,
    pub dirty: std::sync::atomic::AtomicBool,
}

impl Frame {
    pub fn new(id: PageId, page_size: usize) -> Self {
        Self {
            id,
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            write_seq: AtomicU64::new(0),
            pin_count: AtomicU32::new(0),
            dirty: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

/// Pin/unpin/hit counters, readable by tests to assert every cursor obtained
/// during a top-level operation was released.
#[derive(Default)]
pub struct PinTracer {
    pins: AtomicU64,
    unpins: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TracerSnapshot {
    pub pins: u64,
    pub unpins: u64,
    pub hits: u64,
    pub misses: u64,
}

impl PinTracer {
    pub(crate) fn record_pin(&self) {
        self.pins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unpin(&self) {
        self.unpins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TracerSnapshot {
        TracerSnapshot {
            pins: self.pins.load(Ordering::Relaxed),
            unpins: self.unpins.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// `true` once every pin this tracer has seen has a matching unpin.
    pub fn balanced(&self) -> bool {
        self.pins.load(Ordering::Relaxed) == self.unpins.load(Ordering::Relaxed)
    }
}

/// A pinned view of one page.
///
/// Read cursors take an eager, uncontended snapshot of the page at pin time
/// and never block a concurrent writer; [`Cursor::should_retry`] tells the
/// caller whether a write raced the snapshot and the read must be redone.
/// Write cursors hold the frame's lock for their entire lifetime, so a
/// sequence of in-place edits against a freshly copy-on-written page is
/// linearized without the caller re-pinning between edits.
pub struct Cursor {
    pager: Arc<PagedFileInner>,
    frame: Arc<Frame>,
    mode: Mode,
    snapshot: Option<Box<[u8]>>,
    seq_at_pin: u64,
    write_guard: Option<ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>>,
}

impl Cursor {
    pub(crate) fn new_read(pager: Arc<PagedFileInner>, frame: Arc<Frame>) -> Self {
        let seq_at_pin = frame.write_seq.load(Ordering::Acquire);
        let snapshot = frame.buf.read().clone();
        let seq_after = frame.write_seq.load(Ordering::Acquire);
        let mut cursor = Self {
            pager,
            frame,
            mode: Mode::Read,
            snapshot: Some(snapshot),
            seq_at_pin,
            write_guard: None,
        };
        if seq_after != seq_at_pin {
            // A write landed mid-copy; force should_retry() without a second read.
            cursor.seq_at_pin = seq_at_pin.wrapping_sub(1);
        }
        cursor
    }

    pub(crate) fn new_write(pager: Arc<PagedFileInner>, frame: Arc<Frame>) -> Self {
        let guard = frame.buf.write_arc();
        Self {
            pager,
            frame,
            mode: Mode::Write,
            snapshot: None,
            seq_at_pin: 0,
            write_guard: Some(guard),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.frame.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Snapshot taken at pin time. Panics if called on a write cursor; use
    /// [`Cursor::bytes_mut`] there instead.
    pub fn bytes(&self) -> &[u8] {
        self.snapshot
            .as_deref()
            .expect("bytes() called on a write cursor")
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.write_guard
            .as_mut()
            .expect("bytes_mut() called on a read cursor")
    }

    /// `true` if a writer modified this page between the snapshot being
    /// taken and now. The caller must discard whatever it derived from
    /// [`Cursor::bytes`] and re-pin.
    pub fn should_retry(&self) -> bool {
        debug_assert_eq!(self.mode, Mode::Read);
        self.frame.write_seq.load(Ordering::Acquire) != self.seq_at_pin
    }

    /// Re-pin this cursor against a different page, reusing its frame slot
    /// lookup instead of allocating a fresh `Cursor`. Used by range seeks
    /// walking sibling chains.
    pub fn next(self, page_id: PageId) -> Result<Cursor> {
        let pager = Arc::clone(&self.pager);
        let mode = self.mode;
        drop(self);
        pager.pin(page_id, mode)
    }

    /// Release the write guard and mark the frame dirty, bumping its write
    /// sequence so racing read snapshots observe the change.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.mode == Mode::Write {
            if let Some(guard) = self.write_guard.take() {
                self.frame.dirty.store(true, Ordering::Release);
                self.frame.write_seq.fetch_add(1, Ordering::AcqRel);
                drop(guard);
            }
        }
        self.frame.pin_count.fetch_sub(1, Ordering::AcqRel);
        self.pager.tracer.record_unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::PagedFile;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_sees_update() {
        let dir = tempdir().unwrap();
        let pf = PagedFile::create(dir.path().join("t.db"), 4096).unwrap();
        let page = pf.allocate_page().unwrap();

        {
            let mut cur = pf.pin(page, Mode::Write).unwrap();
            cur.bytes_mut()[0] = 7;
        }

        let cur = pf.pin(page, Mode::Read).unwrap();
        assert_eq!(cur.bytes()[0], 7);
        assert!(!cur.should_retry());
    }

    #[test]
    fn tracer_balances_after_scope_exit() {
        let dir = tempdir().unwrap();
        let pf = PagedFile::create(dir.path().join("t.db"), 4096).unwrap();
        let page = pf.allocate_page().unwrap();
        {
            let _cur = pf.pin(page, Mode::Read).unwrap();
        }
        assert!(pf.tracer().balanced());
    }
}
