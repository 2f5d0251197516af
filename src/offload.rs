#![forbid(unsafe_code)]

//! The offload store: a chain of overflow pages for a key or value that
//! doesn't fit a node's inline budget. A node keeps only an 8-byte offload
//! ID (the chain's head page) in its slot; the bytes themselves live here.
//!
//! Offload pages are written once and never mutated in place - a removed
//! or superseded chain is released back through the same generation-gated
//! [`crate::pager::id_allocator::IdAllocator`] every other COW'd page uses,
//! so a long-running reader mid-walk of an old chain is never handed a
//! page that's already been reused.

use crate::checksum::page_crc32;
use crate::error::{GbpError, Result};
use crate::pager::cursor::Mode;
use crate::pager::generation::GenerationKeeper;
use crate::pager::id_allocator::IdAllocator;
use crate::pager::PagedFile;
use crate::types::{read_u32, read_u64, write_u32, write_u64, Generation, PageId};

const LINK_HEADER_SIZE: usize = 8 + 8 + 4 + 4; // next page id, generation, payload len, crc32

/// Validates that an offload ID read out of a node slot names a page this
/// store could plausibly have written - guards against a corrupted slot
/// sending a reader chasing an arbitrary page ID.
pub trait OffloadValidator: Send + Sync {
    fn validate(&self, id: PageId) -> bool;
}

/// Accepts any page below the paged file's current high-water mark.
pub struct HighWaterValidator {
    pub high_water: u64,
}

impl OffloadValidator for HighWaterValidator {
    fn validate(&self, id: PageId) -> bool {
        !id.is_no_node() && id.0 < self.high_water
    }
}

pub struct OffloadStore {
    pager: PagedFile,
}

impl OffloadStore {
    pub fn new(pager: PagedFile) -> Self {
        Self { pager }
    }

    /// Write `bytes` across as many pages as needed, returning the chain's
    /// head page ID (the opaque offload ID a node slot stores).
    pub fn write(&self, bytes: &[u8], generation: Generation) -> Result<PageId> {
        let page_size = self.pager.page_size();
        let capacity = page_size - LINK_HEADER_SIZE;
        debug_assert!(capacity > 0, "page too small to hold an offload link header");

        let mut chunks: Vec<&[u8]> = bytes.chunks(capacity).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        let mut next = PageId::NO_NODE;
        for chunk in chunks.iter().rev() {
            let page_id = self.pager.allocate_page()?;
            let mut cursor = self.pager.pin(page_id, Mode::Write)?;
            let buf = cursor.bytes_mut();
            write_u64(buf, 0, next.0);
            write_u64(buf, 8, generation.0);
            write_u32(buf, 16, chunk.len() as u32);
            let crc = page_crc32(page_id.0, generation.0, chunk);
            write_u32(buf, 20, crc);
            buf[LINK_HEADER_SIZE..LINK_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
            next = page_id;
        }
        Ok(next)
    }

    /// Follow the chain from `head`, concatenating every link's payload.
    pub fn read(&self, head: PageId, validator: &dyn OffloadValidator) -> Result<Vec<u8>> {
        if !validator.validate(head) {
            return Err(GbpError::corruption("offload id failed validation"));
        }
        let mut out = Vec::new();
        let mut cursor_id = head;
        loop {
            let cursor = self.pager.pin(cursor_id, Mode::Read)?;
            let buf = cursor.bytes();
            let next = PageId(read_u64(buf, 0));
            let link_generation = read_u64(buf, 8);
            let len = read_u32(buf, 16) as usize;
            let crc = read_u32(buf, 20);
            let payload = &buf[LINK_HEADER_SIZE..LINK_HEADER_SIZE + len];
            if page_crc32(cursor_id.0, link_generation, payload) != crc {
                return Err(GbpError::corruption(format!(
                    "offload link at page {cursor_id} failed checksum"
                )));
            }
            out.extend_from_slice(payload);
            if next.is_no_node() {
                break;
            }
            if !validator.validate(next) {
                return Err(GbpError::corruption("offload chain link failed validation"));
            }
            cursor_id = next;
        }
        Ok(out)
    }

    /// Release every page in the chain starting at `head` back to the
    /// allocator, gated on `released_at` the same way any COW'd page is.
    pub fn release_chain(&self, head: PageId, released_at: Generation) -> Result<()> {
        let mut cursor_id = head;
        loop {
            let next = {
                let cursor = self.pager.pin(cursor_id, Mode::Read)?;
                PageId(read_u64(cursor.bytes(), 0))
            };
            self.pager.release_page(cursor_id, released_at);
            if next.is_no_node() {
                break;
            }
            cursor_id = next;
        }
        Ok(())
    }

    pub fn high_water_validator(&self) -> HighWaterValidator {
        HighWaterValidator { high_water: self.pager.ids().high_water() }
    }

    pub fn generations(&self) -> &GenerationKeeper {
        self.pager.generations()
    }

    pub fn ids(&self) -> &IdAllocator {
        self.pager.ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn small_payload_round_trips_single_page() {
        let dir = tempdir().unwrap();
        let pf = PagedFile::create(dir.path().join("t.db"), 256).unwrap();
        let store = OffloadStore::new(pf.clone());
        let head = store.write(b"hello offload", Generation(1)).unwrap();
        let validator = store.high_water_validator();
        let read_back = store.read(head, &validator).unwrap();
        assert_eq!(read_back, b"hello offload");
    }

    #[test]
    fn large_payload_spans_multiple_pages() {
        let dir = tempdir().unwrap();
        let pf = PagedFile::create(dir.path().join("t.db"), 64).unwrap();
        let store = OffloadStore::new(pf.clone());
        let payload: Vec<u8> = (0..500).map(|i| (i % 251) as u8).collect();
        let head = store.write(&payload, Generation(1)).unwrap();
        let validator = store.high_water_validator();
        let read_back = store.read(head, &validator).unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn release_chain_queues_every_page() {
        let dir = tempdir().unwrap();
        let pf = PagedFile::create(dir.path().join("t.db"), 64).unwrap();
        let store = OffloadStore::new(pf.clone());
        let payload = vec![7u8; 300];
        let head = store.write(&payload, Generation(1)).unwrap();
        store.release_chain(head, pf.generations().stable()).unwrap();
        assert!(store.ids().pending_count() >= 5);
    }
}
