#![forbid(unsafe_code)]

//! Page ID allocation with buffered, generation-gated reuse.
//!
//! A page released by the writer isn't immediately recyclable: an
//! optimistic reader that started before the release may still be mid-walk
//! against it. Released IDs sit in a pending queue, keyed by the generation
//! they were released at, until [`crate::pager::generation::GenerationKeeper`]
//! says it's safe, at which point they're folded into the free list proper.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::pager::generation::GenerationKeeper;
use crate::types::{Generation, PageId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    pub start: PageId,
    pub len: u32,
}

impl Extent {
    pub fn new(start: PageId, len: u32) -> Self {
        Self { start, len }
    }

    fn coalesce_with(&mut self, other: &Extent) -> bool {
        if self.start.0 + self.len as u64 == other.start.0 {
            self.len += other.len;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct HeapExtent {
    start: PageId,
    len: u32,
}

impl Ord for HeapExtent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.len.cmp(&other.len).then_with(|| other.start.0.cmp(&self.start.0))
    }
}

impl PartialOrd for HeapExtent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<Extent> for HeapExtent {
    fn from(e: Extent) -> Self {
        HeapExtent { start: e.start, len: e.len }
    }
}

#[derive(Default)]
struct FreeCache {
    extents: Vec<Extent>,
    heap: BinaryHeap<HeapExtent>,
}

impl FreeCache {
    fn pop(&mut self) -> Option<PageId> {
        let mut extent = self.heap.pop()?;
        let page = extent.start;
        match self.extents.binary_search_by_key(&extent.start.0, |e| e.start.0) {
            Ok(pos) if extent.len > 1 => {
                self.extents[pos].start.0 += 1;
                self.extents[pos].len -= 1;
                extent.start.0 += 1;
                extent.len -= 1;
                self.heap.push(extent);
            }
            Ok(pos) => {
                self.extents.remove(pos);
            }
            Err(_) => {
                // Heap and sorted extent list disagree; rebuild once and retry.
                self.heap.push(extent);
                self.rebuild();
                return self.pop();
            }
        }
        Some(page)
    }

    fn push(&mut self, page: PageId) {
        self.extents.push(Extent::new(page, 1));
        self.rebuild();
    }

    fn rebuild(&mut self) {
        if self.extents.is_empty() {
            self.heap.clear();
            return;
        }
        self.extents.sort_by_key(|e| e.start.0);
        let mut merged: Vec<Extent> = Vec::with_capacity(self.extents.len());
        for extent in self.extents.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.coalesce_with(&extent) {
                    continue;
                }
            }
            merged.push(extent);
        }
        self.heap = merged.iter().copied().map(HeapExtent::from).collect();
        self.extents = merged;
    }
}

/// Allocates and recycles page IDs above the reserved metadata page.
pub struct IdAllocator {
    high_water: AtomicU64,
    free: Mutex<FreeCache>,
    pending: Mutex<BTreeMap<u64, Vec<PageId>>>,
}

impl IdAllocator {
    /// `next_free` is the first never-yet-used page ID (the current end of file).
    pub fn new(next_free: u64) -> Self {
        Self {
            high_water: AtomicU64::new(next_free),
            free: Mutex::new(FreeCache::default()),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Recycle list entries that have become safe to free, then allocate.
    pub fn allocate(&self, keeper: &GenerationKeeper) -> PageId {
        self.reclaim(keeper);
        let mut free = self.free.lock().unwrap();
        if let Some(page) = free.pop() {
            return page;
        }
        drop(free);
        PageId(self.high_water.fetch_add(1, AtomicOrdering::AcqRel))
    }

    /// Queue `page` for reuse once no reader active at `released_at` or
    /// older can still observe it.
    pub fn release(&self, page: PageId, released_at: Generation) {
        self.pending.lock().unwrap().entry(released_at.0).or_default().push(page);
    }

    /// Move every pending batch that `keeper` now certifies as safe into
    /// the free list. Called both from `allocate` and opportunistically
    /// by the cleanup collector after a checkpoint.
    pub fn reclaim(&self, keeper: &GenerationKeeper) {
        let mut pending = self.pending.lock().unwrap();
        let ready: Vec<u64> = pending
            .keys()
            .copied()
            .take_while(|&gen| keeper.safe_to_free(Generation(gen)))
            .collect();
        let mut free = self.free.lock().unwrap();
        for gen in ready {
            if let Some(pages) = pending.remove(&gen) {
                for page in pages {
                    free.push(page);
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().extents.iter().map(|e| e.len as usize).sum()
    }

    pub fn high_water(&self) -> u64 {
        self.high_water.load(AtomicOrdering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_grows_high_water_with_empty_free_list() {
        let ids = IdAllocator::new(1);
        let keeper = GenerationKeeper::fresh();
        assert_eq!(ids.allocate(&keeper), PageId(1));
        assert_eq!(ids.allocate(&keeper), PageId(2));
    }

    #[test]
    fn released_page_is_not_reused_until_safe() {
        let ids = IdAllocator::new(1);
        let keeper = GenerationKeeper::fresh();
        let page = ids.allocate(&keeper);
        ids.release(page, keeper.stable());

        let next = ids.allocate(&keeper);
        assert_ne!(next, page, "page must not be recycled before stable passes release generation");

        keeper.advance().unwrap();
        let recycled = ids.allocate(&keeper);
        assert_eq!(recycled, page);
    }

    #[test]
    fn released_page_withheld_while_reader_active() {
        let ids = IdAllocator::new(1);
        let keeper = GenerationKeeper::fresh();
        let page = ids.allocate(&keeper);
        let reader = keeper.register_reader();
        let release_gen = keeper.unstable();
        ids.release(page, release_gen);
        // Advance stable past release_gen so only the active reader withholds reuse.
        keeper.advance().unwrap();
        keeper.advance().unwrap();

        let next = ids.allocate(&keeper);
        assert_ne!(next, page, "reader registered at the release generation must block reuse");

        drop(reader);
        let recycled = ids.allocate(&keeper);
        assert_eq!(recycled, page);
    }
}
