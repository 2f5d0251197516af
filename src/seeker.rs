#![forbid(unsafe_code)]

//! The tree seeker (§4.7): optimistic, lock-free range reads over a
//! snapshot of the root GSP taken at seek start.
//!
//! A seek never blocks a writer and a writer never blocks a seek - each
//! node is read through [`crate::pager::cursor::Cursor::should_retry`],
//! which tells us whether a concurrent write raced the snapshot. Wider
//! structural changes (a split moved our target key to a new page, a
//! tombstone compaction shrank a leaf out from under us) show up as a key
//! count or ordering mismatch at the position we expected to find; either
//! kind of surprise restarts the descent from the root rather than trying
//! to patch up a partial traversal. Because the read generation is fixed
//! for the lifetime of the seek, restarting finds exactly the view the
//! seek started with, plus whatever new keys landed at or after the save
//! point - the "may observe concurrent inserts" guarantee §4.7 allows.
//!
//! The seeker registers a long-running reader with the pager's
//! [`crate::pager::generation::GenerationKeeper`] for its whole lifetime,
//! so a page it is mid-traversal of is never recycled out from under it
//! even if a checkpoint advances the generation pair while the seek is
//! still open.

use std::cmp::Ordering;
use std::ops::Bound;

use crate::error::Result;
use crate::layout::Layout;
use crate::node::{BodyLayout, NodeHeader};
use crate::offload::OffloadStore;
use crate::pager::cursor::Mode;
use crate::pager::generation::ReaderGuard;
use crate::pager::gsp::Gsp;
use crate::pager::PagedFile;
use crate::types::{read_u64, Generation, PageId};

/// Builds [`SeekIter`]s against a single snapshot of the tree. Cheap to
/// construct; the expensive state (the registered reader, the current
/// position) lives on the iterator it returns.
pub struct Seeker<'a, L: Layout> {
    pager: &'a PagedFile,
    body: BodyLayout,
    offload: &'a OffloadStore,
    layout: &'a L,
}

impl<'a, L: Layout> Seeker<'a, L> {
    pub fn new(pager: &'a PagedFile, body: BodyLayout, offload: &'a OffloadStore, layout: &'a L) -> Self {
        Self { pager, body, offload, layout }
    }

    /// Half-open range `[from, to)` over `root`, read at the generation
    /// current when this call is made. A point lookup is the degenerate
    /// case `from = Included(k)`, `to = Excluded(k')` for the next key, or
    /// simply checking the first yielded item's key.
    pub fn seek(&self, root: Gsp, from: Bound<L::Key>, to: Bound<L::Key>) -> SeekIter<'a, L> {
        let read_generation = self.pager.generations().unstable();
        let reader = self.pager.generations().register_reader();
        let from_plain = match &from {
            Bound::Included(k) | Bound::Excluded(k) => {
                let mut buf = Vec::new();
                self.layout.encode_key(k, &mut buf);
                Some(buf)
            }
            Bound::Unbounded => None,
        };
        let from_exclusive = matches!(from, Bound::Excluded(_));
        let to_plain = match &to {
            Bound::Included(k) | Bound::Excluded(k) => {
                let mut buf = Vec::new();
                self.layout.encode_key(k, &mut buf);
                Some(buf)
            }
            Bound::Unbounded => None,
        };
        let to_inclusive = matches!(to, Bound::Included(_));

        SeekIter {
            pager: self.pager,
            body: self.body,
            offload: self.offload,
            layout: self.layout,
            root,
            read_generation,
            _reader: reader,
            lower: from_plain,
            lower_exclusive: from_exclusive,
            upper: to_plain,
            upper_inclusive: to_inclusive,
            current: None,
            done: false,
        }
    }

    /// Point lookup as a degenerate range: the single key `key`, or
    /// nothing if it isn't present.
    pub fn get(&self, root: Gsp, key: &L::Key) -> Result<Option<L::Value>> {
        let mut iter = self.seek(root, Bound::Included(key.clone()), Bound::Included(key.clone()));
        match iter.next() {
            Some(item) => Ok(Some(item?.1)),
            None => Ok(None),
        }
    }
}

enum ReadOutcome {
    /// A usable slot at `pos`, with the leaf's key count at read time.
    Item { pos: usize, count: u32 },
    /// The node at this generation no longer holds what we expected here -
    /// ask the caller to restart the descent.
    Restart,
}

/// A lazy, restartable sequence of `(key, value)` pairs in ascending key
/// order. Yields `Err` only for genuine corruption; a concurrent
/// structural change is invisible to the caller because the iterator
/// silently restarts and resumes from the last key it returned.
pub struct SeekIter<'a, L: Layout> {
    pager: &'a PagedFile,
    body: BodyLayout,
    offload: &'a OffloadStore,
    layout: &'a L,
    root: Gsp,
    read_generation: Generation,
    _reader: ReaderGuard<'a>,
    lower: Option<Vec<u8>>,
    lower_exclusive: bool,
    upper: Option<Vec<u8>>,
    upper_inclusive: bool,
    current: Option<(PageId, usize)>,
    done: bool,
}

impl<'a, L: Layout> SeekIter<'a, L> {
    fn compare_plain(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        let ka = self.layout.decode_key(a)?;
        let kb = self.layout.decode_key(b)?;
        Ok(self.layout.compare_keys(&ka, &kb))
    }

    fn resolve(&self, inline: &[u8], offloaded: bool) -> Result<Vec<u8>> {
        if offloaded {
            let id = PageId(read_u64(inline, 0));
            let validator = self.offload.high_water_validator();
            self.offload.read(id, &validator)
        } else {
            Ok(inline.to_vec())
        }
    }

    /// Read a node's header and body at `page_id`, retrying until a
    /// snapshot lands clean of a racing writer, and following a successor
    /// pointer if this generation's view of the page has already moved on.
    fn read_node(&self, mut page_id: PageId) -> Result<(NodeHeader, Vec<u8>)> {
        let mut hops = 0;
        loop {
            let cursor = self.pager.pin(page_id, Mode::Read)?;
            if cursor.should_retry() {
                continue;
            }
            let header = NodeHeader::decode(cursor.bytes())?;
            let successor = header.successor.read(self.read_generation);
            if !successor.is_no_node() {
                hops += 1;
                if hops > 64 {
                    return Err(crate::error::GbpError::corruption("successor chain did not terminate"));
                }
                page_id = successor;
                continue;
            }
            let body = cursor.bytes()[crate::node::HEADER_SIZE..].to_vec();
            return Ok((header, body));
        }
    }

    fn leaf_lower_bound(&self, body: &[u8], count: u32) -> Result<usize> {
        let Some(bound) = &self.lower else { return Ok(0) };
        let mut lo = 0usize;
        let mut hi = count as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let inline = self.body.key_at(body, count, mid)?;
            let offloaded = self.body.key_offloaded(body, count, mid)?;
            let stored = self.resolve(inline, offloaded)?;
            let cmp = self.compare_plain(&stored, bound)?;
            let too_small = match cmp {
                Ordering::Less => true,
                Ordering::Equal => self.lower_exclusive,
                Ordering::Greater => false,
            };
            if too_small {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn internal_descend_index(&self, body: &[u8], count: u32) -> Result<usize> {
        let Some(bound) = &self.lower else { return Ok(0) };
        let mut lo = 0usize;
        let mut hi = count as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let inline = self.body.internal_key_at(body, count, mid)?;
            let offloaded = self.body.internal_key_offloaded(body, count, mid)?;
            let stored = self.resolve(inline, offloaded)?;
            let cmp = self.compare_plain(&stored, bound)?;
            let goes_left = match cmp {
                Ordering::Greater => true,
                Ordering::Equal => !self.lower_exclusive,
                Ordering::Less => false,
            };
            if goes_left {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// Descend from the root to the leaf/position that should hold the
    /// next item, per the current lower bound.
    fn descend(&self) -> Result<Option<(PageId, usize)>> {
        let mut page_id = self.root.read(self.read_generation);
        if page_id.is_no_node() {
            return Ok(None);
        }
        loop {
            let (header, body) = self.read_node(page_id)?;
            if header.is_leaf() {
                let pos = self.leaf_lower_bound(&body, header.key_count)?;
                if (pos as u32) < header.key_count {
                    return Ok(Some((page_id, pos)));
                }
                let next = header.right_sibling.read(self.read_generation);
                if next.is_no_node() {
                    return Ok(None);
                }
                page_id = next;
                continue;
            }
            let idx = self.internal_descend_index(&body, header.key_count)?;
            let child = self.body.child_at(&body, header.key_count, idx)?.read(self.read_generation);
            if child.is_no_node() {
                return Ok(None);
            }
            page_id = child;
        }
    }

    fn above_upper(&self, key_plain: &[u8]) -> Result<bool> {
        let Some(bound) = &self.upper else { return Ok(false) };
        let cmp = self.compare_plain(key_plain, bound)?;
        Ok(match cmp {
            Ordering::Less => false,
            Ordering::Equal => !self.upper_inclusive,
            Ordering::Greater => true,
        })
    }

    fn read_slot(&self, leaf: PageId, pos: usize) -> Result<(ReadOutcome, Option<(Vec<u8>, Vec<u8>)>)> {
        let cursor = self.pager.pin(leaf, Mode::Read)?;
        if cursor.should_retry() {
            return Ok((ReadOutcome::Restart, None));
        }
        let header = match NodeHeader::decode(cursor.bytes()) {
            Ok(h) => h,
            Err(_) => return Ok((ReadOutcome::Restart, None)),
        };
        if !header.is_leaf() || pos as u32 >= header.key_count {
            return Ok((ReadOutcome::Restart, None));
        }
        let body = &cursor.bytes()[crate::node::HEADER_SIZE..];
        let key_inline = self.body.key_at(body, header.key_count, pos)?.to_vec();
        let key_off = self.body.key_offloaded(body, header.key_count, pos)?;
        let value_inline = self.body.value_at(body, header.key_count, pos)?.to_vec();
        let value_off = self.body.value_offloaded(body, header.key_count, pos)?;
        let count = header.key_count;
        drop(cursor);
        let key_plain = self.resolve(&key_inline, key_off)?;
        let value_plain = self.resolve(&value_inline, value_off)?;
        Ok((ReadOutcome::Item { pos, count }, Some((key_plain, value_plain))))
    }

    fn advance_after(&mut self, leaf: PageId, pos: usize, count: u32) -> Result<()> {
        if (pos + 1) < count as usize {
            self.current = Some((leaf, pos + 1));
            return Ok(());
        }
        let (header, _) = self.read_node(leaf)?;
        let next = header.right_sibling.read(self.read_generation);
        if next.is_no_node() {
            self.current = None;
            self.done = true;
        } else {
            self.current = Some((next, 0));
        }
        Ok(())
    }
}

impl<'a, L: Layout> Iterator for SeekIter<'a, L> {
    type Item = Result<(L::Key, L::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.current.is_none() {
                match self.descend() {
                    Ok(Some(pos)) => self.current = Some(pos),
                    Ok(None) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            let (leaf, pos) = self.current.unwrap();
            match self.read_slot(leaf, pos) {
                Ok((ReadOutcome::Restart, _)) => {
                    self.current = None;
                    continue;
                }
                Ok((ReadOutcome::Item { pos, count }, Some((key_plain, value_plain)))) => {
                    match self.above_upper(&key_plain) {
                        Ok(true) => {
                            self.done = true;
                            return None;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                    self.lower = Some(key_plain.clone());
                    self.lower_exclusive = true;
                    if let Err(e) = self.advance_after(leaf, pos, count) {
                        self.done = true;
                        return Some(Err(e));
                    }
                    let key = match self.layout.decode_key(&key_plain) {
                        Ok(k) => k,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    };
                    let value = match self.layout.decode_value(&value_plain) {
                        Ok(v) => v,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    };
                    return Some(Ok((key, value)));
                }
                Ok((ReadOutcome::Item { .. }, None)) => unreachable!("Item outcome always carries a payload"),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::U64Layout;
    use crate::node::fixed::FixedGeometry;
    use crate::writer::Writer;
    use tempfile::tempdir;

    fn u64_writer(pager: &PagedFile, offload: &OffloadStore, layout: &U64Layout) -> Writer<'_, U64Layout> {
        Writer::new(pager, BodyLayout::Fixed(FixedGeometry { key_size: 8, value_size: 8 }), offload, layout, Generation(1))
    }

    #[test]
    fn seeks_full_range_in_ascending_order() {
        let dir = tempdir().unwrap();
        let pager = PagedFile::create(dir.path().join("t.db"), 256).unwrap();
        let offload = OffloadStore::new(pager.clone());
        let layout = U64Layout;
        let writer = u64_writer(&pager, &offload, &layout);

        let mut root = Gsp::empty();
        for k in (0..100u64).rev() {
            root = writer.put(root, &k, &(k * 2)).unwrap();
        }

        let body = BodyLayout::Fixed(FixedGeometry { key_size: 8, value_size: 8 });
        let seeker = Seeker::new(&pager, body, &offload, &layout);
        let items: Vec<(u64, u64)> =
            seeker.seek(root, Bound::Unbounded, Bound::Unbounded).map(|r| r.unwrap()).collect();

        assert_eq!(items.len(), 100);
        for (i, (k, v)) in items.iter().enumerate() {
            assert_eq!(*k, i as u64);
            assert_eq!(*v, i as u64 * 2);
        }
    }

    #[test]
    fn seeks_bounded_range() {
        let dir = tempdir().unwrap();
        let pager = PagedFile::create(dir.path().join("t.db"), 256).unwrap();
        let offload = OffloadStore::new(pager.clone());
        let layout = U64Layout;
        let writer = u64_writer(&pager, &offload, &layout);

        let mut root = Gsp::empty();
        for k in 0..50u64 {
            root = writer.put(root, &k, &k).unwrap();
        }

        let body = BodyLayout::Fixed(FixedGeometry { key_size: 8, value_size: 8 });
        let seeker = Seeker::new(&pager, body, &offload, &layout);
        let items: Vec<(u64, u64)> =
            seeker.seek(root, Bound::Included(10), Bound::Excluded(15)).map(|r| r.unwrap()).collect();
        assert_eq!(items, vec![(10, 10), (11, 11), (12, 12), (13, 13), (14, 14)]);
    }

    #[test]
    fn point_lookup_via_get() {
        let dir = tempdir().unwrap();
        let pager = PagedFile::create(dir.path().join("t.db"), 4096).unwrap();
        let offload = OffloadStore::new(pager.clone());
        let layout = U64Layout;
        let writer = u64_writer(&pager, &offload, &layout);
        let root = writer.put(Gsp::empty(), &7u64, &70u64).unwrap();

        let body = BodyLayout::Fixed(FixedGeometry { key_size: 8, value_size: 8 });
        let seeker = Seeker::new(&pager, body, &offload, &layout);
        assert_eq!(seeker.get(root, &7u64).unwrap(), Some(70u64));
        assert_eq!(seeker.get(root, &8u64).unwrap(), None);
    }

    #[test]
    fn seek_survives_a_split_happening_between_items() {
        let dir = tempdir().unwrap();
        let pager = PagedFile::create(dir.path().join("t.db"), 256).unwrap();
        let offload = OffloadStore::new(pager.clone());
        let layout = U64Layout;
        let writer = u64_writer(&pager, &offload, &layout);

        let mut root = Gsp::empty();
        for k in 0..20u64 {
            root = writer.put(root, &k, &k).unwrap();
        }

        let body = BodyLayout::Fixed(FixedGeometry { key_size: 8, value_size: 8 });
        let seeker = Seeker::new(&pager, body, &offload, &layout);
        let mut iter = seeker.seek(root, Bound::Unbounded, Bound::Unbounded);
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first, (0, 0));

        // Simulate more writes racing the still-open seek.
        for k in 20..200u64 {
            root = writer.put(root, &k, &k).unwrap();
        }

        let rest: Vec<(u64, u64)> = iter.map(|r| r.unwrap()).collect();
        assert_eq!(rest.len(), 19, "seek stays pinned to its own generation's view of the tree");
        assert_eq!(rest[0], (1, 1));
        assert_eq!(*rest.last().unwrap(), (19, 19));
    }
}
