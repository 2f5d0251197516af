#![forbid(unsafe_code)]

//! Recovery on open (§4.9): decide whether the last shutdown was clean,
//! locate the latest valid checkpoint if it wasn't, and repair any GSP
//! slot a crash left half-published - a write whose generation is newer
//! than `stable` but that was never confirmed durable by a checkpoint.
//!
//! Because the core tree's log carries only [`crate::log::DetachedCheckpoint`]
//! markers (see [`crate::log`]), there is nothing to redo: every node write
//! lands on a fresh copy-on-write page, so a crash simply means some pages
//! hold generations past `stable` that no checkpoint ever blessed. Recovery
//! zeroes those slots so a reader can never follow one, then lets the
//! ordinary ID allocator reclaim the orphaned pages.

use std::sync::Arc;

use crate::contracts::{Monitor, RecoveryCleanupWorkCollector};
use crate::error::Result;
use crate::log::{DetachedCheckpoint, TransactionLog};
use crate::node::{BodyLayout, NodeHeader};
use crate::pager::cursor::Mode;
use crate::pager::PagedFile;
use crate::types::{Generation, PageId};

/// Bounds how much of the page space recovery cleanup is willing to scan,
/// trading a faster open against a smaller guaranteed-clean range.
#[derive(Clone, Copy, Debug)]
pub enum RecoveryPredicate {
    /// Scan every live page below the allocator's high-water mark.
    All,
    /// Scan only page IDs below `limit`.
    Bounded { limit: u64 },
}

impl RecoveryPredicate {
    fn admits(&self, page: PageId) -> bool {
        match self {
            RecoveryPredicate::All => true,
            RecoveryPredicate::Bounded { limit } => page.0 < *limit,
        }
    }
}

/// Walk the log once and keep the last record that decoded cleanly.
/// [`TransactionLog::iter`] already stops at the first corrupt or
/// truncated frame, so whatever survives to the end is the latest durable
/// checkpoint.
pub fn latest_checkpoint(log: &TransactionLog) -> Result<Option<DetachedCheckpoint>> {
    Ok(log.iter()?.last())
}

/// `true` when the metadata page recorded a generation past the last
/// checkpoint - writes happened that the checkpoint never blessed, so the
/// shutdown that followed was not clean and cleanup must run.
pub fn needs_cleanup(meta_unstable: Generation, last_checkpoint: Option<&DetachedCheckpoint>) -> bool {
    match last_checkpoint {
        Some(checkpoint) => meta_unstable > checkpoint.unstable_generation,
        None => meta_unstable.0 > Generation::MIN_GEN.0 + 1,
    }
}

/// Scan every live node page for GSP slots a crash left past `stable`, and
/// hand each repair to the collector as an independent job so it can run
/// immediately or in the background per the collector's own policy.
///
/// Returns once every job has been *submitted* - with [`crate::contracts::ImmediateCollector`]
/// that also means every repair has completed; with a deferred collector
/// the caller must not treat page IDs in the affected range as reusable
/// until the jobs finish.
pub fn scan_and_repair(
    pager: Arc<PagedFile>,
    body: BodyLayout,
    high_water: u64,
    stable: Generation,
    predicate: RecoveryPredicate,
    collector: &dyn RecoveryCleanupWorkCollector,
    monitor: &dyn Monitor,
) -> Result<u64> {
    monitor.cleanup_started(Some(high_water as usize));
    let mut scanned = 0u64;
    let mut queued = 0u64;

    for raw in crate::pager::FIRST_DATA_PAGE..high_water {
        let page_id = PageId(raw);
        if !predicate.admits(page_id) {
            continue;
        }
        scanned += 1;

        let header = {
            let cursor = match pager.pin(page_id, Mode::Read) {
                Ok(c) => c,
                Err(_) => continue,
            };
            match NodeHeader::decode(cursor.bytes()) {
                Ok(h) => h,
                Err(_) => continue,
            }
        };

        if !page_needs_repair(&header, &body, &pager, page_id, stable)? {
            continue;
        }
        queued += 1;
        monitor.cleanup_progress(scanned, queued);

        let pager = Arc::clone(&pager);
        let body = body;
        collector.submit(Box::new(move || {
            if let Err(err) = repair_page(&pager, &body, page_id, stable) {
                tracing::warn!(page = page_id.0, error = %err, "recovery cleanup failed to repair page");
            }
        }));
    }

    monitor.cleanup_completed(queued);
    Ok(queued)
}

fn page_needs_repair(
    header: &NodeHeader,
    body: &BodyLayout,
    pager: &PagedFile,
    page_id: PageId,
    stable: Generation,
) -> Result<bool> {
    if header.left_sibling.newest_generation() > stable
        || header.right_sibling.newest_generation() > stable
        || header.successor.newest_generation() > stable
    {
        return Ok(true);
    }
    if header.kind == crate::node::NodeKind::Internal {
        let cursor = pager.pin(page_id, Mode::Read)?;
        let buf = cursor.bytes();
        let count = header.key_count;
        for i in 0..=count as usize {
            let child = body.child_at(&buf[crate::node::HEADER_SIZE..], count, i)?;
            if child.newest_generation() > stable {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn repair_page(pager: &PagedFile, body: &BodyLayout, page_id: PageId, stable: Generation) -> Result<()> {
    let mut cursor = pager.pin(page_id, Mode::Write)?;
    let buf = cursor.bytes_mut();
    let mut header = NodeHeader::decode(buf)?;
    header.left_sibling = header.left_sibling.prune_above(stable);
    header.right_sibling = header.right_sibling.prune_above(stable);
    header.successor = header.successor.prune_above(stable);
    let count = header.key_count;
    header.encode(buf);

    if header.kind == crate::node::NodeKind::Internal {
        for i in 0..=count as usize {
            let child = body.child_at(&buf[crate::node::HEADER_SIZE..], count, i)?;
            let pruned = child.prune_above(stable);
            if pruned != child {
                let (_, body_buf) = buf.split_at_mut(crate::node::HEADER_SIZE);
                body.set_child_at(body_buf, count, i, pruned)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogPosition;
    use crate::pager::io::StdFileIo;
    use crate::types::PageId;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample_checkpoint(unstable: Generation) -> DetachedCheckpoint {
        DetachedCheckpoint {
            kernel_version: 1,
            position: LogPosition { version: 1, offset: 0 },
            timestamp_millis: 0,
            store_id: 1,
            transaction_id: 1,
            transaction_checksum: 0,
            commit_timestamp: 0,
            root: PageId(1),
            stable_generation: Generation(unstable.0 - 1),
            unstable_generation: unstable,
            reason: "periodic".into(),
        }
    }

    #[test]
    fn latest_checkpoint_returns_last_well_formed_record() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("log")).unwrap();
        let log = TransactionLog::open(Arc::new(io), 1).unwrap();
        log.append_checkpoint(&sample_checkpoint(Generation(2))).unwrap();
        log.append_checkpoint(&sample_checkpoint(Generation(4))).unwrap();

        let found = latest_checkpoint(&log).unwrap().unwrap();
        assert_eq!(found.unstable_generation, Generation(4));
    }

    #[test]
    fn needs_cleanup_compares_metadata_against_last_checkpoint() {
        let checkpoint = sample_checkpoint(Generation(4));
        assert!(!needs_cleanup(Generation(4), Some(&checkpoint)));
        assert!(needs_cleanup(Generation(5), Some(&checkpoint)));
        assert!(!needs_cleanup(Generation(2), None));
    }

    #[test]
    fn scan_and_repair_clears_sibling_gsp_past_stable() {
        let dir = tempdir().unwrap();
        let pager = Arc::new(PagedFile::create(dir.path().join("t.db"), 4096).unwrap());
        let page = pager.allocate_page().unwrap();
        {
            let mut cursor = pager.pin(page, Mode::Write).unwrap();
            let mut header = NodeHeader::new_leaf(crate::node::LayerFlag::Data, Generation(1));
            header.right_sibling = header.right_sibling.write(PageId(9), Generation(7));
            header.encode(cursor.bytes_mut());
        }

        let collector = crate::contracts::ImmediateCollector;
        let monitor = crate::contracts::TracingMonitor;
        let queued = scan_and_repair(
            Arc::clone(&pager),
            BodyLayout::Dynamic,
            pager.ids().high_water(),
            Generation(3),
            RecoveryPredicate::All,
            &collector,
            &monitor,
        )
        .unwrap();
        assert_eq!(queued, 1);

        let cursor = pager.pin(page, Mode::Read).unwrap();
        let header = NodeHeader::decode(cursor.bytes()).unwrap();
        assert_eq!(header.right_sibling.read(Generation(10)), PageId::NO_NODE);
    }
}
