#![forbid(unsafe_code)]

//! The multi-root variant (§4.10): one paged file backing many independent
//! data trees, indexed by a secondary key (an index identity, say). The
//! root layer is itself an ordinary GBPTree - its node headers carry the
//! `Root` layer flag rather than `Data` - whose values are the GSP pair
//! for one data tree's root, rather than a caller key/value pair. Looking
//! up a root, descending into its data tree, and writing the (possibly
//! new) root back is one write-locked operation, so concurrent `put`s
//! against different secondary keys still serialize - the core tree has a
//! single writer lock, and a multi-root tree reuses the same one across
//! every root it holds.
//!
//! Checkpoints are global (§4.10): a single [`TransactionLog`] and a
//! single stable/unstable generation pair cover the root layer and every
//! data tree underneath it, so one checkpoint call makes all of them
//! durable together.

use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::checkpoint::{CheckpointClock, CheckpointReport, CheckpointThreshold};
use crate::contracts::{Monitor, RecoveryCleanupWorkCollector};
use crate::error::{GbpError, Result};
use crate::header::MetadataPage;
use crate::layout::{Layout, SizeClass};
use crate::log::{DetachedCheckpoint, LogPosition, TransactionLog};
use crate::node::{minimum_page_size, BodyLayout};
use crate::offload::OffloadStore;
use crate::pager::cursor::Mode;
use crate::pager::gsp::{Gsp, GSP_SIZE};
use crate::pager::io::StdFileIo;
use crate::pager::PagedFile;
use crate::recovery::{self, RecoveryPredicate};
use crate::seeker::{SeekIter, Seeker};
use crate::tree::{body_layout_for, log_path, now_millis, Options, KERNEL_VERSION};
use crate::types::PageId;
use crate::writer::Writer;

/// What a secondary key (the root layer's key) needs to support: ordering
/// plus the same encode/decode/sizing contract [`Layout`] asks of a data
/// key. Kept separate from `Layout` because the root layer's *value* type
/// is fixed by this module ([`RootPointer`]), not injectable.
pub trait RootKey: Clone + fmt::Debug + Send + Sync + 'static {
    fn compare(&self, other: &Self) -> Ordering;
    fn encode(&self, out: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
    fn size_class() -> SizeClass;
}

impl RootKey for u64 {
    fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 8 {
            return Err(GbpError::corruption("root key length mismatch"));
        }
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    fn size_class() -> SizeClass {
        SizeClass::Fixed { size: 8 }
    }
}

impl RootKey for Vec<u8> {
    fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }

    fn size_class() -> SizeClass {
        SizeClass::Variable { max_inline: 128 }
    }
}

/// The root layer's value: the GSP pair naming one data tree's current
/// root page. Round-trips through a fixed 40-byte slot regardless of `K`,
/// so the root layer always picks the fixed-size body for its value half
/// (it still goes through [`BodyLayout::Dynamic`] whenever `K` is
/// variable-length, same as any other layout with a mixed key/value size).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RootPointer(pub Gsp);

impl RootPointer {
    fn empty() -> Self {
        RootPointer(Gsp::empty())
    }
}

/// [`Layout`] for the root layer: keys are the caller's secondary key
/// type, values are always a [`RootPointer`]. Nothing outside this module
/// ever opens a tree with this layout directly.
struct RootLayerLayout<K: RootKey>(PhantomData<K>);

impl<K: RootKey> RootLayerLayout<K> {
    fn new() -> Self {
        Self(PhantomData)
    }
}

impl<K: RootKey> Layout for RootLayerLayout<K> {
    type Key = K;
    type Value = RootPointer;

    fn compare_keys(&self, a: &Self::Key, b: &Self::Key) -> Ordering {
        a.compare(b)
    }

    fn compare_values(&self, a: &Self::Value, b: &Self::Value) -> Ordering {
        a.0.newest_generation().cmp(&b.0.newest_generation())
    }

    fn encode_key(&self, key: &Self::Key, out: &mut Vec<u8>) {
        key.encode(out)
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<Self::Key> {
        K::decode(bytes)
    }

    fn encode_value(&self, value: &Self::Value, out: &mut Vec<u8>) {
        let mut buf = [0u8; GSP_SIZE];
        value.0.encode(&mut buf);
        out.extend_from_slice(&buf);
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Self::Value> {
        Ok(RootPointer(Gsp::decode(bytes)?))
    }

    fn key_size_class(&self) -> SizeClass {
        K::size_class()
    }

    fn value_size_class(&self) -> SizeClass {
        SizeClass::Fixed { size: GSP_SIZE }
    }
}

/// Many independent data trees, each keyed by a secondary key `K`, sharing
/// one paged file, one transaction log, and one generation pair. `L` is
/// the data-layer [`Layout`] every root's tree is opened with; `K` is the
/// root layer's own key type (see [`RootKey`]).
pub struct MultiRootTree<K: RootKey, L: Layout> {
    pager: PagedFile,
    root_body: BodyLayout,
    data_body: BodyLayout,
    offload: OffloadStore,
    log: TransactionLog,
    root_layout: RootLayerLayout<K>,
    data_layout: L,
    meta_root: RwLock<Gsp>,
    write_lock: Mutex<()>,
    clock: CheckpointClock,
    threshold: Box<dyn CheckpointThreshold>,
    monitor: Arc<dyn Monitor>,
    cleanup_collector: Box<dyn RecoveryCleanupWorkCollector>,
    recovery_predicate: RecoveryPredicate,
    store_id: u64,
    next_tx: AtomicU64,
    poisoned: Mutex<Option<String>>,
    user_header: RwLock<Vec<u8>>,
}

impl<K: RootKey, L: Layout> MultiRootTree<K, L> {
    pub fn create(path: impl AsRef<Path>, data_layout: L, options: Options) -> Result<Self> {
        let path = path.as_ref();
        options.monitor.open_started(&path.display().to_string());

        let root_layout = RootLayerLayout::<K>::new();
        let minimum = minimum_page_size(
            root_layout.key_size_class().max_inline().max(data_layout.key_size_class().max_inline()),
            root_layout.value_size_class().max_inline().max(data_layout.value_size_class().max_inline()),
        );
        if options.page_size < minimum {
            return Err(GbpError::InvalidArgument(format!(
                "page size {} is smaller than the minimum {minimum} bytes this layout needs",
                options.page_size
            )));
        }

        let pager = PagedFile::create(path, options.page_size)?.with_cache_size(options.cache_size)?;
        let store_id = rand::random::<u64>();
        {
            let mut cursor = pager.pin(PageId::METADATA, Mode::Write)?;
            let mut meta = MetadataPage::fresh(options.page_size as u32);
            meta.user_header = options.user_header.clone();
            meta.encode(cursor.bytes_mut())?;
        }
        pager.flush_dirty()?;
        pager.sync()?;

        let log = TransactionLog::open(Arc::new(StdFileIo::open(log_path(path))?), 1)?;

        let tree = Self {
            root_body: body_layout_for(&root_layout),
            data_body: body_layout_for(&data_layout),
            offload: OffloadStore::new(pager.clone()),
            pager,
            log,
            root_layout,
            data_layout,
            meta_root: RwLock::new(Gsp::empty()),
            write_lock: Mutex::new(()),
            clock: CheckpointClock::default(),
            threshold: options.checkpoint_threshold,
            monitor: options.monitor,
            cleanup_collector: options.cleanup_collector,
            recovery_predicate: options.recovery_predicate,
            store_id,
            next_tx: AtomicU64::new(1),
            poisoned: Mutex::new(None),
            user_header: RwLock::new(options.user_header),
        };
        tree.monitor.open_completed();
        Ok(tree)
    }

    pub fn open(path: impl AsRef<Path>, data_layout: L, options: Options) -> Result<Self> {
        let path = path.as_ref();
        options.monitor.open_started(&path.display().to_string());

        let root_layout = RootLayerLayout::<K>::new();
        let pager = if options.read_only {
            PagedFile::open_read_only(path, options.page_size)?
        } else {
            PagedFile::open(path, options.page_size)?
        }
        .with_cache_size(options.cache_size)?;

        let metadata = {
            let cursor = pager.pin(PageId::METADATA, Mode::Read)?;
            MetadataPage::decode(cursor.bytes())?
        };
        if metadata.page_size as usize != options.page_size {
            return Err(GbpError::InvalidArgument(format!(
                "tree was created with page size {} but opened with {}",
                metadata.page_size, options.page_size
            )));
        }
        pager.restore_generations(metadata.stable, metadata.unstable);

        let log = TransactionLog::open(Arc::new(StdFileIo::open(log_path(path))?), 1)?;
        let last_checkpoint = recovery::latest_checkpoint(&log)?;

        let root_body = body_layout_for(&root_layout);
        let data_body = body_layout_for(&data_layout);
        if !options.read_only && recovery::needs_cleanup(metadata.unstable, last_checkpoint.as_ref()) {
            // The same crash-pointer cleanup covers both layers: every GSP
            // in the file - root-layer sibling/successor/child pointers,
            // each data tree's own - lives in a node page tagged with the
            // same header recovery already knows how to scan.
            recovery::scan_and_repair(
                Arc::new(pager.clone()),
                data_body,
                pager.ids().high_water(),
                metadata.stable,
                options.recovery_predicate,
                options.cleanup_collector.as_ref(),
                options.monitor.as_ref(),
            )?;
        }

        let next_tx = last_checkpoint.as_ref().map(|c| c.transaction_id + 1).unwrap_or(1);
        let store_id = last_checkpoint.as_ref().map(|c| c.store_id).unwrap_or_else(rand::random);

        let tree = Self {
            root_body,
            data_body,
            offload: OffloadStore::new(pager.clone()),
            pager,
            log,
            root_layout,
            data_layout,
            meta_root: RwLock::new(metadata.root),
            write_lock: Mutex::new(()),
            clock: CheckpointClock::default(),
            threshold: options.checkpoint_threshold,
            monitor: options.monitor,
            cleanup_collector: options.cleanup_collector,
            recovery_predicate: options.recovery_predicate,
            store_id,
            next_tx: AtomicU64::new(next_tx),
            poisoned: Mutex::new(None),
            user_header: RwLock::new(metadata.user_header),
        };
        tree.monitor.open_completed();
        Ok(tree)
    }

    fn check_poison(&self) -> Result<()> {
        if let Some(msg) = self.poisoned.lock().clone() {
            return Err(GbpError::Corruption(msg));
        }
        Ok(())
    }

    fn poison(&self, err: GbpError) -> GbpError {
        let err = err.log_if_fatal();
        if matches!(err, GbpError::Corruption(_) | GbpError::FormatMismatch { .. }) {
            *self.poisoned.lock() = Some(err.to_string());
        }
        err
    }

    fn guard<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.check_poison()?;
        f().map_err(|e| self.poison(e))
    }

    fn root_seeker(&self) -> Seeker<'_, RootLayerLayout<K>> {
        Seeker::new(&self.pager, self.root_body, &self.offload, &self.root_layout)
    }

    fn data_seeker(&self) -> Seeker<'_, L> {
        Seeker::new(&self.pager, self.data_body, &self.offload, &self.data_layout)
    }

    /// The data root currently published for `root_key`, or an empty GSP
    /// if that secondary key has never been written.
    fn data_root(&self, meta_root: Gsp, root_key: &K) -> Result<Gsp> {
        Ok(self.root_seeker().get(meta_root, root_key)?.map(|p| p.0).unwrap_or_else(Gsp::empty))
    }

    /// Insert or overwrite `key` within the data tree for `root_key`,
    /// creating that root's tree on first use.
    pub fn put(&self, root_key: &K, key: &L::Key, value: &L::Value) -> Result<()> {
        self.guard(|| {
            let Some(_permit) = self.write_lock.try_lock() else {
                return Err(GbpError::Conflict);
            };
            let unstable = self.pager.generations().unstable();
            let mut meta_root = self.meta_root.write();

            let data_root = self.data_root(*meta_root, root_key)?;
            let data_writer = Writer::new(&self.pager, self.data_body, &self.offload, &self.data_layout, unstable);
            let new_data_root = data_writer.put(data_root, key, value)?;

            let root_writer = Writer::new(&self.pager, self.root_body, &self.offload, &self.root_layout, unstable);
            *meta_root = root_writer.put(*meta_root, root_key, &RootPointer(new_data_root))?;
            drop(meta_root);

            self.next_tx.fetch_add(1, AtomicOrdering::AcqRel);
            self.clock.record_write(1);
            self.maybe_checkpoint_locked()?;
            Ok(())
        })
    }

    /// Remove `key` from `root_key`'s data tree. Once that tree empties
    /// out, its entry is dropped from the root layer entirely rather than
    /// left pointing at an empty root.
    pub fn remove(&self, root_key: &K, key: &L::Key) -> Result<Option<L::Value>> {
        self.guard(|| {
            let Some(_permit) = self.write_lock.try_lock() else {
                return Err(GbpError::Conflict);
            };
            let unstable = self.pager.generations().unstable();
            let mut meta_root = self.meta_root.write();

            let data_root = self.data_root(*meta_root, root_key)?;
            let data_writer = Writer::new(&self.pager, self.data_body, &self.offload, &self.data_layout, unstable);
            let (new_data_root, removed) = data_writer.remove(data_root, key)?;

            let root_writer = Writer::new(&self.pager, self.root_body, &self.offload, &self.root_layout, unstable);
            *meta_root = if new_data_root.read(unstable).is_no_node() {
                root_writer.remove(*meta_root, root_key)?.0
            } else {
                root_writer.put(*meta_root, root_key, &RootPointer(new_data_root))?
            };
            drop(meta_root);

            self.next_tx.fetch_add(1, AtomicOrdering::AcqRel);
            self.maybe_checkpoint_locked()?;
            Ok(removed)
        })
    }

    /// Point lookup within `root_key`'s data tree.
    pub fn get(&self, root_key: &K, key: &L::Key) -> Result<Option<L::Value>> {
        self.guard(|| {
            let meta_root = *self.meta_root.read();
            let data_root = self.data_root(meta_root, root_key)?;
            self.data_seeker().get(data_root, key)
        })
    }

    /// Half-open range `[from, to)` within `root_key`'s data tree. Returns
    /// an empty iterator if `root_key` has no tree yet.
    pub fn seek(&self, root_key: &K, from: Bound<L::Key>, to: Bound<L::Key>) -> Result<SeekIter<'_, L>> {
        self.check_poison()?;
        let meta_root = *self.meta_root.read();
        let data_root = self.data_root(meta_root, root_key)?;
        Ok(self.data_seeker().seek(data_root, from, to))
    }

    /// Every secondary key currently holding a non-empty data tree, in key
    /// order - the root layer's own full scan.
    pub fn roots(&self) -> Result<Vec<K>> {
        self.guard(|| {
            let meta_root = *self.meta_root.read();
            let mut out = Vec::new();
            for item in self.root_seeker().seek(meta_root, Bound::Unbounded, Bound::Unbounded) {
                out.push(item?.0);
            }
            Ok(out)
        })
    }

    fn maybe_checkpoint_locked(&self) -> Result<()> {
        let stats = self.clock.stats();
        if self.threshold.should_checkpoint(&stats) {
            self.run_checkpoint("threshold")?;
        }
        Ok(())
    }

    /// Force a checkpoint: flushes every dirty page across every root's
    /// tree and the root layer together, then advances the single shared
    /// generation pair (§4.10: "checkpoints are global").
    pub fn checkpoint(&self, reason: &str) -> Result<CheckpointReport> {
        self.guard(|| {
            let _permit = self.write_lock.lock();
            self.run_checkpoint(reason)
        })
    }

    fn run_checkpoint(&self, reason: &str) -> Result<CheckpointReport> {
        let started = std::time::Instant::now();
        self.monitor.checkpoint_started(reason);

        self.pager.flush_dirty()?;
        self.pager.sync()?;

        let (stable, unstable) = self.pager.generations().advance()?;
        let meta_root = *self.meta_root.read();

        {
            let mut cursor = self.pager.pin(PageId::METADATA, Mode::Write)?;
            let mut meta = MetadataPage::fresh(self.pager.page_size() as u32);
            meta.root = meta_root;
            meta.stable = stable;
            meta.unstable = unstable;
            meta.last_committed_tx = crate::types::Lsn(self.next_tx.load(AtomicOrdering::Acquire).saturating_sub(1));
            meta.user_header = self.user_header.read().clone();
            meta.encode(cursor.bytes_mut())?;
        }
        self.pager.flush_dirty()?;
        self.pager.sync()?;

        let root_page = meta_root.read(unstable);
        let transaction_checksum = if root_page.is_no_node() {
            0
        } else {
            let cursor = self.pager.pin(root_page, Mode::Read)?;
            crate::checksum::page_crc32(root_page.0, unstable.0, cursor.bytes()) as u64
        };

        let record = DetachedCheckpoint {
            kernel_version: KERNEL_VERSION,
            position: LogPosition { version: self.log.file_version(), offset: 0 },
            timestamp_millis: now_millis(),
            store_id: self.store_id,
            transaction_id: self.next_tx.load(AtomicOrdering::Acquire).saturating_sub(1),
            transaction_checksum,
            commit_timestamp: now_millis(),
            root: root_page,
            stable_generation: stable,
            unstable_generation: unstable,
            reason: reason.to_string(),
        };
        self.log.append_checkpoint(&record)?;
        self.log.sync()?;

        self.clock.reset();
        self.monitor.checkpoint_completed(stable.0);
        info!(roots = "shared", stable = stable.0, "multi-root checkpoint completed");

        Ok(CheckpointReport { stable_generation: stable, unstable_generation: unstable, root: meta_root.read(unstable), duration: started.elapsed() })
    }

    pub fn close(&self) -> Result<()> {
        self.guard(|| {
            let _permit = self.write_lock.lock();
            self.run_checkpoint("shutdown")?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::U64Layout;
    use tempfile::tempdir;

    fn multiroot(path: &Path) -> MultiRootTree<u64, U64Layout> {
        MultiRootTree::create(path, U64Layout, Options { page_size: 4096, ..Options::default() }).unwrap()
    }

    #[test]
    fn independent_roots_do_not_see_each_others_keys() {
        let dir = tempdir().unwrap();
        let tree = multiroot(&dir.path().join("t.db"));
        tree.put(&1u64, &10u64, &100u64).unwrap();
        tree.put(&2u64, &10u64, &200u64).unwrap();

        assert_eq!(tree.get(&1u64, &10u64).unwrap(), Some(100));
        assert_eq!(tree.get(&2u64, &10u64).unwrap(), Some(200));
        assert_eq!(tree.get(&3u64, &10u64).unwrap(), None);
    }

    #[test]
    fn removing_the_last_key_drops_the_root_entirely() {
        let dir = tempdir().unwrap();
        let tree = multiroot(&dir.path().join("t.db"));
        tree.put(&1u64, &5u64, &50u64).unwrap();
        assert_eq!(tree.roots().unwrap(), vec![1u64]);

        tree.remove(&1u64, &5u64).unwrap();
        assert_eq!(tree.roots().unwrap(), Vec::<u64>::new());
        assert_eq!(tree.get(&1u64, &5u64).unwrap(), None);
    }

    #[test]
    fn checkpoint_survives_reopen_across_all_roots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let tree = multiroot(&path);
            for root in 0..5u64 {
                for k in 0..20u64 {
                    tree.put(&root, &k, &(root * 1000 + k)).unwrap();
                }
            }
            tree.checkpoint("test").unwrap();
        }
        let reopened = MultiRootTree::open(&path, U64Layout, Options { page_size: 4096, ..Options::default() }).unwrap();
        for root in 0..5u64 {
            assert_eq!(reopened.get(&root, &7u64).unwrap(), Some(root * 1000 + 7));
        }
    }

    #[test]
    fn seek_is_scoped_to_its_own_root() {
        let dir = tempdir().unwrap();
        let tree = multiroot(&dir.path().join("t.db"));
        for k in 0..10u64 {
            tree.put(&1u64, &k, &k).unwrap();
        }
        tree.put(&2u64, &0u64, &999u64).unwrap();

        let collected: Vec<u64> =
            tree.seek(&1u64, Bound::Unbounded, Bound::Unbounded).unwrap().map(|r| r.unwrap().0).collect();
        assert_eq!(collected, (0..10).collect::<Vec<_>>());
    }
}
