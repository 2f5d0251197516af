#![forbid(unsafe_code)]

//! The small collaborator contracts §6 says the engine consumes rather
//! than owns: a monitor sink for progress events, a read-only gate, and a
//! work collector the recovery cleanup scan hands its jobs to. None of
//! these carry tree-specific logic - they're the seams a host application
//! plugs into.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::types::PageId;

/// Receives progress events for checkpointing, cleanup, and open. The
/// default implementation just logs at `info`/`debug`; a host embedding
/// the tree can swap in a metrics-reporting implementation.
pub trait Monitor: Send + Sync {
    fn checkpoint_started(&self, _reason: &str) {}
    fn checkpoint_completed(&self, _stable_generation: u64) {}
    fn cleanup_started(&self, _crashed_pointers_hint: Option<usize>) {}
    fn cleanup_progress(&self, _pages_scanned: u64, _pointers_cleaned: u64) {}
    fn cleanup_completed(&self, _pointers_cleaned: u64) {}
    fn open_started(&self, _path: &str) {}
    fn open_completed(&self) {}
}

#[derive(Default)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn checkpoint_started(&self, reason: &str) {
        info!(reason, "checkpoint started");
    }

    fn checkpoint_completed(&self, stable_generation: u64) {
        info!(stable_generation, "checkpoint completed");
    }

    fn cleanup_started(&self, crashed_pointers_hint: Option<usize>) {
        info!(?crashed_pointers_hint, "recovery cleanup started");
    }

    fn cleanup_progress(&self, pages_scanned: u64, pointers_cleaned: u64) {
        info!(pages_scanned, pointers_cleaned, "recovery cleanup progress");
    }

    fn cleanup_completed(&self, pointers_cleaned: u64) {
        info!(pointers_cleaned, "recovery cleanup completed");
    }

    fn open_started(&self, path: &str) {
        info!(path, "opening tree");
    }

    fn open_completed(&self) {
        info!("tree open completed");
    }
}

/// Whether the store is read-only *right now*. A trait rather than a bare
/// bool so a host can flip it at runtime (e.g. during a hot backup) and
/// have every writer see the change immediately.
pub trait ReadOnlyChecker: Send + Sync {
    fn is_read_only(&self) -> bool;
}

pub struct StaticReadOnly(pub bool);

impl ReadOnlyChecker for StaticReadOnly {
    fn is_read_only(&self) -> bool {
        self.0
    }
}

#[derive(Default)]
pub struct AtomicReadOnly(AtomicBool);

impl AtomicReadOnly {
    pub fn new(read_only: bool) -> Self {
        Self(AtomicBool::new(read_only))
    }

    pub fn set(&self, read_only: bool) {
        self.0.store(read_only, Ordering::SeqCst);
    }
}

impl ReadOnlyChecker for AtomicReadOnly {
    fn is_read_only(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A scan job the recovery cleanup collector hands off: "walk this page
/// range and zero any crashed GSP slot you find."
pub type CleanupJob = Box<dyn FnOnce() + Send>;

/// Accepts recovery cleanup jobs and either runs them immediately or
/// defers them to a background worker, per the `immediate`/deferred
/// policy §4.9 describes.
pub trait RecoveryCleanupWorkCollector: Send + Sync {
    fn submit(&self, job: CleanupJob);
}

/// Runs every submitted job on the calling thread before returning -
/// useful for tests and for callers that want recovery cleanup to block
/// tree open.
pub struct ImmediateCollector;

impl RecoveryCleanupWorkCollector for ImmediateCollector {
    fn submit(&self, job: CleanupJob) {
        job();
    }
}

/// Runs every submitted job on a detached background thread, matching the
/// spec's "can run in the background" cleanup policy.
#[derive(Default)]
pub struct DeferredCollector;

impl RecoveryCleanupWorkCollector for DeferredCollector {
    fn submit(&self, job: CleanupJob) {
        std::thread::spawn(job);
    }
}

/// Stand-in identifying a page that the cleanup collector found a crashed
/// GSP slot on, surfaced through [`Monitor::cleanup_progress`] hooks in a
/// richer implementation than the minimal one here.
#[derive(Clone, Copy, Debug)]
pub struct CrashedPointer {
    pub page: PageId,
}

pub fn shared<M: Monitor + 'static>(monitor: M) -> Arc<dyn Monitor> {
    Arc::new(monitor)
}
