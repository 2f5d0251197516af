#![forbid(unsafe_code)]

//! Checkpoint policy: when to trigger one, and the report handed back once
//! it completes. The mechanics of *running* a checkpoint - draining
//! writers, flushing dirty pages, writing the log record, advancing
//! generations - live on [`crate::tree::Tree`], which is the only thing
//! holding every piece that touches.

use std::time::{Duration, Instant};

use crate::types::{Generation, PageId};

/// Snapshot of activity since the last checkpoint, handed to a
/// [`CheckpointThreshold`] so it can decide whether to trigger one.
#[derive(Clone, Copy, Debug, Default)]
pub struct CheckpointStats {
    pub writes_since_checkpoint: u64,
    pub bytes_dirty: u64,
    pub elapsed_since_checkpoint: Duration,
}

/// Pluggable policy for when a checkpoint should run, per §4.8: "time,
/// volume, or entry count."
pub trait CheckpointThreshold: Send + Sync {
    fn should_checkpoint(&self, stats: &CheckpointStats) -> bool;
}

pub struct TimeThreshold(pub Duration);

impl CheckpointThreshold for TimeThreshold {
    fn should_checkpoint(&self, stats: &CheckpointStats) -> bool {
        stats.elapsed_since_checkpoint >= self.0
    }
}

pub struct VolumeThreshold {
    pub bytes: u64,
}

impl CheckpointThreshold for VolumeThreshold {
    fn should_checkpoint(&self, stats: &CheckpointStats) -> bool {
        stats.bytes_dirty >= self.bytes
    }
}

pub struct EntryCountThreshold {
    pub writes: u64,
}

impl CheckpointThreshold for EntryCountThreshold {
    fn should_checkpoint(&self, stats: &CheckpointStats) -> bool {
        stats.writes_since_checkpoint >= self.writes
    }
}

/// Never checkpoint automatically; the caller always triggers explicitly.
pub struct Never;

impl CheckpointThreshold for Never {
    fn should_checkpoint(&self, _stats: &CheckpointStats) -> bool {
        false
    }
}

/// Any one of several thresholds tripping is enough - the common
/// production configuration combines a volume and a time threshold.
pub struct AnyOf(pub Vec<Box<dyn CheckpointThreshold>>);

impl CheckpointThreshold for AnyOf {
    fn should_checkpoint(&self, stats: &CheckpointStats) -> bool {
        self.0.iter().any(|t| t.should_checkpoint(stats))
    }
}

/// Tracks wall-clock and write volume since the last checkpoint so a
/// [`CheckpointThreshold`] has something to evaluate against.
pub struct CheckpointClock {
    started: Instant,
    writes: std::sync::atomic::AtomicU64,
    bytes: std::sync::atomic::AtomicU64,
}

impl Default for CheckpointClock {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            writes: std::sync::atomic::AtomicU64::new(0),
            bytes: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl CheckpointClock {
    pub fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.bytes.fetch_add(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn stats(&self) -> CheckpointStats {
        CheckpointStats {
            writes_since_checkpoint: self.writes.load(std::sync::atomic::Ordering::Relaxed),
            bytes_dirty: self.bytes.load(std::sync::atomic::Ordering::Relaxed),
            elapsed_since_checkpoint: self.started.elapsed(),
        }
    }

    pub fn reset(&self) {
        self.writes.store(0, std::sync::atomic::Ordering::Relaxed);
        self.bytes.store(0, std::sync::atomic::Ordering::Relaxed);
    }
}

#[derive(Clone, Debug)]
pub struct CheckpointReport {
    pub stable_generation: Generation,
    pub unstable_generation: Generation,
    pub root: PageId,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_threshold_trips_once_bytes_exceed_limit() {
        let threshold = VolumeThreshold { bytes: 100 };
        assert!(!threshold.should_checkpoint(&CheckpointStats { bytes_dirty: 50, ..Default::default() }));
        assert!(threshold.should_checkpoint(&CheckpointStats { bytes_dirty: 150, ..Default::default() }));
    }

    #[test]
    fn any_of_trips_when_one_threshold_does() {
        let combined = AnyOf(vec![
            Box::new(EntryCountThreshold { writes: 1_000 }),
            Box::new(VolumeThreshold { bytes: 10 }),
        ]);
        assert!(combined.should_checkpoint(&CheckpointStats { bytes_dirty: 20, ..Default::default() }));
        assert!(!combined.should_checkpoint(&CheckpointStats::default()));
    }
}
