#![forbid(unsafe_code)]

//! The stable/unstable generation pair and the reader registry that gates
//! when a freed page ID becomes safe to reuse.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::types::Generation;

/// Tracks `stable` and `unstable`, plus every generation a long-running
/// reader (a seeker mid-traversal) is still pinned against.
///
/// A checkpoint advances the pair with `stable := unstable; unstable += 1`.
/// An ID released at generation `g` is only safe to recycle once `stable`
/// has moved past `g` *and* no registered reader is still looking at `g` or
/// anything older — otherwise a long-running optimistic reader could follow
/// a stale pointer into a page that has already been reused for something
/// else.
pub struct GenerationKeeper {
    stable: AtomicU64,
    unstable: AtomicU64,
    active_readers: Mutex<BTreeMap<u64, usize>>,
}

/// RAII guard registering a reader's start generation; dropping it
/// deregisters the reader.
pub struct ReaderGuard<'a> {
    keeper: &'a GenerationKeeper,
    generation: u64,
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        let mut readers = self.keeper.active_readers.lock().unwrap();
        if let Some(count) = readers.get_mut(&self.generation) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&self.generation);
            }
        }
    }
}

impl GenerationKeeper {
    pub fn new(stable: Generation, unstable: Generation) -> Self {
        Self {
            stable: AtomicU64::new(stable.0),
            unstable: AtomicU64::new(unstable.0),
            active_readers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn fresh() -> Self {
        Self::new(Generation::MIN_GEN, Generation(Generation::MIN_GEN.0 + 1))
    }

    pub fn stable(&self) -> Generation {
        Generation(self.stable.load(Ordering::Acquire))
    }

    pub fn unstable(&self) -> Generation {
        Generation(self.unstable.load(Ordering::Acquire))
    }

    /// Overwrite both generations, used when reopening a tree to restore
    /// the pair recorded in the metadata page rather than starting fresh.
    pub fn restore(&self, stable: Generation, unstable: Generation) {
        self.stable.store(stable.0, Ordering::Release);
        self.unstable.store(unstable.0, Ordering::Release);
    }

    /// Advance the pair at checkpoint time. Returns the new `(stable, unstable)`.
    pub fn advance(&self) -> crate::error::Result<(Generation, Generation)> {
        let new_stable = self.unstable();
        let new_unstable = new_stable.next()?;
        self.stable.store(new_stable.0, Ordering::Release);
        self.unstable.store(new_unstable.0, Ordering::Release);
        Ok((new_stable, new_unstable))
    }

    /// Register a long-running reader starting its traversal at `unstable()`.
    pub fn register_reader(&self) -> ReaderGuard<'_> {
        let generation = self.unstable().0;
        let mut readers = self.active_readers.lock().unwrap();
        *readers.entry(generation).or_insert(0) += 1;
        ReaderGuard { keeper: self, generation }
    }

    /// The oldest generation any registered reader might still observe, or
    /// `None` if there are no active long-running readers.
    fn oldest_active_reader(&self) -> Option<u64> {
        self.active_readers.lock().unwrap().keys().next().copied()
    }

    /// Whether a page released at `release_generation` may be recycled now.
    pub fn safe_to_free(&self, release_generation: Generation) -> bool {
        if self.stable() <= release_generation {
            return false;
        }
        match self.oldest_active_reader() {
            Some(oldest) => release_generation.0 < oldest,
            None => true,
        }
    }
}

impl Default for GenerationKeeper {
    fn default() -> Self {
        Self::fresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_stable_to_old_unstable() {
        let keeper = GenerationKeeper::fresh();
        let before_unstable = keeper.unstable();
        let (stable, unstable) = keeper.advance().unwrap();
        assert_eq!(stable, before_unstable);
        assert_eq!(unstable, Generation(before_unstable.0 + 1));
    }

    #[test]
    fn free_blocked_by_active_reader() {
        let keeper = GenerationKeeper::fresh();
        let guard = keeper.register_reader();
        let release_gen = keeper.unstable();
        keeper.advance().unwrap();
        keeper.advance().unwrap();
        assert!(!keeper.safe_to_free(release_gen));
        drop(guard);
        assert!(keeper.safe_to_free(release_gen));
    }

    #[test]
    fn free_allowed_once_stable_passes_release_generation() {
        let keeper = GenerationKeeper::fresh();
        let release_gen = keeper.stable();
        assert!(!keeper.safe_to_free(release_gen));
        keeper.advance().unwrap();
        assert!(keeper.safe_to_free(release_gen));
    }
}
