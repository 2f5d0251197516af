#![forbid(unsafe_code)]

//! The generation-safe pointer (GSP): a dual-slot pointer that lets a
//! reader resolve "the right child page for my generation" without ever
//! taking a lock, and lets a writer install a new target without
//! invalidating readers still walking the old one.
//!
//! On disk each GSP is two fixed-size slots, A and B:
//!
//! ```text
//! slot: [ target: PageId (8) | generation: u64 (8) | checksum: u32 (4) ]
//! ```
//!
//! A slot with generation `0` ([`Generation::NONE`]) is empty. A read picks
//! the slot with the highest generation that is `<= read_generation`,
//! breaking ties in favor of slot A. A write always targets whichever slot
//! is *not* the one the current read would pick, so the other slot's
//! readers are never disturbed mid-traversal.

use crate::checksum::gsp_slot_crc32;
use crate::error::{GbpError, Result};
use crate::types::{read_u32, read_u64, write_u32, write_u64, Generation, PageId};

pub const SLOT_SIZE: usize = 20;
pub const GSP_SIZE: usize = SLOT_SIZE * 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn offset(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => SLOT_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct RawSlot {
    target: PageId,
    generation: Generation,
    checksum: u32,
}

impl RawSlot {
    fn empty() -> Self {
        Self { target: PageId::NO_NODE, generation: Generation::NONE, checksum: 0 }
    }

    fn is_empty(&self) -> bool {
        self.generation == Generation::NONE
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            target: PageId(read_u64(bytes, 0)),
            generation: Generation(read_u64(bytes, 8)),
            checksum: read_u32(bytes, 16),
        }
    }

    fn encode(&self, bytes: &mut [u8]) {
        write_u64(bytes, 0, self.target.0);
        write_u64(bytes, 8, self.generation.0);
        write_u32(bytes, 16, self.checksum);
    }

    fn valid(&self) -> bool {
        self.is_empty() || gsp_slot_crc32(self.target.0, self.generation.0) == self.checksum
    }
}

/// A decoded A/B pointer pair, read from a parent node's child slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Gsp {
    a: RawSlot,
    b: RawSlot,
}

impl Gsp {
    pub fn empty() -> Self {
        Self { a: RawSlot::empty(), b: RawSlot::empty() }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GSP_SIZE {
            return Err(GbpError::corruption("GSP buffer shorter than two slots"));
        }
        let a = RawSlot::decode(&bytes[Slot::A.offset()..Slot::A.offset() + SLOT_SIZE]);
        let b = RawSlot::decode(&bytes[Slot::B.offset()..Slot::B.offset() + SLOT_SIZE]);
        if !a.valid() || !b.valid() {
            return Err(GbpError::corruption("GSP slot checksum mismatch"));
        }
        Ok(Self { a, b })
    }

    pub fn encode(&self, bytes: &mut [u8]) {
        debug_assert!(bytes.len() >= GSP_SIZE);
        self.a.encode(&mut bytes[Slot::A.offset()..Slot::A.offset() + SLOT_SIZE]);
        self.b.encode(&mut bytes[Slot::B.offset()..Slot::B.offset() + SLOT_SIZE]);
    }

    fn slot(&self, which: Slot) -> &RawSlot {
        match which {
            Slot::A => &self.a,
            Slot::B => &self.b,
        }
    }

    /// The slot a reader at `read_generation` should follow: the highest
    /// generation not exceeding `read_generation`, ties favor A.
    fn read_slot(&self, read_generation: Generation) -> Option<Slot> {
        let a_ok = !self.a.is_empty() && self.a.generation <= read_generation;
        let b_ok = !self.b.is_empty() && self.b.generation <= read_generation;
        match (a_ok, b_ok) {
            (true, true) => Some(if self.a.generation >= self.b.generation { Slot::A } else { Slot::B }),
            (true, false) => Some(Slot::A),
            (false, true) => Some(Slot::B),
            (false, false) => None,
        }
    }

    /// Resolve the target page for a reader at `read_generation`, or
    /// `NO_NODE` if neither slot is visible yet.
    pub fn read(&self, read_generation: Generation) -> PageId {
        self.read_slot(read_generation).map(|s| self.slot(s).target).unwrap_or(PageId::NO_NODE)
    }

    /// The slot a write at `write_generation` must land in. A slot already
    /// stamped with exactly `write_generation` is this same write epoch's
    /// slot and is updated in place - that's a second (or third, ...) write
    /// within one generation, not a new epoch, so it must not toggle to the
    /// other slot and resurrect whatever stale value that slot still holds.
    /// Otherwise land in whichever slot is *not* the one the current read
    /// would pick, so in-flight readers at older generations keep seeing a
    /// consistent value.
    fn write_slot(&self, write_generation: Generation) -> Slot {
        if self.a.generation == write_generation {
            return Slot::A;
        }
        if self.b.generation == write_generation {
            return Slot::B;
        }
        match self.read_slot(write_generation) {
            Some(s) => s.other(),
            None => Slot::A,
        }
    }

    /// Install `target` as of `write_generation`, returning the updated GSP.
    pub fn write(&self, target: PageId, write_generation: Generation) -> Self {
        let slot = self.write_slot(write_generation);
        let raw = RawSlot {
            target,
            generation: write_generation,
            checksum: gsp_slot_crc32(target.0, write_generation.0),
        };
        let mut next = *self;
        match slot {
            Slot::A => next.a = raw,
            Slot::B => next.b = raw,
        }
        next
    }

    /// `true` once both slots hold a valid pointer; used by the cleanup
    /// collector to distinguish an in-progress split from steady state.
    pub fn fully_populated(&self) -> bool {
        !self.a.is_empty() && !self.b.is_empty()
    }

    /// The highest generation recorded in either slot, or `NONE` if both
    /// are empty.
    pub fn newest_generation(&self) -> Generation {
        self.a.generation.max(self.b.generation)
    }

    /// Clear any slot whose generation is newer than `stable`. A write
    /// past `stable` that the process crashed before checkpointing is
    /// never durable and must not be handed to a reader; recovery cleanup
    /// calls this on every GSP it scans after an unclean shutdown.
    pub fn prune_above(&self, stable: Generation) -> Self {
        let prune = |slot: RawSlot| if slot.generation > stable { RawSlot::empty() } else { slot };
        Self { a: prune(self.a), b: prune(self.b) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_picks_newest_slot_leq_read_generation() {
        let gsp = Gsp::empty().write(PageId(5), Generation(1)).write(PageId(9), Generation(3));
        assert_eq!(gsp.read(Generation(1)), PageId(5));
        assert_eq!(gsp.read(Generation(2)), PageId(5));
        assert_eq!(gsp.read(Generation(3)), PageId(9));
        assert_eq!(gsp.read(Generation(10)), PageId(9));
    }

    #[test]
    fn read_before_any_write_is_no_node() {
        let gsp = Gsp::empty();
        assert_eq!(gsp.read(Generation(5)), PageId::NO_NODE);
    }

    #[test]
    fn write_never_overwrites_the_slot_a_concurrent_reader_would_pick() {
        let gsp = Gsp::empty().write(PageId(1), Generation(1));
        // A reader at generation 1 is pinned to slot A (target 1).
        let updated = gsp.write(PageId(2), Generation(2));
        assert_eq!(updated.read(Generation(1)), PageId(1), "older reader must still see the old target");
        assert_eq!(updated.read(Generation(2)), PageId(2));
    }

    #[test]
    fn second_write_at_the_same_generation_updates_in_place() {
        let gsp = Gsp::empty().write(PageId(1), Generation(1)).write(PageId(2), Generation(1));
        assert_eq!(gsp.read(Generation(1)), PageId(2), "later write in the same generation must win");
        assert_eq!(gsp.read(Generation(10)), PageId(2));

        // A third write in the same generation keeps landing in the same
        // slot rather than toggling back and forth.
        let gsp = gsp.write(PageId(3), Generation(1));
        assert_eq!(gsp.read(Generation(1)), PageId(3));
    }

    #[test]
    fn tie_breaks_to_slot_a() {
        // A genuine tie (both slots stamped with the same generation) can
        // only arise through direct slot construction, e.g. bytes decoded
        // from an on-disk page written by an older/buggy writer; `write`
        // itself never produces one, since a same-generation write reuses
        // its own slot in place. Exercise the decode-time tie-break
        // directly.
        let mut bytes = [0u8; GSP_SIZE];
        let a = RawSlot { target: PageId(7), generation: Generation(4), checksum: gsp_slot_crc32(7, 4) };
        let b = RawSlot { target: PageId(8), generation: Generation(4), checksum: gsp_slot_crc32(8, 4) };
        a.encode(&mut bytes[Slot::A.offset()..Slot::A.offset() + SLOT_SIZE]);
        b.encode(&mut bytes[Slot::B.offset()..Slot::B.offset() + SLOT_SIZE]);
        let gsp = Gsp::decode(&bytes).unwrap();
        assert_eq!(gsp.read(Generation(4)), PageId(7));
    }

    #[test]
    fn prune_above_clears_only_the_unconfirmed_slot() {
        let gsp = Gsp::empty().write(PageId(1), Generation(1)).write(PageId(2), Generation(5));
        let pruned = gsp.prune_above(Generation(3));
        assert_eq!(pruned.read(Generation(1)), PageId(1), "slot at or below stable survives");
        assert_eq!(pruned.read(Generation(10)), PageId(1), "crashed slot no longer visible at any generation");
        assert_eq!(pruned.newest_generation(), Generation(1));
    }

    #[test]
    fn decode_rejects_tampered_checksum() {
        let gsp = Gsp::empty().write(PageId(3), Generation(1));
        let mut bytes = [0u8; GSP_SIZE];
        gsp.encode(&mut bytes);
        bytes[0] ^= 0xff;
        assert!(Gsp::decode(&bytes).is_err());
    }
}
