#![forbid(unsafe_code)]

//! The fixed-size body layout (`TreeNodeFixedSize`): every key and value
//! encodes to the same number of bytes, so slots are a plain contiguous
//! array and removal compacts immediately - there is no dead zone and
//! `defragment_leaf` is a no-op.

use super::Overflow;
use crate::error::{GbpError, Result};
use crate::pager::gsp::{Gsp, GSP_SIZE};

/// Everything this layout needs to know to compute slot offsets; callers
/// pass it once at tree-open time.
#[derive(Clone, Copy, Debug)]
pub struct FixedGeometry {
    pub key_size: usize,
    pub value_size: usize,
}

impl FixedGeometry {
    fn leaf_slot_size(&self) -> usize {
        self.key_size + self.value_size
    }

    fn internal_slot_size(&self) -> usize {
        self.key_size + GSP_SIZE
    }

    pub fn leaf_capacity(&self, body_len: usize) -> u32 {
        (body_len / self.leaf_slot_size()) as u32
    }

    pub fn internal_capacity(&self, body_len: usize) -> u32 {
        // one extra GSP for the leftmost child.
        ((body_len.saturating_sub(GSP_SIZE)) / self.internal_slot_size()) as u32
    }
}

pub fn leaf_overflow(body: &[u8], geometry: FixedGeometry, count: u32) -> Overflow {
    if (count + 1) <= geometry.leaf_capacity(body.len()) {
        Overflow::No
    } else {
        Overflow::Yes
    }
}

pub fn internal_overflow(body: &[u8], geometry: FixedGeometry, count: u32) -> Overflow {
    if (count + 1) <= geometry.internal_capacity(body.len()) {
        Overflow::No
    } else {
        Overflow::Yes
    }
}

/// A non-root leaf is underflowed once it holds fewer than half the slots
/// it could hold - the classic B+-tree minimum-fill bound.
pub fn leaf_is_underflowed(body: &[u8], geometry: FixedGeometry, count: u32) -> bool {
    count * 2 < geometry.leaf_capacity(body.len()).max(1)
}

pub fn internal_is_underflowed(body: &[u8], geometry: FixedGeometry, count: u32) -> bool {
    count * 2 < geometry.internal_capacity(body.len()).max(1)
}

/// A no-op: fixed-size slots never fragment, so there is nothing to
/// reclaim. Kept so callers can treat both body layouts uniformly.
pub fn defragment_leaf(_body: &mut [u8], _geometry: FixedGeometry, _count: u32) -> Result<()> {
    Ok(())
}

fn leaf_slot_offset(geometry: FixedGeometry, position: usize) -> usize {
    position * geometry.leaf_slot_size()
}

pub fn key_at<'a>(body: &'a [u8], geometry: FixedGeometry, count: u32, position: usize) -> Result<&'a [u8]> {
    check_position(count, position)?;
    let off = leaf_slot_offset(geometry, position);
    Ok(&body[off..off + geometry.key_size])
}

pub fn value_at<'a>(body: &'a [u8], geometry: FixedGeometry, count: u32, position: usize) -> Result<&'a [u8]> {
    check_position(count, position)?;
    let off = leaf_slot_offset(geometry, position);
    Ok(&body[off + geometry.key_size..off + geometry.key_size + geometry.value_size])
}

fn check_position(count: u32, position: usize) -> Result<()> {
    if position as u32 >= count {
        return Err(GbpError::corruption("fixed-size slot position out of range"));
    }
    Ok(())
}

pub fn insert_key_value_at(
    body: &mut [u8],
    geometry: FixedGeometry,
    count: u32,
    position: usize,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    debug_assert_eq!(key.len(), geometry.key_size);
    debug_assert_eq!(value.len(), geometry.value_size);
    let slot_size = geometry.leaf_slot_size();
    let tail_start = leaf_slot_offset(geometry, position);
    let tail_len = (count as usize - position) * slot_size;
    body.copy_within(tail_start..tail_start + tail_len, tail_start + slot_size);
    body[tail_start..tail_start + geometry.key_size].copy_from_slice(key);
    body[tail_start + geometry.key_size..tail_start + slot_size].copy_from_slice(value);
    Ok(())
}

pub fn remove_key_value_at(body: &mut [u8], geometry: FixedGeometry, count: u32, position: usize) -> Result<()> {
    check_position(count, position)?;
    let slot_size = geometry.leaf_slot_size();
    let tail_start = leaf_slot_offset(geometry, position + 1);
    let tail_len = (count as usize - position - 1) * slot_size;
    body.copy_within(tail_start..tail_start + tail_len, tail_start - slot_size);
    Ok(())
}

pub fn set_value_at(body: &mut [u8], geometry: FixedGeometry, count: u32, position: usize, value: &[u8]) -> Result<bool> {
    check_position(count, position)?;
    debug_assert_eq!(value.len(), geometry.value_size);
    let off = leaf_slot_offset(geometry, position);
    body[off + geometry.key_size..off + geometry.key_size + geometry.value_size].copy_from_slice(value);
    Ok(true)
}

// ---------------------------------------------------------------------
// Internal: leftmost child GSP, then `count` (key, right-child GSP) pairs.
// ---------------------------------------------------------------------

fn internal_slot_offset(geometry: FixedGeometry, position: usize) -> usize {
    GSP_SIZE + position * geometry.internal_slot_size()
}

pub fn leftmost_child(body: &[u8]) -> Result<Gsp> {
    Gsp::decode(&body[0..GSP_SIZE])
}

pub fn set_leftmost_child(body: &mut [u8], gsp: Gsp) {
    gsp.encode(&mut body[0..GSP_SIZE]);
}

pub fn internal_key_at<'a>(body: &'a [u8], geometry: FixedGeometry, count: u32, position: usize) -> Result<&'a [u8]> {
    check_position(count, position)?;
    let off = internal_slot_offset(geometry, position);
    Ok(&body[off..off + geometry.key_size])
}

pub fn child_at(body: &[u8], geometry: FixedGeometry, count: u32, i: usize) -> Result<Gsp> {
    if i == 0 {
        return leftmost_child(body);
    }
    if i as u32 > count {
        return Err(GbpError::corruption("internal child index out of range"));
    }
    let off = internal_slot_offset(geometry, i - 1) + geometry.key_size;
    Gsp::decode(&body[off..off + GSP_SIZE])
}

pub fn set_child_at(body: &mut [u8], geometry: FixedGeometry, count: u32, i: usize, gsp: Gsp) -> Result<()> {
    if i == 0 {
        set_leftmost_child(body, gsp);
        return Ok(());
    }
    if i as u32 > count {
        return Err(GbpError::corruption("internal child index out of range"));
    }
    let off = internal_slot_offset(geometry, i - 1) + geometry.key_size;
    gsp.encode(&mut body[off..off + GSP_SIZE]);
    Ok(())
}

pub fn insert_key_and_right_child_at(
    body: &mut [u8],
    geometry: FixedGeometry,
    count: u32,
    position: usize,
    key: &[u8],
    right_child: Gsp,
) -> Result<()> {
    debug_assert_eq!(key.len(), geometry.key_size);
    let slot_size = geometry.internal_slot_size();
    let tail_start = internal_slot_offset(geometry, position);
    let tail_len = (count as usize - position) * slot_size;
    body.copy_within(tail_start..tail_start + tail_len, tail_start + slot_size);
    body[tail_start..tail_start + geometry.key_size].copy_from_slice(key);
    let child_off = tail_start + geometry.key_size;
    right_child.encode(&mut body[child_off..child_off + GSP_SIZE]);
    Ok(())
}

pub fn remove_key_and_right_child_at(body: &mut [u8], geometry: FixedGeometry, count: u32, position: usize) -> Result<()> {
    check_position(count, position)?;
    let slot_size = geometry.internal_slot_size();
    let tail_start = internal_slot_offset(geometry, position + 1);
    let tail_len = (count as usize - position - 1) * slot_size;
    body.copy_within(tail_start..tail_start + tail_len, tail_start - slot_size);
    Ok(())
}

pub fn remove_key_and_left_child_at(body: &mut [u8], geometry: FixedGeometry, count: u32, position: usize) -> Result<()> {
    let right = child_at(body, geometry, count, position + 1)?;
    if position == 0 {
        set_leftmost_child(body, right);
    } else {
        set_child_at(body, geometry, count, position, right)?;
    }
    remove_key_and_right_child_at(body, geometry, count, position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Generation, PageId};

    fn geo() -> FixedGeometry {
        FixedGeometry { key_size: 8, value_size: 8 }
    }

    fn gsp(target: u64) -> Gsp {
        Gsp::empty().write(PageId(target), Generation(1))
    }

    #[test]
    fn insert_remove_round_trip() {
        let mut body = vec![0u8; 256];
        let g = geo();
        insert_key_value_at(&mut body, g, 0, 0, &9u64.to_be_bytes(), &90u64.to_be_bytes()).unwrap();
        insert_key_value_at(&mut body, g, 1, 0, &1u64.to_be_bytes(), &10u64.to_be_bytes()).unwrap();
        assert_eq!(key_at(&body, g, 2, 0).unwrap(), 1u64.to_be_bytes());
        assert_eq!(key_at(&body, g, 2, 1).unwrap(), 9u64.to_be_bytes());

        remove_key_value_at(&mut body, g, 2, 0).unwrap();
        assert_eq!(key_at(&body, g, 1, 0).unwrap(), 9u64.to_be_bytes());
    }

    #[test]
    fn internal_children_track_separators() {
        let mut body = vec![0u8; 256];
        let g = geo();
        set_leftmost_child(&mut body, gsp(1));
        insert_key_and_right_child_at(&mut body, g, 0, 0, &5u64.to_be_bytes(), gsp(2)).unwrap();
        assert_eq!(child_at(&body, g, 1, 0).unwrap().read(Generation(1)), PageId(1));
        assert_eq!(child_at(&body, g, 1, 1).unwrap().read(Generation(1)), PageId(2));
    }

    #[test]
    fn overflow_reports_yes_once_capacity_reached() {
        let body = vec![0u8; 32]; // capacity = 2 leaf slots of 16 bytes
        let g = geo();
        assert_eq!(leaf_overflow(&body, g, 1), Overflow::No);
        assert_eq!(leaf_overflow(&body, g, 2), Overflow::Yes);
    }
}
