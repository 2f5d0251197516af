#![forbid(unsafe_code)]

//! Tree node layout: the fixed header every node carries, plus the two
//! body encodings ([`dynamic`] and [`fixed`]) that pack the key/value
//! slots making up the node's payload.
//!
//! A page is interpreted as a node by splitting it into `header` (this
//! module) followed immediately by `body` (the remaining bytes, handed to
//! whichever [`dynamic::DynamicBody`] or [`fixed::FixedBody`] the layout
//! picked at tree-open time).

pub mod dynamic;
pub mod fixed;

use crate::error::{GbpError, Result};
use crate::pager::gsp::{Gsp, GSP_SIZE};
use crate::types::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64, Generation};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    Leaf,
    Internal,
}

impl NodeKind {
    fn to_byte(self) -> u8 {
        match self {
            NodeKind::Leaf => 0,
            NodeKind::Internal => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(NodeKind::Leaf),
            1 => Ok(NodeKind::Internal),
            other => Err(GbpError::corruption(format!("unknown node type tag {other}"))),
        }
    }
}

/// Distinguishes the conventional data-layer tree from the root layer of a
/// multi-root tree (§4.10), whose values are root page IDs rather than
/// caller key/value pairs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LayerFlag {
    Data,
    Root,
}

impl LayerFlag {
    fn to_byte(self) -> u8 {
        match self {
            LayerFlag::Data => 0,
            LayerFlag::Root => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(LayerFlag::Data),
            1 => Ok(LayerFlag::Root),
            other => Err(GbpError::corruption(format!("unknown layer flag {other}"))),
        }
    }
}

/// Result of probing whether a leaf has room for one more key/value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Overflow {
    /// Fits as-is.
    No,
    /// Doesn't fit now, but would after `defragmentLeaf` reclaims its dead
    /// zone.
    NeedDefrag,
    /// Doesn't fit even after defragmentation; the writer must split.
    Yes,
}

const NODE_TYPE_OFFSET: usize = 0;
const LAYER_FLAG_OFFSET: usize = 1;
// bytes 2..4 reserved, must be zero.
const GENERATION_OFFSET: usize = 4;
const KEY_COUNT_OFFSET: usize = 12;
const LEFT_SIBLING_OFFSET: usize = 16;
const RIGHT_SIBLING_OFFSET: usize = LEFT_SIBLING_OFFSET + GSP_SIZE;
const SUCCESSOR_OFFSET: usize = RIGHT_SIBLING_OFFSET + GSP_SIZE;

/// Size of the fixed header every node (leaf or internal) carries ahead of
/// its body. This is the `BASE_HEADER` term in the page-size-minimum
/// calculation.
pub const HEADER_SIZE: usize = SUCCESSOR_OFFSET + GSP_SIZE;

/// A decoded node header. Callers read it out of a page's leading bytes,
/// mutate the copy, and re-encode it - the header never aliases the page
/// buffer directly so it can be validated before any body bytes are
/// trusted.
#[derive(Clone, Copy, Debug)]
pub struct NodeHeader {
    pub kind: NodeKind,
    pub layer: LayerFlag,
    pub generation: Generation,
    pub key_count: u32,
    pub left_sibling: Gsp,
    pub right_sibling: Gsp,
    pub successor: Gsp,
}

impl NodeHeader {
    pub fn new_leaf(layer: LayerFlag, generation: Generation) -> Self {
        Self {
            kind: NodeKind::Leaf,
            layer,
            generation,
            key_count: 0,
            left_sibling: Gsp::empty(),
            right_sibling: Gsp::empty(),
            successor: Gsp::empty(),
        }
    }

    pub fn new_internal(layer: LayerFlag, generation: Generation) -> Self {
        Self {
            kind: NodeKind::Internal,
            layer,
            generation,
            key_count: 0,
            left_sibling: Gsp::empty(),
            right_sibling: Gsp::empty(),
            successor: Gsp::empty(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < HEADER_SIZE {
            return Err(GbpError::corruption("page shorter than node header"));
        }
        let reserved = read_u16(page, 2);
        if reserved != 0 {
            return Err(GbpError::corruption("node header reserved bytes non-zero"));
        }
        Ok(Self {
            kind: NodeKind::from_byte(page[NODE_TYPE_OFFSET])?,
            layer: LayerFlag::from_byte(page[LAYER_FLAG_OFFSET])?,
            generation: Generation(read_u64(page, GENERATION_OFFSET)),
            key_count: read_u32(page, KEY_COUNT_OFFSET),
            left_sibling: Gsp::decode(&page[LEFT_SIBLING_OFFSET..LEFT_SIBLING_OFFSET + GSP_SIZE])?,
            right_sibling: Gsp::decode(&page[RIGHT_SIBLING_OFFSET..RIGHT_SIBLING_OFFSET + GSP_SIZE])?,
            successor: Gsp::decode(&page[SUCCESSOR_OFFSET..SUCCESSOR_OFFSET + GSP_SIZE])?,
        })
    }

    pub fn encode(&self, page: &mut [u8]) {
        debug_assert!(page.len() >= HEADER_SIZE);
        page[NODE_TYPE_OFFSET] = self.kind.to_byte();
        page[LAYER_FLAG_OFFSET] = self.layer.to_byte();
        write_u16(page, 2, 0);
        write_u64(page, GENERATION_OFFSET, self.generation.0);
        write_u32(page, KEY_COUNT_OFFSET, self.key_count);
        self.left_sibling.encode(&mut page[LEFT_SIBLING_OFFSET..LEFT_SIBLING_OFFSET + GSP_SIZE]);
        self.right_sibling.encode(&mut page[RIGHT_SIBLING_OFFSET..RIGHT_SIBLING_OFFSET + GSP_SIZE]);
        self.successor.encode(&mut page[SUCCESSOR_OFFSET..SUCCESSOR_OFFSET + GSP_SIZE]);
    }
}

/// Smallest page size that can hold the header plus one maximum-size key
/// and one maximum-size value (§8 boundary behavior). Implementations that
/// open with a smaller page size must fail.
pub fn minimum_page_size(max_key: usize, max_value: usize) -> usize {
    HEADER_SIZE + max_key + max_value
}

/// Which body encoding a tree was opened with. Selected once at open time
/// from [`crate::layout::Layout::fixed_size_body`] and threaded through
/// every writer/seeker call site so they never need to match on it
/// themselves - this is the "tagged variant, dispatch table-driven, never
/// via runtime class hierarchies" the design notes call for.
#[derive(Clone, Copy, Debug)]
pub enum BodyLayout {
    Dynamic,
    Fixed(fixed::FixedGeometry),
}

impl BodyLayout {
    pub fn init_leaf(&self, body: &mut [u8]) {
        match self {
            BodyLayout::Dynamic => dynamic::init(body),
            BodyLayout::Fixed(_) => body.fill(0),
        }
    }

    pub fn init_internal(&self, body: &mut [u8]) {
        match self {
            BodyLayout::Dynamic => dynamic::init_internal(body),
            BodyLayout::Fixed(_) => body.fill(0),
        }
    }

    pub fn leaf_overflow(&self, body: &[u8], count: u32, key_len: usize, val_len: usize) -> Overflow {
        match self {
            BodyLayout::Dynamic => dynamic::leaf_overflow(body, count, key_len, val_len),
            BodyLayout::Fixed(g) => fixed::leaf_overflow(body, *g, count),
        }
    }

    pub fn internal_overflow(&self, body: &[u8], count: u32, key_len: usize) -> Overflow {
        match self {
            BodyLayout::Dynamic => dynamic::internal_overflow(body, count, key_len),
            BodyLayout::Fixed(g) => fixed::internal_overflow(body, *g, count),
        }
    }

    /// Below the minimum-fill threshold for a non-root leaf: fewer than
    /// half the bytes/slots it could hold are live. The writer only
    /// consults this for a node it reached through a parent - the root is
    /// exempt, as in any B+-tree.
    pub fn leaf_is_underflowed(&self, body: &[u8], count: u32) -> bool {
        match self {
            BodyLayout::Dynamic => dynamic::leaf_is_underflowed(body, count),
            BodyLayout::Fixed(g) => fixed::leaf_is_underflowed(body, *g, count),
        }
    }

    pub fn internal_is_underflowed(&self, body: &[u8], count: u32) -> bool {
        match self {
            BodyLayout::Dynamic => dynamic::internal_is_underflowed(body, count),
            BodyLayout::Fixed(g) => fixed::internal_is_underflowed(body, *g, count),
        }
    }

    pub fn key_at<'a>(&self, body: &'a [u8], count: u32, position: usize) -> Result<&'a [u8]> {
        match self {
            BodyLayout::Dynamic => dynamic::key_at(body, count, position),
            BodyLayout::Fixed(g) => fixed::key_at(body, *g, count, position),
        }
    }

    pub fn value_at<'a>(&self, body: &'a [u8], count: u32, position: usize) -> Result<&'a [u8]> {
        match self {
            BodyLayout::Dynamic => dynamic::value_at(body, count, position),
            BodyLayout::Fixed(g) => fixed::value_at(body, *g, count, position),
        }
    }

    pub fn key_offloaded(&self, body: &[u8], count: u32, position: usize) -> Result<bool> {
        match self {
            BodyLayout::Dynamic => Ok(dynamic::leaf_slot_at(body, count, position)?.key_offloaded),
            BodyLayout::Fixed(_) => Ok(false),
        }
    }

    pub fn value_offloaded(&self, body: &[u8], count: u32, position: usize) -> Result<bool> {
        match self {
            BodyLayout::Dynamic => Ok(dynamic::leaf_slot_at(body, count, position)?.value_offloaded),
            BodyLayout::Fixed(_) => Ok(false),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_key_value_at(
        &self,
        body: &mut [u8],
        count: u32,
        position: usize,
        key: &[u8],
        key_offloaded: bool,
        value: &[u8],
        value_offloaded: bool,
    ) -> Result<()> {
        match self {
            BodyLayout::Dynamic => {
                dynamic::insert_key_value_at(body, count, position, key, key_offloaded, value, value_offloaded)
            }
            BodyLayout::Fixed(g) => fixed::insert_key_value_at(body, *g, count, position, key, value),
        }
    }

    pub fn remove_key_value_at(&self, body: &mut [u8], count: u32, position: usize) -> Result<()> {
        match self {
            BodyLayout::Dynamic => dynamic::remove_key_value_at(body, count, position),
            BodyLayout::Fixed(g) => fixed::remove_key_value_at(body, *g, count, position),
        }
    }

    pub fn set_value_at(&self, body: &mut [u8], count: u32, position: usize, value: &[u8]) -> Result<bool> {
        match self {
            BodyLayout::Dynamic => dynamic::set_value_at(body, count, position, value),
            BodyLayout::Fixed(g) => fixed::set_value_at(body, *g, count, position, value),
        }
    }

    pub fn defragment_leaf(&self, body: &mut [u8], count: u32) -> Result<()> {
        match self {
            BodyLayout::Dynamic => dynamic::defragment_leaf(body, count),
            BodyLayout::Fixed(g) => fixed::defragment_leaf(body, *g, count),
        }
    }

    /// No-op for the fixed layout, which never fragments; dynamic bodies
    /// get their own compaction pass since internal records are shaped
    /// differently from leaf records.
    pub fn defragment_internal(&self, body: &mut [u8], count: u32) -> Result<()> {
        match self {
            BodyLayout::Dynamic => dynamic::defragment_internal(body, count),
            BodyLayout::Fixed(g) => fixed::defragment_leaf(body, *g, count),
        }
    }

    pub fn internal_key_at<'a>(&self, body: &'a [u8], count: u32, position: usize) -> Result<&'a [u8]> {
        match self {
            BodyLayout::Dynamic => dynamic::internal_key_at(body, count, position).map(|(k, _)| k),
            BodyLayout::Fixed(g) => fixed::internal_key_at(body, *g, count, position),
        }
    }

    pub fn internal_key_offloaded(&self, body: &[u8], count: u32, position: usize) -> Result<bool> {
        match self {
            BodyLayout::Dynamic => dynamic::internal_key_at(body, count, position).map(|(_, off)| off),
            BodyLayout::Fixed(_) => Ok(false),
        }
    }

    pub fn child_at(&self, body: &[u8], count: u32, i: usize) -> Result<Gsp> {
        match self {
            BodyLayout::Dynamic => dynamic::child_at(body, count, i),
            BodyLayout::Fixed(g) => fixed::child_at(body, *g, count, i),
        }
    }

    pub fn set_child_at(&self, body: &mut [u8], count: u32, i: usize, gsp: Gsp) -> Result<()> {
        match self {
            BodyLayout::Dynamic => dynamic::set_child_at(body, count, i, gsp),
            BodyLayout::Fixed(g) => fixed::set_child_at(body, *g, count, i, gsp),
        }
    }

    pub fn insert_key_and_right_child_at(
        &self,
        body: &mut [u8],
        count: u32,
        position: usize,
        key: &[u8],
        key_offloaded: bool,
        right_child: Gsp,
    ) -> Result<()> {
        match self {
            BodyLayout::Dynamic => {
                dynamic::insert_key_and_right_child_at(body, count, position, key, key_offloaded, right_child)
            }
            BodyLayout::Fixed(g) => fixed::insert_key_and_right_child_at(body, *g, count, position, key, right_child),
        }
    }

    pub fn remove_key_and_right_child_at(&self, body: &mut [u8], count: u32, position: usize) -> Result<()> {
        match self {
            BodyLayout::Dynamic => dynamic::remove_key_and_right_child_at(body, count, position),
            BodyLayout::Fixed(g) => fixed::remove_key_and_right_child_at(body, *g, count, position),
        }
    }

    pub fn remove_key_and_left_child_at(&self, body: &mut [u8], count: u32, position: usize) -> Result<()> {
        match self {
            BodyLayout::Dynamic => dynamic::remove_key_and_left_child_at(body, count, position),
            BodyLayout::Fixed(g) => fixed::remove_key_and_left_child_at(body, *g, count, position),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut buf = vec![0u8; HEADER_SIZE];
        let mut header = NodeHeader::new_leaf(LayerFlag::Data, Generation(3));
        header.key_count = 7;
        header.right_sibling = Gsp::empty().write(crate::types::PageId(9), Generation(3));
        header.encode(&mut buf);

        let decoded = NodeHeader::decode(&buf).unwrap();
        assert!(decoded.is_leaf());
        assert_eq!(decoded.generation, Generation(3));
        assert_eq!(decoded.key_count, 7);
        assert_eq!(decoded.right_sibling.read(Generation(3)), crate::types::PageId(9));
    }

    #[test]
    fn decode_rejects_nonzero_reserved_bytes() {
        let mut buf = vec![0u8; HEADER_SIZE];
        NodeHeader::new_leaf(LayerFlag::Data, Generation(1)).encode(&mut buf);
        buf[2] = 1;
        assert!(NodeHeader::decode(&buf).is_err());
    }

    #[test]
    fn decode_rejects_unknown_node_type() {
        let mut buf = vec![0u8; HEADER_SIZE];
        NodeHeader::new_leaf(LayerFlag::Data, Generation(1)).encode(&mut buf);
        buf[0] = 9;
        assert!(NodeHeader::decode(&buf).is_err());
    }
}
