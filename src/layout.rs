#![forbid(unsafe_code)]

//! The injected [`Layout`] contract: comparison, (de)serialization, and
//! sizing for the key/value types a tree is opened with. Everything above
//! the node module is generic over `L: Layout`; nothing in `pager` or
//! `checksum` knows what a key looks like.

use std::cmp::Ordering;
use std::fmt;

use crate::error::Result;

/// How a layout reports key/value sizing to the node module, which uses it
/// to pick between the fixed-size and dynamic-size body encodings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SizeClass {
    /// Every key (or value) encodes to exactly `size` bytes.
    Fixed { size: usize },
    /// Keys (or values) encode to a variable number of bytes, up to
    /// `max_inline` before the offload store takes over.
    Variable { max_inline: usize },
}

impl SizeClass {
    pub fn max_inline(&self) -> usize {
        match self {
            SizeClass::Fixed { size } => *size,
            SizeClass::Variable { max_inline } => *max_inline,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, SizeClass::Fixed { .. })
    }
}

/// Compare, serialize, and size a tree's key and value types.
///
/// Implementations must be pure and total: `compare_keys` defines the sort
/// order every invariant in the node and writer modules relies on, and
/// `encode`/`decode` must round-trip exactly (§8 round-trip laws).
pub trait Layout: Send + Sync + 'static {
    type Key: Clone + fmt::Debug + Send + Sync;
    type Value: Clone + fmt::Debug + Send + Sync;

    /// Strict total order over keys. Drives leaf slot order and internal
    /// separator placement (invariant 4).
    fn compare_keys(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Used only for tests and deterministic equality checks, never for
    /// ordering.
    fn compare_values(&self, a: &Self::Value, b: &Self::Value) -> Ordering;

    fn encode_key(&self, key: &Self::Key, out: &mut Vec<u8>);
    fn decode_key(&self, bytes: &[u8]) -> Result<Self::Key>;

    fn encode_value(&self, value: &Self::Value, out: &mut Vec<u8>);
    fn decode_value(&self, bytes: &[u8]) -> Result<Self::Value>;

    fn key_size_class(&self) -> SizeClass;
    fn value_size_class(&self) -> SizeClass;

    /// `true` when both key and value are fixed-size: the node module picks
    /// the fixed-size body layout (`TreeNodeFixedSize`) in this case and the
    /// dynamic body layout (`TreeNodeDynamic`) otherwise.
    fn fixed_size_body(&self) -> bool {
        self.key_size_class().is_fixed() && self.value_size_class().is_fixed()
    }
}

/// Fixed-size `u64 -> u64` layout, the simplest case: no offload is ever
/// needed, so the node module always picks `TreeNodeFixedSize` for it.
#[derive(Clone, Copy, Debug, Default)]
pub struct U64Layout;

impl Layout for U64Layout {
    type Key = u64;
    type Value = u64;

    fn compare_keys(&self, a: &Self::Key, b: &Self::Key) -> Ordering {
        a.cmp(b)
    }

    fn compare_values(&self, a: &Self::Value, b: &Self::Value) -> Ordering {
        a.cmp(b)
    }

    fn encode_key(&self, key: &Self::Key, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<Self::Key> {
        decode_u64(bytes)
    }

    fn encode_value(&self, value: &Self::Value, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Self::Value> {
        decode_u64(bytes)
    }

    fn key_size_class(&self) -> SizeClass {
        SizeClass::Fixed { size: 8 }
    }

    fn value_size_class(&self) -> SizeClass {
        SizeClass::Fixed { size: 8 }
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    if bytes.len() != 8 {
        return Err(crate::error::GbpError::corruption("u64 slot length mismatch"));
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(arr))
}

/// Variable-length `Vec<u8> -> Vec<u8>` layout. `max_inline` bounds both
/// keys and values before the writer offloads them (§4.5); callers pick it
/// relative to their page size.
#[derive(Clone, Debug)]
pub struct BytesLayout {
    max_inline_key: usize,
    max_inline_value: usize,
}

impl BytesLayout {
    pub fn new(max_inline_key: usize, max_inline_value: usize) -> Self {
        Self { max_inline_key, max_inline_value }
    }
}

impl Layout for BytesLayout {
    type Key = Vec<u8>;
    type Value = Vec<u8>;

    fn compare_keys(&self, a: &Self::Key, b: &Self::Key) -> Ordering {
        a.cmp(b)
    }

    fn compare_values(&self, a: &Self::Value, b: &Self::Value) -> Ordering {
        a.cmp(b)
    }

    fn encode_key(&self, key: &Self::Key, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<Self::Key> {
        Ok(bytes.to_vec())
    }

    fn encode_value(&self, value: &Self::Value, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Self::Value> {
        Ok(bytes.to_vec())
    }

    fn key_size_class(&self) -> SizeClass {
        SizeClass::Variable { max_inline: self.max_inline_key }
    }

    fn value_size_class(&self) -> SizeClass {
        SizeClass::Variable { max_inline: self.max_inline_value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_layout_round_trips() {
        let layout = U64Layout;
        let mut buf = Vec::new();
        layout.encode_key(&42, &mut buf);
        assert_eq!(layout.decode_key(&buf).unwrap(), 42);
    }

    #[test]
    fn bytes_layout_round_trips_variable_length() {
        let layout = BytesLayout::new(64, 64);
        let mut buf = Vec::new();
        layout.encode_value(&b"hello world".to_vec(), &mut buf);
        assert_eq!(layout.decode_value(&buf).unwrap(), b"hello world".to_vec());
    }
}
