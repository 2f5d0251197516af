#![forbid(unsafe_code)]

//! CRC32 checksums for pages and GSP slots.

/// A running checksum accumulator. Kept as a trait so tests can swap in a
/// deterministic fake without touching call sites.
pub trait Checksum {
    fn reset(&mut self);
    fn update(&mut self, bytes: &[u8]);
    fn finalize(&self) -> u32;
}

pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum a whole page, salted with its page ID and generation so that two
/// pages with identical bytes in different slots never collide.
pub fn page_crc32(page_id: u64, generation: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_id.to_be_bytes());
    hasher.update(&generation.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Checksum for a single GSP slot: `(target page id, generation)`.
///
/// Deliberately narrower than [`page_crc32`] — a GSP slot is 20 bytes on disk and
/// doesn't carry a full page payload to hash.
pub fn gsp_slot_crc32(target: u64, generation: u64) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&target.to_be_bytes());
    hasher.update(&generation.to_be_bytes());
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_trait_roundtrip() {
        let mut c = Crc32Fast::default();
        c.update(b"hello");
        let first = c.finalize();
        c.update(b" world");
        let second = c.finalize();
        assert_ne!(first, second);
        c.reset();
        c.update(b"hello world");
        assert_eq!(c.finalize(), second);
    }

    #[test]
    fn page_crc32_changes_with_components() {
        let payload = vec![0u8; 16];
        let crc_a = page_crc32(1, 2, &payload);
        assert_eq!(crc_a, page_crc32(1, 2, &payload));

        let mut different = payload.clone();
        different[0] = 1;
        assert_ne!(crc_a, page_crc32(1, 2, &different));
        assert_ne!(crc_a, page_crc32(3, 2, &payload));
        assert_ne!(crc_a, page_crc32(1, 3, &payload));
    }

    #[test]
    fn gsp_slot_crc32_detects_tamper() {
        let crc = gsp_slot_crc32(42, 7);
        assert_eq!(crc, gsp_slot_crc32(42, 7));
        assert_ne!(crc, gsp_slot_crc32(43, 7));
        assert_ne!(crc, gsp_slot_crc32(42, 8));
    }
}
