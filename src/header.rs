#![forbid(unsafe_code)]

//! The tree's metadata page (page 0): magic, format version, the root GSP,
//! the stable/unstable generation pair, the last committed transaction ID,
//! and a caller-supplied header blob. This is the one page every other
//! module treats as special - everything else is a leaf, internal, or
//! offload page.

use crate::checksum::page_crc32;
use crate::error::{GbpError, Result};
use crate::pager::gsp::{Gsp, GSP_SIZE};
use crate::types::{read_u32, read_u64, write_u32, write_u64, Generation, Lsn};

const MAGIC: [u8; 8] = *b"GBPTREE\0";
pub const CURRENT_FORMAT_VERSION: u16 = 1;
pub const MIN_SUPPORTED_FORMAT_VERSION: u16 = 1;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 8;
const PAGE_SIZE_OFFSET: usize = 10;
const ROOT_GSP_OFFSET: usize = 14;
const LAST_TX_OFFSET: usize = ROOT_GSP_OFFSET + GSP_SIZE;
const STABLE_OFFSET: usize = LAST_TX_OFFSET + 8;
const UNSTABLE_OFFSET: usize = STABLE_OFFSET + 8;
const USER_HEADER_LEN_OFFSET: usize = UNSTABLE_OFFSET + 8;
const USER_HEADER_OFFSET: usize = USER_HEADER_LEN_OFFSET + 4;

/// Bytes of fixed metadata ahead of the variable-length user header blob.
pub const FIXED_METADATA_SIZE: usize = USER_HEADER_OFFSET;

#[derive(Clone, Debug)]
pub struct MetadataPage {
    pub format_version: u16,
    pub page_size: u32,
    pub root: Gsp,
    pub last_committed_tx: Lsn,
    pub stable: Generation,
    pub unstable: Generation,
    pub user_header: Vec<u8>,
}

impl MetadataPage {
    pub fn fresh(page_size: u32) -> Self {
        Self {
            format_version: CURRENT_FORMAT_VERSION,
            page_size,
            root: Gsp::empty(),
            last_committed_tx: Lsn(0),
            stable: Generation::MIN_GEN,
            unstable: Generation(Generation::MIN_GEN.0 + 1),
            user_header: Vec::new(),
        }
    }

    pub fn encode(&self, page: &mut [u8]) -> Result<()> {
        let total = USER_HEADER_OFFSET + self.user_header.len() + 4;
        if total > page.len() {
            return Err(GbpError::InvalidArgument("user header too large for metadata page".into()));
        }
        page[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(&MAGIC);
        page[VERSION_OFFSET..VERSION_OFFSET + 2].copy_from_slice(&self.format_version.to_be_bytes());
        write_u32(page, PAGE_SIZE_OFFSET, self.page_size);
        self.root.encode(&mut page[ROOT_GSP_OFFSET..ROOT_GSP_OFFSET + GSP_SIZE]);
        write_u64(page, LAST_TX_OFFSET, self.last_committed_tx.0);
        write_u64(page, STABLE_OFFSET, self.stable.0);
        write_u64(page, UNSTABLE_OFFSET, self.unstable.0);
        write_u32(page, USER_HEADER_LEN_OFFSET, self.user_header.len() as u32);
        page[USER_HEADER_OFFSET..USER_HEADER_OFFSET + self.user_header.len()]
            .copy_from_slice(&self.user_header);
        let checksum_offset = USER_HEADER_OFFSET + self.user_header.len();
        let crc = page_crc32(0, self.stable.0, &page[0..checksum_offset]);
        write_u32(page, checksum_offset, crc);
        Ok(())
    }

    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < USER_HEADER_OFFSET + 4 || page[MAGIC_OFFSET..MAGIC_OFFSET + 8] != MAGIC {
            return Err(GbpError::corruption("metadata page magic mismatch"));
        }
        let format_version = u16::from_be_bytes(page[VERSION_OFFSET..VERSION_OFFSET + 2].try_into().unwrap());
        if format_version < MIN_SUPPORTED_FORMAT_VERSION {
            return Err(GbpError::FormatMismatch { found: format_version, minimum: MIN_SUPPORTED_FORMAT_VERSION });
        }
        let page_size = read_u32(page, PAGE_SIZE_OFFSET);
        let root = Gsp::decode(&page[ROOT_GSP_OFFSET..ROOT_GSP_OFFSET + GSP_SIZE])?;
        let last_committed_tx = Lsn(read_u64(page, LAST_TX_OFFSET));
        let stable = Generation(read_u64(page, STABLE_OFFSET));
        let unstable = Generation(read_u64(page, UNSTABLE_OFFSET));
        let user_header_len = read_u32(page, USER_HEADER_LEN_OFFSET) as usize;
        let checksum_offset = USER_HEADER_OFFSET + user_header_len;
        if checksum_offset + 4 > page.len() {
            return Err(GbpError::corruption("metadata page user header length out of bounds"));
        }
        let stored_crc = read_u32(page, checksum_offset);
        let crc = page_crc32(0, stable.0, &page[0..checksum_offset]);
        if crc != stored_crc {
            return Err(GbpError::corruption("metadata page checksum mismatch"));
        }
        let user_header = page[USER_HEADER_OFFSET..checksum_offset].to_vec();
        Ok(Self {
            format_version,
            page_size,
            root,
            last_committed_tx,
            stable,
            unstable,
            user_header,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageId;

    #[test]
    fn round_trips_with_user_header() {
        let mut meta = MetadataPage::fresh(4096);
        meta.root = Gsp::empty().write(PageId(5), meta.unstable);
        meta.user_header = b"caller-defined blob".to_vec();
        let mut page = vec![0u8; 4096];
        meta.encode(&mut page).unwrap();

        let decoded = MetadataPage::decode(&page).unwrap();
        assert_eq!(decoded.user_header, b"caller-defined blob");
        assert_eq!(decoded.root.read(decoded.unstable), PageId(5));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let page = vec![0u8; 4096];
        assert!(MetadataPage::decode(&page).is_err());
    }

    #[test]
    fn decode_rejects_tampered_checksum() {
        let meta = MetadataPage::fresh(4096);
        let mut page = vec![0u8; 4096];
        meta.encode(&mut page).unwrap();
        page[USER_HEADER_OFFSET - 1] ^= 0xff;
        assert!(MetadataPage::decode(&page).is_err());
    }

    #[test]
    fn decode_rejects_format_older_than_minimum() {
        let meta = MetadataPage::fresh(4096);
        let mut page = vec![0u8; 4096];
        meta.encode(&mut page).unwrap();
        page[VERSION_OFFSET..VERSION_OFFSET + 2].copy_from_slice(&0u16.to_be_bytes());
        match MetadataPage::decode(&page) {
            Err(GbpError::FormatMismatch { found: 0, .. }) => {}
            other => panic!("expected FormatMismatch, got {other:?}"),
        }
    }
}
