#![forbid(unsafe_code)]

//! The transaction log: an append-only sequence of typed records. The only
//! record type the core tree needs is the **detached checkpoint** (§6) -
//! writes themselves never touch disk until a checkpoint flushes them (see
//! [`crate::checkpoint`]), so there is nothing to redo on crash beyond
//! re-establishing the last valid checkpoint and repairing torn GSP writes
//! (§4.9, [`crate::recovery`]).
//!
//! This is a deliberate narrowing of the general-purpose write-ahead log a
//! full storage engine would carry: because every tree mutation is
//! copy-on-write against fresh pages and the old root stays live until the
//! new root is published, a crash before checkpoint simply loses whatever
//! wasn't checkpointed, which is exactly the durability contract §8's
//! "Checkpoint durability" scenario asks for.

use crate::checksum::{Checksum, Crc32Fast};
use crate::error::{GbpError, Result};
use crate::pager::io::FileIo;
use crate::types::{read_u32, read_u64, write_u32, Generation, PageId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const LOG_MAGIC: [u8; 4] = *b"GBPL";
const LOG_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 16;

const KERNEL_VERSION: u8 = 1;
const RECORD_TYPE_DETACHED_CHECKPOINT: u8 = 1;
const MAX_REASON_LEN: usize = 255;

/// A position within the log: which log file (`version`, bumped when the
/// log rotates) and byte `offset` within it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogPosition {
    pub version: u32,
    pub offset: u64,
}

/// The one mandatory record type: marks a point the tree is durable up to.
#[derive(Clone, Debug)]
pub struct DetachedCheckpoint {
    pub kernel_version: u8,
    pub position: LogPosition,
    pub timestamp_millis: u64,
    pub store_id: u64,
    pub transaction_id: u64,
    /// `page_crc32` of the root page this checkpoint names, salted with its
    /// page ID and the unstable generation it was written at. Zero for an
    /// empty tree (no root page to hash). Lets recovery notice a root page
    /// that decodes cleanly but no longer matches what was checkpointed,
    /// which the per-record frame CRC above can't catch since it only
    /// covers the log record itself, not the page the record points at.
    pub transaction_checksum: u64,
    pub commit_timestamp: u64,
    pub root: PageId,
    pub stable_generation: Generation,
    pub unstable_generation: Generation,
    pub reason: String,
}

impl DetachedCheckpoint {
    fn encode(&self) -> Vec<u8> {
        let reason_bytes = self.reason.as_bytes();
        let reason_len = reason_bytes.len().min(MAX_REASON_LEN);
        let mut buf = Vec::with_capacity(128 + reason_len);
        buf.push(RECORD_TYPE_DETACHED_CHECKPOINT);
        buf.push(self.kernel_version);
        buf.extend_from_slice(&self.position.version.to_be_bytes());
        buf.extend_from_slice(&self.position.offset.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_millis.to_be_bytes());
        buf.extend_from_slice(&self.store_id.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id.to_be_bytes());
        buf.extend_from_slice(&self.transaction_checksum.to_be_bytes());
        buf.extend_from_slice(&self.commit_timestamp.to_be_bytes());
        buf.extend_from_slice(&self.root.0.to_be_bytes());
        buf.extend_from_slice(&self.stable_generation.0.to_be_bytes());
        buf.extend_from_slice(&self.unstable_generation.0.to_be_bytes());
        buf.push(reason_len as u8);
        buf.extend_from_slice(&reason_bytes[..reason_len]);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() || buf[0] != RECORD_TYPE_DETACHED_CHECKPOINT {
            return Err(GbpError::corruption("not a detached checkpoint record"));
        }
        let mut at = 1;
        let kernel_version = read_byte(buf, &mut at)?;
        let version = read_u32_at(buf, &mut at)?;
        let offset = read_u64_at(buf, &mut at)?;
        let timestamp_millis = read_u64_at(buf, &mut at)?;
        let store_id = read_u64_at(buf, &mut at)?;
        let transaction_id = read_u64_at(buf, &mut at)?;
        let transaction_checksum = read_u64_at(buf, &mut at)?;
        let commit_timestamp = read_u64_at(buf, &mut at)?;
        let root = PageId(read_u64_at(buf, &mut at)?);
        let stable_generation = Generation(read_u64_at(buf, &mut at)?);
        let unstable_generation = Generation(read_u64_at(buf, &mut at)?);
        let reason_len = read_byte(buf, &mut at)? as usize;
        if at + reason_len > buf.len() {
            return Err(GbpError::corruption("detached checkpoint reason truncated"));
        }
        let reason = String::from_utf8_lossy(&buf[at..at + reason_len]).into_owned();
        Ok(Self {
            kernel_version,
            position: LogPosition { version, offset },
            timestamp_millis,
            store_id,
            transaction_id,
            transaction_checksum,
            commit_timestamp,
            root,
            stable_generation,
            unstable_generation,
            reason,
        })
    }
}

fn read_byte(buf: &[u8], at: &mut usize) -> Result<u8> {
    let b = *buf.get(*at).ok_or_else(|| GbpError::corruption("log record truncated"))?;
    *at += 1;
    Ok(b)
}

fn read_u32_at(buf: &[u8], at: &mut usize) -> Result<u32> {
    if *at + 4 > buf.len() {
        return Err(GbpError::corruption("log record truncated"));
    }
    let v = read_u32(buf, *at);
    *at += 4;
    Ok(v)
}

fn read_u64_at(buf: &[u8], at: &mut usize) -> Result<u64> {
    if *at + 8 > buf.len() {
        return Err(GbpError::corruption("log record truncated"));
    }
    let v = read_u64(buf, *at);
    *at += 8;
    Ok(v)
}

/// A log record wraps its payload with a length prefix and a CRC32 so a
/// torn trailing write (the last thing appended before a crash) is
/// detectable and simply truncates replay rather than corrupting it.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut hasher = Crc32Fast::default();
    hasher.update(payload);
    let crc = hasher.finalize();
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

struct FileHeader {
    version: u32,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        write_u32(&mut buf, 4, LOG_FORMAT_VERSION as u32);
        write_u32(&mut buf, 8, self.version);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_LEN || buf[0..4] != LOG_MAGIC {
            return Err(GbpError::corruption("log magic mismatch"));
        }
        let format_version = read_u32(buf, 4);
        if format_version != LOG_FORMAT_VERSION as u32 {
            return Err(GbpError::FormatMismatch { found: format_version as u16, minimum: LOG_FORMAT_VERSION });
        }
        Ok(Self { version: read_u32(buf, 8) })
    }
}

/// Append-only log of [`DetachedCheckpoint`] records.
pub struct TransactionLog {
    io: Arc<dyn FileIo>,
    append_offset: AtomicU64,
    file_version: u32,
}

impl TransactionLog {
    pub fn open(io: Arc<dyn FileIo>, file_version: u32) -> Result<Self> {
        let len = io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader { version: file_version };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            return Ok(Self { io, append_offset: AtomicU64::new(FILE_HEADER_LEN as u64), file_version });
        }
        let mut buf = [0u8; FILE_HEADER_LEN];
        io.read_at(0, &mut buf)?;
        let header = FileHeader::decode(&buf)?;
        Ok(Self { io, append_offset: AtomicU64::new(len), file_version: header.version })
    }

    pub fn file_version(&self) -> u32 {
        self.file_version
    }

    pub fn append_checkpoint(&self, record: &DetachedCheckpoint) -> Result<LogPosition> {
        let payload = record.encode();
        let encoded = frame(&payload);
        let offset = self.append_offset.fetch_add(encoded.len() as u64, Ordering::AcqRel);
        self.io.write_at(offset, &encoded)?;
        Ok(LogPosition { version: self.file_version, offset })
    }

    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Iterate every well-formed checkpoint record from the start of the
    /// log, stopping at the first truncated or corrupt frame (a crash mid
    /// append) rather than erroring - that frame simply never completed.
    pub fn iter(&self) -> Result<LogIterator<'_>> {
        let len = self.io.len()?;
        Ok(LogIterator { log: self, offset: FILE_HEADER_LEN as u64, end: len })
    }

    /// Drop every record and start a fresh log at the current file version
    /// plus one - used after a vacuum or deliberate log rotation.
    pub fn reset(&self, next_version: u32) -> Result<()> {
        let header = FileHeader { version: next_version };
        self.io.write_at(0, &header.encode())?;
        self.io.truncate(FILE_HEADER_LEN as u64)?;
        self.append_offset.store(FILE_HEADER_LEN as u64, Ordering::Release);
        Ok(())
    }
}

pub struct LogIterator<'a> {
    log: &'a TransactionLog,
    offset: u64,
    end: u64,
}

impl Iterator for LogIterator<'_> {
    type Item = DetachedCheckpoint;

    fn next(&mut self) -> Option<DetachedCheckpoint> {
        if self.offset + 4 > self.end {
            return None;
        }
        let mut len_buf = [0u8; 4];
        if self.log.io.read_at(self.offset, &mut len_buf).is_err() {
            return None;
        }
        let payload_len = read_u32(&len_buf, 0) as u64;
        let frame_len = 4 + payload_len + 4;
        if self.offset + frame_len > self.end {
            return None;
        }
        let mut payload = vec![0u8; payload_len as usize];
        if self.log.io.read_at(self.offset + 4, &mut payload).is_err() {
            return None;
        }
        let mut crc_buf = [0u8; 4];
        if self.log.io.read_at(self.offset + 4 + payload_len, &mut crc_buf).is_err() {
            return None;
        }
        let mut hasher = Crc32Fast::default();
        hasher.update(&payload);
        if hasher.finalize() != read_u32(&crc_buf, 0) {
            return None;
        }
        let record = DetachedCheckpoint::decode(&payload).ok()?;
        self.offset += frame_len;
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::io::StdFileIo;
    use tempfile::tempdir;

    fn sample(reason: &str) -> DetachedCheckpoint {
        DetachedCheckpoint {
            kernel_version: KERNEL_VERSION,
            position: LogPosition { version: 1, offset: 0 },
            timestamp_millis: 1_000,
            store_id: 42,
            transaction_id: 7,
            transaction_checksum: 0xdead_beef,
            commit_timestamp: 1_001,
            root: PageId(3),
            stable_generation: Generation(5),
            unstable_generation: Generation(6),
            reason: reason.to_string(),
        }
    }

    #[test]
    fn append_and_iterate_round_trips() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("log")).unwrap();
        let log = TransactionLog::open(Arc::new(io), 1).unwrap();
        log.append_checkpoint(&sample("periodic")).unwrap();
        log.append_checkpoint(&sample("shutdown")).unwrap();

        let records: Vec<_> = log.iter().unwrap().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].reason, "periodic");
        assert_eq!(records[1].reason, "shutdown");
        assert_eq!(records[1].stable_generation, Generation(5));
    }

    #[test]
    fn truncated_trailing_frame_stops_iteration_without_erroring() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let io = StdFileIo::open(&path).unwrap();
        let log = TransactionLog::open(Arc::new(io.clone()), 1).unwrap();
        log.append_checkpoint(&sample("first")).unwrap();
        let good_len = io.len().unwrap();
        log.append_checkpoint(&sample("second")).unwrap();
        // Truncate mid-second-frame, simulating a crash during append.
        io.truncate(good_len + 5).unwrap();

        let records: Vec<_> = log.iter().unwrap().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, "first");
    }
}
