//! On-disk journal codecs.
//!
//! The journal region holds one header (checkpoint) block followed by a
//! ring of entry blocks. Every record is CRC-framed; a failed check during
//! replay marks the end of the valid log, the same way a torn tail write
//! would.
//!
//! Entry frame, starting at a block boundary in the ring:
//!
//! ```text
//! [4  bytes: entry magic "CJE1"]
//! [8  bytes: sequence number (little-endian u64)]
//! [4  bytes: payload length (little-endian u32)]
//! [4  bytes: CRC32 of payload (little-endian u32)]
//! [N  bytes: payload (bincode-serialized Vec<JournalOp>)]
//! [zero padding to a block boundary]
//! ```
//!
//! Entries never straddle the ring's wrap point: the writer skips a tail
//! fragment too small for the frame and continues at offset zero.

use casfs_types::BLOCK_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::{JournalError, JournalResult};

/// Magic for the journal header block.
pub(crate) const HEADER_MAGIC: u64 = u64::from_le_bytes(*b"casfsjn1");

/// Magic for an entry frame.
pub(crate) const ENTRY_MAGIC: u32 = u32::from_le_bytes(*b"CJE1");

/// Bytes of frame metadata ahead of the payload.
pub(crate) const ENTRY_HEADER_LEN: usize = 20;

/// One journaled metadata write: full blocks destined for a final,
/// device-absolute location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalOp {
    /// Device-absolute block number of the first target block.
    pub target: u64,
    /// Block-aligned data to place there.
    pub data: Vec<u8>,
}

/// Checkpoint state stored in the journal header block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct JournalHeader {
    /// Ring offset (blocks) of the oldest live entry; equals the tail when
    /// the ring is empty.
    pub head_offset: u64,
    /// Sequence number expected at `head_offset`.
    pub head_seq: u64,
}

impl JournalHeader {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[0..8].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        block[8..16].copy_from_slice(&self.head_offset.to_le_bytes());
        block[16..24].copy_from_slice(&self.head_seq.to_le_bytes());
        let crc = crc32fast::hash(&block[0..24]);
        block[24..28].copy_from_slice(&crc.to_le_bytes());
        block
    }

    pub(crate) fn decode(block: &[u8]) -> JournalResult<Self> {
        if block.len() < 28 {
            return Err(JournalError::CorruptHeader {
                reason: format!("header block truncated to {} bytes", block.len()),
            });
        }
        let magic = u64::from_le_bytes(block[0..8].try_into().expect("sliced"));
        if magic != HEADER_MAGIC {
            return Err(JournalError::CorruptHeader {
                reason: format!("bad magic {magic:#018x}"),
            });
        }
        let expected_crc = u32::from_le_bytes(block[24..28].try_into().expect("sliced"));
        let actual_crc = crc32fast::hash(&block[0..24]);
        if actual_crc != expected_crc {
            return Err(JournalError::CorruptHeader {
                reason: format!("crc mismatch: stored {expected_crc:#010x}, computed {actual_crc:#010x}"),
            });
        }
        Ok(Self {
            head_offset: u64::from_le_bytes(block[8..16].try_into().expect("sliced")),
            head_seq: u64::from_le_bytes(block[16..24].try_into().expect("sliced")),
        })
    }
}

/// Serialize an entry to its block-padded frame.
pub(crate) fn encode_entry(seq: u64, ops: &[JournalOp]) -> JournalResult<Vec<u8>> {
    let payload =
        bincode::serialize(ops).map_err(|e| JournalError::Serialization(e.to_string()))?;
    let crc = crc32fast::hash(&payload);

    let framed_len = ENTRY_HEADER_LEN + payload.len();
    let padded_len = framed_len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

    let mut frame = Vec::with_capacity(padded_len);
    frame.extend_from_slice(&ENTRY_MAGIC.to_le_bytes());
    frame.extend_from_slice(&seq.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.resize(padded_len, 0);
    Ok(frame)
}

/// Parsed frame header from the first block of an entry.
pub(crate) struct EntryHead {
    pub seq: u64,
    pub payload_len: usize,
    pub payload_crc: u32,
}

impl EntryHead {
    /// Total blocks this entry occupies.
    pub(crate) fn blocks(&self) -> u64 {
        ((ENTRY_HEADER_LEN + self.payload_len) as u64).div_ceil(BLOCK_SIZE as u64)
    }
}

/// Parse the frame header at the start of `block`. `None` means the bytes
/// do not begin a valid frame (end of log, stale data, or torn write).
pub(crate) fn parse_entry_head(block: &[u8], ring_blocks: u64) -> Option<EntryHead> {
    if block.len() < ENTRY_HEADER_LEN {
        return None;
    }
    let magic = u32::from_le_bytes(block[0..4].try_into().expect("sliced"));
    if magic != ENTRY_MAGIC {
        return None;
    }
    let seq = u64::from_le_bytes(block[4..12].try_into().expect("sliced"));
    let payload_len = u32::from_le_bytes(block[12..16].try_into().expect("sliced")) as usize;
    let payload_crc = u32::from_le_bytes(block[16..20].try_into().expect("sliced"));

    let head = EntryHead {
        seq,
        payload_len,
        payload_crc,
    };
    if head.blocks() > ring_blocks {
        return None;
    }
    Some(head)
}

/// Validate and decode an assembled frame's payload.
pub(crate) fn decode_payload(head: &EntryHead, frame: &[u8]) -> Option<Vec<JournalOp>> {
    let end = ENTRY_HEADER_LEN + head.payload_len;
    if frame.len() < end {
        return None;
    }
    let payload = &frame[ENTRY_HEADER_LEN..end];
    if crc32fast::hash(payload) != head.payload_crc {
        return None;
    }
    bincode::deserialize(payload).ok()
}
