//! On-disk geometry constants.
//!
//! The format is built around a fixed 8 KiB block. Merkle chunks, bitmap
//! granularity, node records, and journal entries are all expressed in this
//! unit so that every region boundary is block-aligned.

/// Size of a filesystem block in bytes. Also the merkle chunk size.
pub const BLOCK_SIZE: usize = 8192;

/// Length of a content digest in bytes (BLAKE3).
pub const DIGEST_LEN: usize = 32;

/// Size of one node record in the node map, in bytes.
pub const NODE_SIZE: usize = 128;

/// Node records per node-map block.
pub const NODES_PER_BLOCK: usize = BLOCK_SIZE / NODE_SIZE;

/// Data blocks addressed by a single block-bitmap block.
pub const BITS_PER_BITMAP_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;

/// Merkle leaf digests per tree block.
pub const DIGESTS_PER_BLOCK: usize = BLOCK_SIZE / DIGEST_LEN;

/// Sentinel node index meaning "no next node" in a chain.
pub const NODE_NIL: u32 = u32::MAX;

/// Longest run a single packed extent can describe, in blocks.
pub const MAX_EXTENT_LENGTH: u64 = u16::MAX as u64;

/// Number of blocks needed to hold `bytes` bytes.
pub const fn blocks_for_bytes(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE as u64)
}

const _: () = {
    assert!(BLOCK_SIZE % NODE_SIZE == 0);
    assert!(BLOCK_SIZE % DIGEST_LEN == 0);
};
