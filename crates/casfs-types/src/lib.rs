//! Foundation types for casfs.
//!
//! casfs stores immutable blobs named by the BLAKE3 merkle root of their
//! content. This crate holds the types every other casfs crate speaks:
//!
//! - [`Digest`] -- a 32-byte content identifier (a blob's name *is* its
//!   root digest)
//! - [`Extent`] -- a contiguous run of data blocks, packed into a `u64`
//!   on disk
//! - geometry constants describing the fixed 8 KiB block format
//!
//! Nothing here performs I/O; these are pure value types shared across the
//! allocator, journal, pager, and core crates.

pub mod digest;
pub mod error;
pub mod extent;
pub mod geometry;

pub use digest::Digest;
pub use error::TypeError;
pub use extent::Extent;
pub use geometry::{
    blocks_for_bytes, BITS_PER_BITMAP_BLOCK, BLOCK_SIZE, DIGESTS_PER_BLOCK, DIGEST_LEN,
    MAX_EXTENT_LENGTH, NODES_PER_BLOCK, NODE_NIL, NODE_SIZE,
};

/// Index of a node slot in the node map.
pub type NodeIndex = u32;

/// Index of a block. Depending on context this is either device-absolute or
/// relative to the start of the data region; APIs say which.
pub type BlockIndex = u64;
