//! Content verifier for casfs.
//!
//! Every blob is named by the root of a fixed-fanout BLAKE3 hash tree built
//! over its content in [`CHUNK_SIZE`] chunks. The name is *derived* from
//! the data, never chosen: creation computes the tree, lookup verifies it,
//! and no byte of blob data reaches a reader before its chunk has been
//! checked against the tree.
//!
//! Leaf hashes are salted with the chunk index and a domain tag, interior
//! hashes with the level and a different tag, so chunks cannot be
//! transposed and leaves cannot be replayed as interior nodes.
//!
//! A blob of at most one chunk has no stored tree; its name is the leaf
//! hash itself. Larger blobs persist the leaf level in tree blocks ahead
//! of their data; [`MerkleTree::from_leaves`] rebuilds the upper levels
//! and the root is compared against the recorded name before any chunk is
//! served.

pub mod error;
pub mod hasher;
pub mod tree;

pub use error::MerkleError;
pub use hasher::{interior_hash, leaf_hash};
pub use tree::{chunk_count, compute_digest, MerkleTree, CHUNK_SIZE, FANOUT};
