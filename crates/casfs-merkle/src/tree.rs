use casfs_types::{Digest, BLOCK_SIZE, DIGEST_LEN};

use crate::error::MerkleError;
use crate::hasher::{interior_hash, leaf_hash};

/// Size of a content chunk in bytes. Equal to the filesystem block size so
/// one data block verifies against exactly one leaf.
pub const CHUNK_SIZE: usize = BLOCK_SIZE;

/// Children per interior node.
pub const FANOUT: usize = BLOCK_SIZE / DIGEST_LEN;

/// Number of chunks covering `len` bytes. Zero-length content still has
/// one (empty) chunk, so every blob has a well-defined root.
pub fn chunk_count(len: u64) -> u64 {
    if len == 0 {
        1
    } else {
        len.div_ceil(CHUNK_SIZE as u64)
    }
}

/// Compute the root digest of `data` -- the blob's name.
pub fn compute_digest(data: &[u8]) -> Digest {
    MerkleTree::from_data(data).root()
}

/// Fixed-fanout hash tree over fixed-size content chunks.
///
/// Level 0 holds the leaf digests, one per chunk; each higher level hashes
/// groups of [`FANOUT`] children until a single root remains. A one-leaf
/// tree's root is the leaf itself, which is why single-chunk blobs need no
/// stored tree.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    /// Level 0 = leaves, last level holds only the root.
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build a tree over raw content.
    pub fn from_data(data: &[u8]) -> Self {
        let leaves: Vec<Digest> = if data.is_empty() {
            vec![leaf_hash(0, &[])]
        } else {
            data.chunks(CHUNK_SIZE)
                .enumerate()
                .map(|(i, chunk)| leaf_hash(i as u64, chunk))
                .collect()
        };
        Self::build(leaves)
    }

    /// Rebuild a tree from a stored leaf level.
    ///
    /// Used at blob open: the leaves come from the blob's tree blocks and
    /// the resulting root is compared with the recorded name before any
    /// data is served.
    pub fn from_leaves(leaves: Vec<Digest>) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::NoLeaves);
        }
        Ok(Self::build(leaves))
    }

    fn build(leaves: Vec<Digest>) -> Self {
        let mut levels = vec![leaves];
        let mut level_index: u32 = 0;
        while levels[levels.len() - 1].len() > 1 {
            level_index += 1;
            let current = &levels[levels.len() - 1];
            let next: Vec<Digest> = current
                .chunks(FANOUT)
                .map(|group| interior_hash(level_index, group))
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    /// The root digest.
    pub fn root(&self) -> Digest {
        self.levels[self.levels.len() - 1][0]
    }

    /// Number of leaves (content chunks).
    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// The leaf level.
    pub fn leaves(&self) -> &[Digest] {
        &self.levels[0]
    }

    /// Verify one chunk of content against the tree.
    ///
    /// Recomputes the leaf hash for `chunk` at `index` and compares it with
    /// the stored leaf. Out-of-range indices fail.
    pub fn verify_chunk(&self, index: u64, chunk: &[u8]) -> bool {
        match self.levels[0].get(index as usize) {
            Some(expected) => leaf_hash(index, chunk) == *expected,
            None => false,
        }
    }

    /// Serialize the leaf level as concatenated digests for the blob's
    /// tree blocks. The caller pads to a block boundary.
    pub fn leaves_to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.leaf_count() * DIGEST_LEN);
        for leaf in &self.levels[0] {
            out.extend_from_slice(leaf.as_bytes());
        }
        out
    }

    /// Decode `leaf_count` digests from stored tree-block bytes.
    pub fn leaves_from_bytes(bytes: &[u8], leaf_count: usize) -> Result<Vec<Digest>, MerkleError> {
        let needed = leaf_count * DIGEST_LEN;
        if bytes.len() < needed {
            return Err(MerkleError::LeafBufferTooShort {
                leaf_count,
                needed,
                actual: bytes.len(),
            });
        }
        Ok(bytes[..needed]
            .chunks_exact(DIGEST_LEN)
            .map(|raw| {
                let mut arr = [0u8; DIGEST_LEN];
                arr.copy_from_slice(raw);
                Digest::from_hash(arr)
            })
            .collect())
    }
}
