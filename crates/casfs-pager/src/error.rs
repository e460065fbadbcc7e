use casfs_device::DeviceError;
use casfs_merkle::MerkleError;
use casfs_types::{Digest, NodeIndex};

/// Errors from the pager and blob cache.
#[derive(Debug, thiserror::Error)]
pub enum PagerError {
    /// Underlying device failure during page-in.
    #[error("pager device error: {0}")]
    Device(#[from] DeviceError),

    /// A paged-in chunk failed merkle verification. Fatal for this blob;
    /// the read returns no data.
    #[error("corrupt blob {digest}: chunk {chunk} failed verification")]
    Corruption { digest: Digest, chunk: u64 },

    /// Stored leaves do not hash to the blob's recorded name.
    #[error("corrupt blob {digest}: merkle root mismatch (computed {computed})")]
    RootMismatch { digest: Digest, computed: Digest },

    /// Compressed payload did not decompress to the recorded size.
    #[error("corrupt blob {digest}: decompressed {actual} bytes, expected {expected}")]
    SizeMismatch {
        digest: Digest,
        expected: u64,
        actual: u64,
    },

    /// Compressed payload could not be decoded.
    #[error("corrupt blob {digest}: decompression failed: {reason}")]
    Decompression { digest: Digest, reason: String },

    /// Two allocated nodes carry the same root digest.
    #[error("duplicate digest {digest} (nodes {existing} and {new})")]
    DuplicateDigest {
        digest: Digest,
        existing: NodeIndex,
        new: NodeIndex,
    },

    /// Two cache entries were registered for one node slot.
    #[error("node {node} already has a cache entry")]
    DuplicateNode { node: NodeIndex },

    /// An entry with open handles was removed.
    #[error("blob {digest} is open ({open_count} handles)")]
    StillOpen { digest: Digest, open_count: u32 },

    /// Malformed stored tree.
    #[error(transparent)]
    Merkle(#[from] MerkleError),
}

/// Result alias for pager operations.
pub type PagerResult<T> = Result<T, PagerError>;
