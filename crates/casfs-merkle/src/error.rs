/// Errors from merkle tree construction and decoding.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MerkleError {
    /// A stored leaf buffer does not hold the expected number of digests.
    #[error("leaf buffer too short: need {needed} bytes for {leaf_count} leaves, have {actual}")]
    LeafBufferTooShort {
        leaf_count: usize,
        needed: usize,
        actual: usize,
    },

    /// A tree was asked to cover zero leaves.
    #[error("merkle tree requires at least one leaf")]
    NoLeaves,
}
