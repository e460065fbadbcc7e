/// Errors from parsing or constructing foundation types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TypeError {
    /// A hex string could not be decoded.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// A byte string had the wrong length for the target type.
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// An extent's start or length does not fit the packed representation.
    #[error("extent out of range: start={start}, length={length}")]
    ExtentOutOfRange { start: u64, length: u64 },

    /// Extents must cover at least one block.
    #[error("extent length must be non-zero")]
    EmptyExtent,
}
