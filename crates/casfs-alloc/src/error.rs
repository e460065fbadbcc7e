/// Errors from allocator operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllocError {
    /// Not enough free blocks or node slots to satisfy a reservation.
    /// A normal failure: nothing was claimed.
    #[error("out of space: requested {requested} {what}, {free} free")]
    OutOfSpace {
        what: &'static str,
        requested: u64,
        free: u64,
    },

    /// An extent or node slot was freed that the bitmap does not show as
    /// allocated. Indicates metadata corruption.
    #[error("double free: {what} {index} is not allocated")]
    DoubleFree { what: &'static str, index: u64 },

    /// A reservation was promoted onto bits that are already allocated.
    /// Indicates metadata corruption.
    #[error("bit {index} already allocated during promotion")]
    AlreadyAllocated { index: u64 },

    /// An extent reached past the end of the bitmap.
    #[error("range {start}+{length} exceeds bitmap size {size}")]
    RangeOutOfBounds { start: u64, length: u64, size: u64 },
}

/// Result alias for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;
