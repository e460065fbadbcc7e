use std::io;

/// Errors from block device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Underlying I/O failure.
    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read or write touched blocks beyond the device capacity.
    #[error("access out of bounds: block {block} + {count} exceeds capacity {capacity}")]
    OutOfBounds { block: u64, count: u64, capacity: u64 },

    /// A write or trim was issued against a read-only device.
    #[error("device is read-only")]
    ReadOnly,

    /// A buffer length was not a multiple of the block size.
    #[error("unaligned buffer: {len} bytes is not a whole number of blocks")]
    UnalignedBuffer { len: usize },
}

/// Result alias for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;
