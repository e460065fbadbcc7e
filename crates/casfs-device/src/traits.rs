use casfs_types::BlockIndex;

use crate::error::DeviceResult;

/// A single block-aligned write.
#[derive(Clone, Debug)]
pub struct WriteOp {
    /// Device-absolute block number of the first block written.
    pub block: BlockIndex,
    /// Data to write; length must be a whole number of blocks.
    pub data: Vec<u8>,
}

/// Outcome of an address-space extension request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtendStatus {
    /// The physical range was added.
    Extended,
    /// The backing storage has no room for the requested range. This is a
    /// normal, non-fatal condition.
    NoRoom,
}

/// Block-granular storage collaborator.
///
/// All offsets are device-absolute block numbers. Implementations must be
/// thread-safe; the journal worker, the pager, and the mounting thread all
/// hold the same device handle. None of these methods may be assumed to
/// succeed -- every caller propagates failures.
pub trait BlockDevice: Send + Sync {
    /// Read `count` blocks starting at `block` into a fresh buffer.
    fn read_blocks(&self, block: BlockIndex, count: u64) -> DeviceResult<Vec<u8>>;

    /// Apply a batch of block writes. The batch carries no atomicity
    /// guarantee; durability requires a subsequent [`flush`](Self::flush).
    fn write_blocks(&self, ops: &[WriteOp]) -> DeviceResult<()>;

    /// Make all previously written data durable.
    fn flush(&self) -> DeviceResult<()>;

    /// Device capacity in blocks.
    fn capacity(&self) -> DeviceResult<u64>;

    /// Hint that a block range no longer holds live data.
    ///
    /// Advisory: errors other than [`DeviceError::ReadOnly`] may be logged
    /// and ignored by callers.
    fn trim(&self, block: BlockIndex, count: u64) -> DeviceResult<()>;

    /// Whether the device accepts writes.
    fn is_read_only(&self) -> bool;

    /// Whether [`trim`](Self::trim) does anything useful.
    fn supports_trim(&self) -> bool;
}

/// Dynamic-partition collaborator used by the volume grower.
///
/// Separate from [`BlockDevice`] because growth is a property of the
/// volume manager sitting under the device, not of block I/O itself.
pub trait VolumeManager: Send + Sync {
    /// Request that `[offset, offset + length)` (blocks) become part of the
    /// physical address space. Returns [`ExtendStatus::NoRoom`] when the
    /// backing storage cannot grow that far.
    fn extend_address_space(&self, offset: BlockIndex, length: u64) -> DeviceResult<ExtendStatus>;
}
