use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use casfs_types::{BlockIndex, BLOCK_SIZE};
use tracing::debug;

use crate::error::{DeviceError, DeviceResult};
use crate::traits::{BlockDevice, ExtendStatus, VolumeManager, WriteOp};

/// In-memory block device for tests and embedding.
///
/// Backed by a `RwLock`-guarded byte vector. The device also implements
/// [`VolumeManager`], growing the vector on demand up to `max_blocks`, so a
/// single object can stand in for the whole storage stack under a mounted
/// filesystem. Read and flush counters let tests assert paging behavior
/// (e.g. that a NeverEvict cache never re-reads a block).
pub struct MemDevice {
    bytes: RwLock<Vec<u8>>,
    max_blocks: u64,
    read_only: bool,
    trim_support: bool,
    read_calls: AtomicU64,
    flush_calls: AtomicU64,
}

impl MemDevice {
    /// Create a device with `blocks` blocks of zeroed storage that cannot
    /// grow beyond its initial capacity.
    pub fn new(blocks: u64) -> Self {
        Self::with_limit(blocks, blocks)
    }

    /// Create a device with `blocks` blocks that the volume manager may
    /// grow up to `max_blocks`.
    pub fn with_limit(blocks: u64, max_blocks: u64) -> Self {
        assert!(max_blocks >= blocks);
        Self {
            bytes: RwLock::new(vec![0u8; (blocks as usize) * BLOCK_SIZE]),
            max_blocks,
            read_only: false,
            trim_support: true,
            read_calls: AtomicU64::new(0),
            flush_calls: AtomicU64::new(0),
        }
    }

    /// Mark the device read-only.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Disable trim support.
    pub fn set_trim_support(&mut self, trim: bool) {
        self.trim_support = trim;
    }

    /// Number of `read_blocks` calls served so far.
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    /// Number of `flush` calls served so far.
    pub fn flush_calls(&self) -> u64 {
        self.flush_calls.load(Ordering::Relaxed)
    }

    /// Copy of the entire device contents, for crash-simulation tests that
    /// reopen a byte-identical image.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().expect("lock poisoned").clone()
    }

    /// Build a device from a raw image, e.g. a [`snapshot`](Self::snapshot)
    /// taken before a simulated crash.
    pub fn from_image(image: Vec<u8>, max_blocks: u64) -> Self {
        assert_eq!(image.len() % BLOCK_SIZE, 0, "image must be block-aligned");
        assert!(max_blocks * BLOCK_SIZE as u64 >= image.len() as u64);
        Self {
            bytes: RwLock::new(image),
            max_blocks,
            read_only: false,
            trim_support: true,
            read_calls: AtomicU64::new(0),
            flush_calls: AtomicU64::new(0),
        }
    }

    fn check_range(&self, block: BlockIndex, count: u64, len: usize) -> DeviceResult<()> {
        let capacity = (len / BLOCK_SIZE) as u64;
        let end = block.checked_add(count).ok_or(DeviceError::OutOfBounds {
            block,
            count,
            capacity,
        })?;
        if end > capacity {
            return Err(DeviceError::OutOfBounds {
                block,
                count,
                capacity,
            });
        }
        Ok(())
    }
}

impl BlockDevice for MemDevice {
    fn read_blocks(&self, block: BlockIndex, count: u64) -> DeviceResult<Vec<u8>> {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        let bytes = self.bytes.read().expect("lock poisoned");
        self.check_range(block, count, bytes.len())?;
        let start = (block as usize) * BLOCK_SIZE;
        let end = start + (count as usize) * BLOCK_SIZE;
        Ok(bytes[start..end].to_vec())
    }

    fn write_blocks(&self, ops: &[WriteOp]) -> DeviceResult<()> {
        if self.read_only {
            return Err(DeviceError::ReadOnly);
        }
        let mut bytes = self.bytes.write().expect("lock poisoned");
        for op in ops {
            if op.data.len() % BLOCK_SIZE != 0 {
                return Err(DeviceError::UnalignedBuffer { len: op.data.len() });
            }
            let count = (op.data.len() / BLOCK_SIZE) as u64;
            self.check_range(op.block, count, bytes.len())?;
            let start = (op.block as usize) * BLOCK_SIZE;
            bytes[start..start + op.data.len()].copy_from_slice(&op.data);
        }
        Ok(())
    }

    fn flush(&self) -> DeviceResult<()> {
        if self.read_only {
            // Flushing a read-only device is a no-op, not an error.
            return Ok(());
        }
        self.flush_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn capacity(&self) -> DeviceResult<u64> {
        let bytes = self.bytes.read().expect("lock poisoned");
        Ok((bytes.len() / BLOCK_SIZE) as u64)
    }

    fn trim(&self, block: BlockIndex, count: u64) -> DeviceResult<()> {
        if self.read_only {
            return Err(DeviceError::ReadOnly);
        }
        let mut bytes = self.bytes.write().expect("lock poisoned");
        self.check_range(block, count, bytes.len())?;
        // Model trim as zeroing so tests can observe discarded ranges.
        let start = (block as usize) * BLOCK_SIZE;
        let end = start + (count as usize) * BLOCK_SIZE;
        bytes[start..end].fill(0);
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn supports_trim(&self) -> bool {
        self.trim_support
    }
}

impl VolumeManager for MemDevice {
    fn extend_address_space(&self, offset: BlockIndex, length: u64) -> DeviceResult<ExtendStatus> {
        if self.read_only {
            return Err(DeviceError::ReadOnly);
        }
        let mut bytes = self.bytes.write().expect("lock poisoned");
        let current = (bytes.len() / BLOCK_SIZE) as u64;
        let wanted = offset.saturating_add(length);
        if wanted <= current {
            // Already addressable.
            return Ok(ExtendStatus::Extended);
        }
        if wanted > self.max_blocks {
            debug!(wanted, max = self.max_blocks, "extend refused: no room");
            return Ok(ExtendStatus::NoRoom);
        }
        bytes.resize((wanted as usize) * BLOCK_SIZE, 0);
        debug!(from = current, to = wanted, "address space extended");
        Ok(ExtendStatus::Extended)
    }
}

impl std::fmt::Debug for MemDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDevice")
            .field("capacity", &self.capacity().unwrap_or(0))
            .field("max_blocks", &self.max_blocks)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_of(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dev = MemDevice::new(4);
        dev.write_blocks(&[WriteOp {
            block: 2,
            data: block_of(0xAB),
        }])
        .unwrap();
        let back = dev.read_blocks(2, 1).unwrap();
        assert_eq!(back, block_of(0xAB));
    }

    #[test]
    fn multi_block_write() {
        let dev = MemDevice::new(4);
        let mut data = block_of(1);
        data.extend_from_slice(&block_of(2));
        dev.write_blocks(&[WriteOp { block: 1, data }]).unwrap();
        assert_eq!(dev.read_blocks(1, 1).unwrap(), block_of(1));
        assert_eq!(dev.read_blocks(2, 1).unwrap(), block_of(2));
    }

    #[test]
    fn out_of_bounds_read_fails() {
        let dev = MemDevice::new(2);
        let err = dev.read_blocks(1, 2).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfBounds { .. }));
    }

    #[test]
    fn unaligned_write_fails() {
        let dev = MemDevice::new(2);
        let err = dev
            .write_blocks(&[WriteOp {
                block: 0,
                data: vec![0u8; 100],
            }])
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnalignedBuffer { len: 100 }));
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut dev = MemDevice::new(2);
        dev.set_read_only(true);
        let err = dev
            .write_blocks(&[WriteOp {
                block: 0,
                data: block_of(1),
            }])
            .unwrap_err();
        assert!(matches!(err, DeviceError::ReadOnly));
    }

    #[test]
    fn trim_zeroes_range() {
        let dev = MemDevice::new(3);
        dev.write_blocks(&[WriteOp {
            block: 1,
            data: block_of(0xFF),
        }])
        .unwrap();
        dev.trim(1, 1).unwrap();
        assert_eq!(dev.read_blocks(1, 1).unwrap(), block_of(0));
    }

    #[test]
    fn read_counter_counts() {
        let dev = MemDevice::new(2);
        assert_eq!(dev.read_calls(), 0);
        dev.read_blocks(0, 1).unwrap();
        dev.read_blocks(0, 1).unwrap();
        assert_eq!(dev.read_calls(), 2);
    }

    #[test]
    fn extend_within_limit() {
        let dev = MemDevice::with_limit(2, 10);
        assert_eq!(
            dev.extend_address_space(2, 3).unwrap(),
            ExtendStatus::Extended
        );
        assert_eq!(dev.capacity().unwrap(), 5);
        // New region reads as zeros.
        assert_eq!(dev.read_blocks(4, 1).unwrap(), block_of(0));
    }

    #[test]
    fn extend_beyond_limit_is_no_room() {
        let dev = MemDevice::with_limit(2, 4);
        assert_eq!(
            dev.extend_address_space(2, 10).unwrap(),
            ExtendStatus::NoRoom
        );
        assert_eq!(dev.capacity().unwrap(), 2);
    }

    #[test]
    fn snapshot_reopen_preserves_contents() {
        let dev = MemDevice::new(2);
        dev.write_blocks(&[WriteOp {
            block: 0,
            data: block_of(7),
        }])
        .unwrap();
        let image = dev.snapshot();
        let reopened = MemDevice::from_image(image, 2);
        assert_eq!(reopened.read_blocks(0, 1).unwrap(), block_of(7));
    }
}
