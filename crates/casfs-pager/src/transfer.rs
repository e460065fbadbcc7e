use casfs_device::{BlockDevice, DeviceResult};

/// Bounded batch size for page-in reads.
///
/// The pager moves blob data from storage in runs of at most
/// `capacity_blocks` blocks, so one large read cannot pin an unbounded
/// buffer. The default matches a 256 KiB transfer.
#[derive(Clone, Copy, Debug)]
pub struct TransferBuffer {
    capacity_blocks: u64,
}

impl TransferBuffer {
    /// Default transfer size in blocks.
    pub const DEFAULT_BLOCKS: u64 = 32;

    pub fn new(capacity_blocks: u64) -> Self {
        assert!(capacity_blocks > 0);
        Self { capacity_blocks }
    }

    /// Largest run a single device read may cover.
    pub fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks
    }

    /// Read `count` blocks at `block`, splitting into capacity-sized
    /// device reads.
    pub fn read_run(
        &self,
        device: &dyn BlockDevice,
        block: u64,
        count: u64,
    ) -> DeviceResult<Vec<u8>> {
        let mut out = Vec::with_capacity((count as usize) * casfs_types::BLOCK_SIZE);
        let mut at = block;
        let mut left = count;
        while left > 0 {
            let batch = left.min(self.capacity_blocks);
            out.extend_from_slice(&device.read_blocks(at, batch)?);
            at += batch;
            left -= batch;
        }
        Ok(out)
    }
}

impl Default for TransferBuffer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BLOCKS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casfs_device::{MemDevice, WriteOp};
    use casfs_types::BLOCK_SIZE;

    #[test]
    fn read_run_splits_batches() {
        let dev = MemDevice::new(8);
        for i in 0..8u64 {
            dev.write_blocks(&[WriteOp {
                block: i,
                data: vec![i as u8; BLOCK_SIZE],
            }])
            .unwrap();
        }
        let buffer = TransferBuffer::new(3);
        let reads_before = dev.read_calls();
        let data = buffer.read_run(&dev, 0, 8).unwrap();
        assert_eq!(data.len(), 8 * BLOCK_SIZE);
        for i in 0..8usize {
            assert_eq!(data[i * BLOCK_SIZE], i as u8);
        }
        // 8 blocks at capacity 3 -> 3 device reads.
        assert_eq!(dev.read_calls() - reads_before, 3);
    }
}
