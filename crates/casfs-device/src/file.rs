use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use casfs_types::{BlockIndex, BLOCK_SIZE};
use tracing::debug;

use crate::error::{DeviceError, DeviceResult};
use crate::traits::{BlockDevice, WriteOp};

/// Block device backed by an image file.
///
/// Uses positioned reads and writes, so a single shared handle serves
/// concurrent callers without seek coordination. Durability comes from
/// `sync_data` on [`flush`](BlockDevice::flush). The image size must be a
/// whole number of blocks.
pub struct FileDevice {
    file: File,
    path: PathBuf,
    read_only: bool,
}

impl FileDevice {
    /// Open an existing image file.
    pub fn open(path: &Path, read_only: bool) -> DeviceResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(DeviceError::UnalignedBuffer { len: len as usize });
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            read_only,
        })
    }

    /// Create (or truncate) an image file of `blocks` zeroed blocks.
    pub fn create(path: &Path, blocks: u64) -> DeviceResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(blocks * BLOCK_SIZE as u64)?;
        debug!(path = %path.display(), blocks, "created image file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            read_only: false,
        })
    }

    /// Path of the backing image.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, block: BlockIndex, count: u64) -> DeviceResult<()> {
        let capacity = self.capacity()?;
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

impl BlockDevice for FileDevice {
    fn read_blocks(&self, block: BlockIndex, count: u64) -> DeviceResult<Vec<u8>> {
        self.check_range(block, count)?;
        let mut buf = vec![0u8; (count as usize) * BLOCK_SIZE];
        self.file
            .read_exact_at(&mut buf, block * BLOCK_SIZE as u64)?;
        Ok(buf)
    }

    fn write_blocks(&self, ops: &[WriteOp]) -> DeviceResult<()> {
        if self.read_only {
            return Err(DeviceError::ReadOnly);
        }
        for op in ops {
            if op.data.len() % BLOCK_SIZE != 0 {
                return Err(DeviceError::UnalignedBuffer { len: op.data.len() });
            }
            let count = (op.data.len() / BLOCK_SIZE) as u64;
            self.check_range(op.block, count)?;
            self.file
                .write_all_at(&op.data, op.block * BLOCK_SIZE as u64)?;
        }
        Ok(())
    }

    fn flush(&self) -> DeviceResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_data()?;
        Ok(())
    }

    fn capacity(&self) -> DeviceResult<u64> {
        Ok(self.file.metadata()?.len() / BLOCK_SIZE as u64)
    }

    fn trim(&self, block: BlockIndex, count: u64) -> DeviceResult<()> {
        if self.read_only {
            return Err(DeviceError::ReadOnly);
        }
        self.check_range(block, count)?;
        // No hole punching; discard is modeled as zeroing, same as MemDevice.
        let zeros = vec![0u8; (count as usize) * BLOCK_SIZE];
        self.file.write_all_at(&zeros, block * BLOCK_SIZE as u64)?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn supports_trim(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_reopen_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        {
            let dev = FileDevice::create(&path, 4).unwrap();
            dev.write_blocks(&[WriteOp {
                block: 3,
                data: vec![0x5A; BLOCK_SIZE],
            }])
            .unwrap();
            dev.flush().unwrap();
        }
        let dev = FileDevice::open(&path, true).unwrap();
        assert_eq!(dev.capacity().unwrap(), 4);
        assert_eq!(dev.read_blocks(3, 1).unwrap(), vec![0x5A; BLOCK_SIZE]);
    }

    #[test]
    fn read_only_open_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.img");
        FileDevice::create(&path, 2).unwrap();
        let dev = FileDevice::open(&path, true).unwrap();
        assert!(dev.is_read_only());
        let err = dev
            .write_blocks(&[WriteOp {
                block: 0,
                data: vec![0; BLOCK_SIZE],
            }])
            .unwrap_err();
        assert!(matches!(err, DeviceError::ReadOnly));
    }

    #[test]
    fn out_of_bounds_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.img");
        let dev = FileDevice::create(&path, 2).unwrap();
        assert!(matches!(
            dev.read_blocks(2, 1).unwrap_err(),
            DeviceError::OutOfBounds { .. }
        ));
    }
}
