//! On-disk format: the superblock and the region layout.
//!
//! The superblock lives in block 0 and describes every other region. The
//! regions follow it in a fixed order, each at a block-aligned offset
//! recorded in the superblock:
//!
//! ```text
//! [block 0: superblock]
//! [block bitmap: one bit per data block]
//! [node map: 128-byte node records]
//! [journal: header block + entry ring]
//! [data: blob tree blocks and payload blocks]
//! ```
//!
//! The bitmap and node-map regions are sized at format time for a
//! configurable maximum, so the volume grower can raise
//! `data_block_count` / `node_count` without relocating any region.
//! Exhausting that headroom is the normal no-room failure.
//!
//! Superblock byte layout (little-endian, fixed offsets):
//!
//! ```text
//! [0..8)     magic "casfsSB1"
//! [8..16)    format revision
//! [16..24)   flags (bit 0: clean)
//! [24..32)   block bitmap start        [32..40)  block bitmap blocks
//! [40..48)   node map start            [48..56)  node map blocks
//! [56..64)   journal start             [64..72)  journal blocks
//! [72..80)   data start
//! [80..88)   data block count
//! [88..96)   node count
//! [96..104)  allocated block count
//! [104..112) allocated node count
//! [112..116) CRC32 of bytes [0..112)
//! [..8192)   zero padding
//! ```

use casfs_device::{BlockDevice, WriteOp};
use casfs_journal::format_journal;
use casfs_types::{BITS_PER_BITMAP_BLOCK, BLOCK_SIZE, NODES_PER_BLOCK};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

/// Superblock magic.
const MAGIC: u64 = u64::from_le_bytes(*b"casfsSB1");

/// Format revision written by this implementation.
pub const CURRENT_REVISION: u64 = 1;

/// Flag bit: the filesystem was unmounted cleanly.
const FLAG_CLEAN: u64 = 1;

/// The fixed on-disk record describing region geometry and global
/// counters. Loaded once at mount after validation, mutated in memory by
/// every committing operation, and staged as the final metadata write of
/// each transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Superblock {
    pub format_revision: u64,
    flags: u64,
    pub block_bitmap_start: u64,
    pub block_bitmap_blocks: u64,
    pub node_map_start: u64,
    pub node_map_blocks: u64,
    pub journal_start: u64,
    pub journal_blocks: u64,
    pub data_start: u64,
    /// Currently addressable data blocks (≤ bitmap headroom).
    pub data_block_count: u64,
    /// Currently addressable node slots (≤ node-map headroom).
    pub node_count: u64,
    pub alloc_block_count: u64,
    pub alloc_node_count: u64,
}

impl Superblock {
    /// Whether the last unmount was clean.
    pub fn is_clean(&self) -> bool {
        self.flags & FLAG_CLEAN != 0
    }

    pub fn set_clean(&mut self, clean: bool) {
        if clean {
            self.flags |= FLAG_CLEAN;
        } else {
            self.flags &= !FLAG_CLEAN;
        }
    }

    /// Largest `data_block_count` the bitmap region can describe.
    pub fn max_data_blocks(&self) -> u64 {
        self.block_bitmap_blocks * BITS_PER_BITMAP_BLOCK
    }

    /// Largest `node_count` the node-map region can hold.
    pub fn max_nodes(&self) -> u64 {
        self.node_map_blocks * NODES_PER_BLOCK as u64
    }

    /// Device-absolute block of a data-region-relative block number.
    pub fn data_block(&self, relative: u64) -> u64 {
        self.data_start + relative
    }

    /// Encode into a full superblock block.
    pub fn encode(&self) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        let fields = [
            MAGIC,
            self.format_revision,
            self.flags,
            self.block_bitmap_start,
            self.block_bitmap_blocks,
            self.node_map_start,
            self.node_map_blocks,
            self.journal_start,
            self.journal_blocks,
            self.data_start,
            self.data_block_count,
            self.node_count,
            self.alloc_block_count,
            self.alloc_node_count,
        ];
        for (i, field) in fields.iter().enumerate() {
            block[i * 8..(i + 1) * 8].copy_from_slice(&field.to_le_bytes());
        }
        let crc = crc32fast::hash(&block[0..112]);
        block[112..116].copy_from_slice(&crc.to_le_bytes());
        block
    }

    /// Decode and validate a superblock read from block 0.
    ///
    /// `device_capacity` is the device size in blocks; validation fails
    /// if any region (or the addressable data range) reaches past it.
    pub fn decode(block: &[u8], device_capacity: u64) -> CoreResult<Self> {
        if block.len() < BLOCK_SIZE {
            return Err(CoreError::format(format!(
                "superblock truncated to {} bytes",
                block.len()
            )));
        }
        let word = |i: usize| u64::from_le_bytes(block[i * 8..(i + 1) * 8].try_into().expect("sliced"));
        if word(0) != MAGIC {
            return Err(CoreError::format(format!("bad magic {:#018x}", word(0))));
        }
        let stored_crc = u32::from_le_bytes(block[112..116].try_into().expect("sliced"));
        let actual_crc = crc32fast::hash(&block[0..112]);
        if stored_crc != actual_crc {
            return Err(CoreError::format(format!(
                "crc mismatch: stored {stored_crc:#010x}, computed {actual_crc:#010x}"
            )));
        }

        let sb = Self {
            format_revision: word(1),
            flags: word(2),
            block_bitmap_start: word(3),
            block_bitmap_blocks: word(4),
            node_map_start: word(5),
            node_map_blocks: word(6),
            journal_start: word(7),
            journal_blocks: word(8),
            data_start: word(9),
            data_block_count: word(10),
            node_count: word(11),
            alloc_block_count: word(12),
            alloc_node_count: word(13),
        };
        sb.validate(device_capacity)?;
        Ok(sb)
    }

    fn validate(&self, device_capacity: u64) -> CoreResult<()> {
        // Regions must follow each other in order, each non-empty,
        // starting right after the superblock.
        let regions = [
            ("block bitmap", self.block_bitmap_start, self.block_bitmap_blocks),
            ("node map", self.node_map_start, self.node_map_blocks),
            ("journal", self.journal_start, self.journal_blocks),
        ];
        let mut expected = 1;
        for (name, start, blocks) in regions {
            if start != expected {
                return Err(CoreError::format(format!(
                    "{name} region starts at {start}, expected {expected}"
                )));
            }
            if blocks == 0 {
                return Err(CoreError::format(format!("{name} region is empty")));
            }
            expected = start + blocks;
        }
        if self.data_start != expected {
            return Err(CoreError::format(format!(
                "data region starts at {}, expected {expected}",
                self.data_start
            )));
        }
        if self.journal_blocks < 2 {
            return Err(CoreError::format(
                "journal region needs a header block and at least one ring block",
            ));
        }
        if self.data_block_count > self.max_data_blocks() {
            return Err(CoreError::format(format!(
                "data block count {} exceeds bitmap headroom {}",
                self.data_block_count,
                self.max_data_blocks()
            )));
        }
        if self.node_count > self.max_nodes() {
            return Err(CoreError::format(format!(
                "node count {} exceeds node map headroom {}",
                self.node_count,
                self.max_nodes()
            )));
        }
        if self.alloc_block_count > self.data_block_count {
            return Err(CoreError::format(format!(
                "allocated block count {} exceeds data block count {}",
                self.alloc_block_count, self.data_block_count
            )));
        }
        if self.alloc_node_count > self.node_count {
            return Err(CoreError::format(format!(
                "allocated node count {} exceeds node count {}",
                self.alloc_node_count, self.node_count
            )));
        }
        if self.data_start + self.data_block_count > device_capacity {
            return Err(CoreError::format(format!(
                "data region [{}, {}) exceeds device capacity {device_capacity}",
                self.data_start,
                self.data_start + self.data_block_count
            )));
        }
        Ok(())
    }
}

/// Sizing knobs for [`format_device`].
#[derive(Clone, Copy, Debug)]
pub struct FormatOptions {
    /// Data blocks addressable immediately after formatting.
    pub data_blocks: u64,
    /// Headroom the block bitmap is sized for; `add_blocks` can grow the
    /// data region up to this count.
    pub max_data_blocks: u64,
    /// Node slots addressable immediately after formatting.
    pub node_count: u64,
    /// Headroom the node map is sized for.
    pub max_node_count: u64,
    /// Journal region size including its header block.
    pub journal_blocks: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            data_blocks: 512,
            max_data_blocks: 4096,
            node_count: 128,
            max_node_count: 512,
            journal_blocks: 17,
        }
    }
}

/// Write a fresh, empty filesystem onto `device`.
///
/// Lays the regions out back to back, zeroes the bitmap and node-map
/// regions, formats the journal, and writes a clean superblock. The
/// device must already cover the metadata regions plus the initial data
/// region; growth beyond that goes through the volume manager later.
pub fn format_device(device: &dyn BlockDevice, opts: FormatOptions) -> CoreResult<Superblock> {
    if opts.data_blocks == 0 || opts.node_count == 0 {
        return Err(CoreError::format("cannot format zero data blocks or nodes"));
    }
    if opts.max_data_blocks < opts.data_blocks || opts.max_node_count < opts.node_count {
        return Err(CoreError::format("maximum counts below initial counts"));
    }
    if opts.journal_blocks < 2 {
        return Err(CoreError::format("journal region too small"));
    }

    let block_bitmap_blocks = opts.max_data_blocks.div_ceil(BITS_PER_BITMAP_BLOCK);
    let node_map_blocks = opts.max_node_count.div_ceil(NODES_PER_BLOCK as u64);
    let block_bitmap_start = 1;
    let node_map_start = block_bitmap_start + block_bitmap_blocks;
    let journal_start = node_map_start + node_map_blocks;
    let data_start = journal_start + opts.journal_blocks;

    let capacity = device.capacity()?;
    let needed = data_start + opts.data_blocks;
    if needed > capacity {
        return Err(CoreError::format(format!(
            "layout needs {needed} blocks, device has {capacity}"
        )));
    }

    let mut sb = Superblock {
        format_revision: CURRENT_REVISION,
        flags: 0,
        block_bitmap_start,
        block_bitmap_blocks,
        node_map_start,
        node_map_blocks,
        journal_start,
        journal_blocks: opts.journal_blocks,
        data_start,
        data_block_count: opts.data_blocks,
        node_count: opts.node_count,
        alloc_block_count: 0,
        alloc_node_count: 0,
    };
    sb.set_clean(true);

    // Zero the metadata regions: every bitmap bit and node record must
    // read as free.
    let zero_region = |start: u64, blocks: u64| -> CoreResult<()> {
        device.write_blocks(&[WriteOp {
            block: start,
            data: vec![0u8; (blocks as usize) * BLOCK_SIZE],
        }])?;
        Ok(())
    };
    zero_region(block_bitmap_start, block_bitmap_blocks)?;
    zero_region(node_map_start, node_map_blocks)?;
    format_journal(device, journal_start, opts.journal_blocks)?;

    device.write_blocks(&[WriteOp {
        block: 0,
        data: sb.encode(),
    }])?;
    device.flush()?;

    info!(
        data_blocks = opts.data_blocks,
        max_data_blocks = opts.max_data_blocks,
        nodes = opts.node_count,
        journal_blocks = opts.journal_blocks,
        "device formatted"
    );
    debug!(?sb, "superblock written");
    Ok(sb)
}

/// Read and validate the superblock from block 0.
pub fn load_superblock(device: &dyn BlockDevice) -> CoreResult<Superblock> {
    let capacity = device.capacity()?;
    let block = device.read_blocks(0, 1)?;
    Superblock::decode(&block, capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use casfs_device::MemDevice;

    fn small_opts() -> FormatOptions {
        FormatOptions {
            data_blocks: 64,
            max_data_blocks: 128,
            node_count: 64,
            max_node_count: 128,
            journal_blocks: 5,
        }
    }

    #[test]
    fn format_and_reload() {
        let dev = MemDevice::new(128);
        let sb = format_device(&dev, small_opts()).unwrap();
        let loaded = load_superblock(&dev).unwrap();
        assert_eq!(loaded, sb);
        assert!(loaded.is_clean());
        assert_eq!(loaded.format_revision, CURRENT_REVISION);
        assert_eq!(loaded.alloc_block_count, 0);
        assert_eq!(loaded.alloc_node_count, 0);
    }

    #[test]
    fn regions_are_ordered_and_disjoint() {
        let dev = MemDevice::new(128);
        let sb = format_device(&dev, small_opts()).unwrap();
        assert_eq!(sb.block_bitmap_start, 1);
        assert_eq!(sb.node_map_start, sb.block_bitmap_start + sb.block_bitmap_blocks);
        assert_eq!(sb.journal_start, sb.node_map_start + sb.node_map_blocks);
        assert_eq!(sb.data_start, sb.journal_start + sb.journal_blocks);
        assert!(sb.max_data_blocks() >= 128);
        assert!(sb.max_nodes() >= 128);
    }

    #[test]
    fn crc_detects_corruption() {
        let dev = MemDevice::new(128);
        format_device(&dev, small_opts()).unwrap();
        let mut block = dev.read_blocks(0, 1).unwrap();
        block[80] ^= 0xFF; // data_block_count field
        dev.write_blocks(&[WriteOp { block: 0, data: block }]).unwrap();
        assert!(matches!(
            load_superblock(&dev),
            Err(CoreError::Format { .. })
        ));
    }

    #[test]
    fn unformatted_device_fails() {
        let dev = MemDevice::new(128);
        assert!(matches!(
            load_superblock(&dev),
            Err(CoreError::Format { .. })
        ));
    }

    #[test]
    fn counter_over_count_fails_validation() {
        let dev = MemDevice::new(128);
        let mut sb = format_device(&dev, small_opts()).unwrap();
        sb.alloc_block_count = sb.data_block_count + 1;
        dev.write_blocks(&[WriteOp {
            block: 0,
            data: sb.encode(),
        }])
        .unwrap();
        assert!(matches!(
            load_superblock(&dev),
            Err(CoreError::Format { .. })
        ));
    }

    #[test]
    fn device_too_small_to_format() {
        let dev = MemDevice::new(8);
        assert!(matches!(
            format_device(&dev, small_opts()),
            Err(CoreError::Format { .. })
        ));
    }

    #[test]
    fn clean_flag_roundtrip() {
        let dev = MemDevice::new(128);
        let mut sb = format_device(&dev, small_opts()).unwrap();
        sb.set_clean(false);
        dev.write_blocks(&[WriteOp {
            block: 0,
            data: sb.encode(),
        }])
        .unwrap();
        assert!(!load_superblock(&dev).unwrap().is_clean());
    }
}
