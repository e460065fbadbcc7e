//! Volume growth: extending the block and node address space.
//!
//! The bitmap and node-map regions are sized at format time for a fixed
//! maximum, so growth never relocates a region. `add_blocks` asks the
//! volume manager for more physical storage at the tail of the data
//! region; `add_nodes` consumes node-map headroom that is already
//! physically present. Either way the superblock count update and the
//! zero-filled metadata covering the new range commit as one transaction:
//! a crash during growth leaves the old layout or the fully grown one,
//! never a partially extended state. Running out of headroom (or of
//! physical storage) is a normal no-room failure.

use casfs_device::ExtendStatus;
use casfs_journal::Transaction;
use casfs_types::{NodeIndex, BITS_PER_BITMAP_BLOCK, BLOCK_SIZE, NODES_PER_BLOCK};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::fs::CasFs;

impl CasFs {
    /// Extend the data region by `n` blocks. Returns the new total data
    /// block count once the growth transaction is fully applied.
    pub fn add_blocks(&self, n: u64) -> CoreResult<u64> {
        self.writable_journal()?;
        let mut meta = self.meta.lock().expect("lock poisoned");
        let old_total = meta.superblock.data_block_count;
        if n == 0 {
            return Ok(old_total);
        }
        let new_total = old_total
            .checked_add(n)
            .filter(|&total| total <= meta.superblock.max_data_blocks())
            .ok_or(CoreError::NoRoom {
                what: "blocks",
                requested: n,
            })?;

        // The new blocks sit at the tail of the data region; they must
        // physically exist before anything can address them.
        let tail = meta.superblock.data_block(old_total);
        match self.volume() {
            Some(volume) => match volume.extend_address_space(tail, n)? {
                ExtendStatus::Extended => {}
                ExtendStatus::NoRoom => {
                    return Err(CoreError::NoRoom {
                        what: "blocks",
                        requested: n,
                    })
                }
            },
            None => {
                if self.device().capacity()? < tail + n {
                    return Err(CoreError::NoRoom {
                        what: "blocks",
                        requested: n,
                    });
                }
            }
        }

        self.allocator.grow_blocks(new_total);
        meta.superblock.data_block_count = new_total;

        // Stage the bitmap blocks covering the new bits (zero-filled:
        // they read as free) and the grown superblock, as one unit.
        let mut txn = Transaction::new();
        let first = old_total / BITS_PER_BITMAP_BLOCK;
        let last = (new_total - 1) / BITS_PER_BITMAP_BLOCK;
        for region_block in first..=last {
            let mut buf = vec![0u8; BLOCK_SIZE];
            self.allocator
                .copy_block_map_bytes((region_block as usize) * BLOCK_SIZE, &mut buf);
            txn.add_metadata_write(meta.superblock.block_bitmap_start + region_block, buf);
        }
        txn.add_metadata_write(0, meta.superblock.encode());
        let completion = self.submit(txn)?;
        drop(meta);

        self.finish(completion)?;
        info!(from = old_total, to = new_total, "data region grown");
        Ok(new_total)
    }

    /// Extend the node map by `n` slots. Returns the new total node
    /// count once the growth transaction is fully applied.
    ///
    /// The node-map region is physically present from format time, so
    /// growth here only consumes its headroom; no volume-manager call is
    /// needed. Exhausting the headroom is the no-room failure.
    pub fn add_nodes(&self, n: u64) -> CoreResult<u64> {
        self.writable_journal()?;
        let mut meta = self.meta.lock().expect("lock poisoned");
        let old_count = meta.superblock.node_count;
        if n == 0 {
            return Ok(old_count);
        }
        let new_count = old_count
            .checked_add(n)
            .filter(|&count| count <= meta.superblock.max_nodes())
            .ok_or(CoreError::NoRoom {
                what: "nodes",
                requested: n,
            })?;

        meta.node_map.grow(new_count);
        self.allocator.grow_nodes(new_count);
        meta.superblock.node_count = new_count;

        let mut txn = Transaction::new();
        let first = old_count / NODES_PER_BLOCK as u64;
        let last = (new_count - 1) / NODES_PER_BLOCK as u64;
        for region_block in first..=last {
            let index = (region_block * NODES_PER_BLOCK as u64) as NodeIndex;
            txn.add_metadata_write(
                meta.node_map.block_of(index),
                meta.node_map.encode_block_of(index),
            );
        }
        txn.add_metadata_write(0, meta.superblock.encode());
        let completion = self.submit(txn)?;
        drop(meta);

        self.finish(completion)?;
        info!(from = old_count, to = new_count, "node map grown");
        Ok(new_count)
    }
}
