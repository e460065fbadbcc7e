//! Consistency check over the on-disk state.
//!
//! Verifies the invariants the format is built around: bitmap popcounts
//! equal the superblock counters, every allocated chain terminates inside
//! the data region, every allocated block is owned by exactly one chain,
//! and no two blobs share a root digest. Problems are collected rather
//! than aborting at the first, so one pass reports everything it can see.
//!
//! The check reads only the device. Online callers hold the shared side
//! of the journal's apply lock (see [`CasFs::check`](crate::CasFs::check))
//! so a check never observes a transaction half applied; offline callers
//! (the `fsck` tool) run it against an unmounted image.

use std::collections::HashMap;

use casfs_alloc::Bitmap;
use casfs_device::BlockDevice;
use casfs_journal::pending_entries;
use casfs_merkle::chunk_count;
use casfs_types::{blocks_for_bytes, Digest, NodeIndex, BITS_PER_BITMAP_BLOCK, DIGEST_LEN};
use tracing::debug;

use crate::error::CoreResult;
use crate::format::load_superblock;
use crate::node_map::NodeMap;

/// Outcome of a consistency pass.
#[derive(Debug, Default)]
pub struct CheckReport {
    /// Live blobs seen.
    pub blob_count: usize,
    /// Allocated data blocks according to the bitmap.
    pub alloc_block_count: u64,
    /// Allocated node slots according to the node map.
    pub alloc_node_count: u64,
    /// Committed-but-unapplied journal entries. Non-zero means the image
    /// was not cleanly shut down; the pre-replay state is still
    /// consistent.
    pub pending_journal_entries: usize,
    /// Everything found wrong, human-readable.
    pub problems: Vec<String>,
}

impl CheckReport {
    /// Whether the pass found no inconsistencies.
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check a formatted device. Fails only when the superblock or node map
/// cannot be read at all; every recoverable inconsistency lands in the
/// report instead.
pub fn check_device(device: &dyn BlockDevice) -> CoreResult<CheckReport> {
    let sb = load_superblock(device)?;
    let mut report = CheckReport {
        pending_journal_entries: pending_entries(device, sb.journal_start, sb.journal_blocks)?,
        ..CheckReport::default()
    };

    let bitmap_blocks = sb.data_block_count.div_ceil(BITS_PER_BITMAP_BLOCK);
    let bitmap_bytes = device.read_blocks(sb.block_bitmap_start, bitmap_blocks)?;
    let block_map = Bitmap::from_bytes(&bitmap_bytes, sb.data_block_count);
    report.alloc_block_count = block_map.count_ones();
    if report.alloc_block_count != sb.alloc_block_count {
        report.problems.push(format!(
            "block bitmap holds {} set bits, superblock says {}",
            report.alloc_block_count, sb.alloc_block_count
        ));
    }

    let node_map = NodeMap::load(device, &sb)?;
    let allocated = node_map.allocated_indices();
    report.alloc_node_count = allocated.len() as u64;
    if report.alloc_node_count != sb.alloc_node_count {
        report.problems.push(format!(
            "node map holds {} allocated records, superblock says {}",
            report.alloc_node_count, sb.alloc_node_count
        ));
    }

    // Walk every blob chain, tracking block ownership and digests.
    let mut owned = Bitmap::new(sb.data_block_count);
    let mut digests: HashMap<Digest, NodeIndex> = HashMap::new();
    let mut chained_nodes: u64 = 0;
    for &index in &allocated {
        let record = node_map.get(index)?;
        if record.container {
            continue;
        }
        report.blob_count += 1;

        let chain_blocks = match node_map.chain_blocks(index) {
            Ok(blocks) => blocks,
            Err(e) => {
                report.problems.push(format!("node {index}: {e}"));
                continue;
            }
        };
        chained_nodes += node_map.chain(index)?.len() as u64;

        for &block in &chain_blocks {
            if block >= sb.data_block_count {
                report.problems.push(format!(
                    "node {index}: extent block {block} beyond the data region"
                ));
                continue;
            }
            if !block_map.get(block) {
                report.problems.push(format!(
                    "node {index}: extent block {block} is not marked allocated"
                ));
            }
            if owned.get(block) {
                report.problems.push(format!(
                    "node {index}: extent block {block} is owned by two chains"
                ));
            } else {
                let _infallible = owned.set_range(block, 1);
            }
        }

        let leaf_count = chunk_count(record.logical_size);
        let expected_tree = if leaf_count == 1 {
            0
        } else {
            blocks_for_bytes(leaf_count * DIGEST_LEN as u64)
        };
        let expected = expected_tree + blocks_for_bytes(record.stored_size).max(1);
        if chain_blocks.len() as u64 != expected {
            report.problems.push(format!(
                "node {index}: chain owns {} blocks, {expected} expected",
                chain_blocks.len()
            ));
        }

        if let Some(&existing) = digests.get(&record.digest) {
            report.problems.push(format!(
                "nodes {existing} and {index} share digest {}",
                record.digest
            ));
        } else {
            digests.insert(record.digest, index);
        }
    }

    // Every allocated bit must belong to some chain, and every allocated
    // node must be on some chain.
    let leaked = block_map.count_ones().saturating_sub(owned.count_ones());
    if leaked > 0 {
        report.problems.push(format!(
            "{leaked} allocated blocks are not owned by any chain"
        ));
    }
    if chained_nodes != report.alloc_node_count {
        report.problems.push(format!(
            "{} allocated nodes, but chains account for {chained_nodes}",
            report.alloc_node_count
        ));
    }

    debug!(
        blobs = report.blob_count,
        problems = report.problems.len(),
        "consistency check finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use casfs_device::{MemDevice, WriteOp};
    use casfs_pager::CachePolicy;
    use casfs_types::BLOCK_SIZE;

    use super::*;
    use crate::format::{format_device, FormatOptions};
    use crate::fs::{CasFs, MountOptions};
    use crate::node_map::NodeRecord;

    fn formatted() -> Arc<MemDevice> {
        let dev = Arc::new(MemDevice::new(128));
        format_device(
            dev.as_ref(),
            FormatOptions {
                data_blocks: 120,
                max_data_blocks: 120,
                node_count: 64,
                max_node_count: 64,
                journal_blocks: 5,
            },
        )
        .unwrap();
        dev
    }

    fn with_blobs(dev: &Arc<MemDevice>, payloads: &[&[u8]]) {
        let fs = CasFs::mount(
            Arc::clone(dev) as Arc<dyn BlockDevice>,
            None,
            MountOptions {
                cache_policy: CachePolicy::EvictImmediately,
                ..MountOptions::default()
            },
        )
        .unwrap();
        for data in payloads {
            let mut writer = fs.create_blob(data.len() as u64).unwrap();
            writer.append(data);
            writer.complete().unwrap();
        }
        fs.unmount().unwrap();
    }

    #[test]
    fn fresh_filesystem_is_clean() {
        let dev = formatted();
        let report = check_device(dev.as_ref()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.blob_count, 0);
        assert_eq!(report.pending_journal_entries, 0);
    }

    #[test]
    fn populated_filesystem_is_clean() {
        let dev = formatted();
        with_blobs(&dev, &[b"one", b"two", &vec![7u8; 3 * BLOCK_SIZE]]);
        let report = check_device(dev.as_ref()).unwrap();
        assert!(report.is_clean(), "problems: {:?}", report.problems);
        assert_eq!(report.blob_count, 3);
        assert_eq!(report.alloc_node_count, 3);
        assert!(report.alloc_block_count >= 4);
    }

    #[test]
    fn forged_counter_is_reported() {
        let dev = formatted();
        with_blobs(&dev, &[b"content"]);
        let mut sb = load_superblock(dev.as_ref()).unwrap();
        sb.alloc_block_count += 3;
        dev.write_blocks(&[WriteOp {
            block: 0,
            data: sb.encode(),
        }])
        .unwrap();

        let report = check_device(dev.as_ref()).unwrap();
        assert!(!report.is_clean());
        assert!(report.problems[0].contains("superblock says"));
    }

    #[test]
    fn duplicate_digest_is_reported() {
        let dev = formatted();
        with_blobs(&dev, &[b"cloned"]);

        // Clone node 0's record into a free slot, pointing at freshly
        // allocated blocks so only the digest collides.
        let sb = load_superblock(dev.as_ref()).unwrap();
        let map = NodeMap::load(dev.as_ref(), &sb).unwrap();
        let original = map.get(0).unwrap().clone();
        let extent = casfs_types::Extent::new(50, 1).unwrap();
        let clone = NodeRecord {
            extents: vec![extent],
            ..original
        };

        let mut node_block = dev.read_blocks(sb.node_map_start, 1).unwrap();
        node_block[128..256].copy_from_slice(&clone.encode());
        dev.write_blocks(&[WriteOp {
            block: sb.node_map_start,
            data: node_block,
        }])
        .unwrap();
        // Keep the bitmap and counters in step so only the digest clash
        // remains.
        let mut bitmap = dev.read_blocks(sb.block_bitmap_start, 1).unwrap();
        bitmap[50 / 8] |= 1 << (50 % 8);
        dev.write_blocks(&[WriteOp {
            block: sb.block_bitmap_start,
            data: bitmap,
        }])
        .unwrap();
        let mut forged = sb;
        forged.alloc_block_count += 1;
        forged.alloc_node_count += 1;
        dev.write_blocks(&[WriteOp {
            block: 0,
            data: forged.encode(),
        }])
        .unwrap();

        let report = check_device(dev.as_ref()).unwrap();
        assert!(report
            .problems
            .iter()
            .any(|p| p.contains("share digest")));
    }

    #[test]
    fn leaked_blocks_are_reported() {
        let dev = formatted();
        with_blobs(&dev, &[b"leaky"]);

        // Set a bitmap bit no chain owns, with a matching counter so the
        // popcount check stays quiet.
        let sb = load_superblock(dev.as_ref()).unwrap();
        let mut bitmap = dev.read_blocks(sb.block_bitmap_start, 1).unwrap();
        bitmap[80 / 8] |= 1 << (80 % 8);
        dev.write_blocks(&[WriteOp {
            block: sb.block_bitmap_start,
            data: bitmap,
        }])
        .unwrap();
        let mut forged = sb;
        forged.alloc_block_count += 1;
        dev.write_blocks(&[WriteOp {
            block: 0,
            data: forged.encode(),
        }])
        .unwrap();

        let report = check_device(dev.as_ref()).unwrap();
        assert!(report
            .problems
            .iter()
            .any(|p| p.contains("not owned by any chain")));
    }
}
