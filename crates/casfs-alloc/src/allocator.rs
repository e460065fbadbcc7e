use std::sync::{Arc, Mutex};

use casfs_types::{Extent, NodeIndex, MAX_EXTENT_LENGTH};
use tracing::{debug, trace};

use crate::bitmap::Bitmap;
use crate::error::{AllocError, AllocResult};
use crate::reservation::{ReservedExtent, ReservedNode};

/// Committed bitmaps plus the reservation overlays. One mutex guards all
/// four so reservation and promotion are atomic with respect to each
/// other.
pub(crate) struct AllocInner {
    pub(crate) block_map: Bitmap,
    pub(crate) block_reserved: Bitmap,
    pub(crate) node_map: Bitmap,
    pub(crate) node_reserved: Bitmap,
}

/// Block and node allocator.
///
/// Owns the committed block bitmap (persisted in the block-bitmap region)
/// and the node bitmap (derived from node-record allocated flags at mount,
/// in-memory only). Free search is first-fit; a reservation for `n` blocks
/// may span several extents when the free space is fragmented, mirroring
/// the multi-extent node chains the format is built around.
pub struct Allocator {
    inner: Arc<Mutex<AllocInner>>,
}

impl Allocator {
    /// Build an allocator over loaded bitmaps.
    pub fn new(block_map: Bitmap, node_map: Bitmap) -> Self {
        let block_bits = block_map.len();
        let node_bits = node_map.len();
        Self {
            inner: Arc::new(Mutex::new(AllocInner {
                block_map,
                block_reserved: Bitmap::new(block_bits),
                node_map,
                node_reserved: Bitmap::new(node_bits),
            })),
        }
    }

    /// Reserve `n` free data blocks.
    ///
    /// Returns one or more extents covering exactly `n` blocks, claimed in
    /// the reservation overlay, or [`AllocError::OutOfSpace`] with nothing
    /// claimed.
    pub fn reserve_blocks(&self, n: u64) -> AllocResult<Vec<ReservedExtent>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().expect("lock poisoned");
        let mut claimed: Vec<Extent> = Vec::new();
        let mut remaining = n;
        let mut cursor = 0;

        while remaining > 0 {
            let want = remaining.min(MAX_EXTENT_LENGTH);
            match inner.block_map.find_free_run(&inner.block_reserved, cursor, want) {
                Some((start, len)) => {
                    // Infallible: find_free_run stays in range.
                    inner.block_reserved.set_range(start, len)?;
                    let extent = Extent::new(start, len).expect("free run is a valid extent");
                    claimed.push(extent);
                    remaining -= len;
                    cursor = start + len;
                }
                None => {
                    // Roll back every claim before reporting failure.
                    for extent in &claimed {
                        inner
                            .block_reserved
                            .clear_range(extent.start(), extent.length())?;
                    }
                    let free = inner.block_map.len()
                        - inner.block_map.count_ones()
                        - inner.block_reserved.count_ones();
                    debug!(requested = n, free, "block reservation failed");
                    return Err(AllocError::OutOfSpace {
                        what: "blocks",
                        requested: n,
                        free,
                    });
                }
            }
        }

        trace!(requested = n, extents = claimed.len(), "blocks reserved");
        Ok(claimed
            .into_iter()
            .map(|extent| ReservedExtent::new(Arc::clone(&self.inner), extent))
            .collect())
    }

    /// Reserve one free node slot.
    pub fn reserve_node(&self) -> AllocResult<ReservedNode> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        match inner.node_map.find_free_run(&inner.node_reserved, 0, 1) {
            Some((index, _)) => {
                inner.node_reserved.set_range(index, 1)?;
                trace!(node = index, "node reserved");
                Ok(ReservedNode::new(Arc::clone(&self.inner), index as NodeIndex))
            }
            None => {
                let free =
                    inner.node_map.len() - inner.node_map.count_ones() - inner.node_reserved.count_ones();
                Err(AllocError::OutOfSpace {
                    what: "nodes",
                    requested: 1,
                    free,
                })
            }
        }
    }

    /// Promote a block reservation to a committed allocation.
    ///
    /// Sets the bits in the committed bitmap. The caller is responsible for
    /// persisting the bitmap and the superblock counter through a
    /// transaction, and for keeping the reservation alive until that
    /// transaction is durable.
    pub fn mark_blocks_allocated(&self, reserved: &ReservedExtent) -> AllocResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let extent = reserved.extent();
        if inner.block_map.any_set(extent.start(), extent.length()) {
            return Err(AllocError::AlreadyAllocated {
                index: extent.start(),
            });
        }
        inner.block_map.set_range(extent.start(), extent.length())?;
        Ok(())
    }

    /// Promote a node reservation to a committed allocation.
    pub fn mark_node_allocated(&self, reserved: &ReservedNode) -> AllocResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let index = u64::from(reserved.index());
        if inner.node_map.get(index) {
            return Err(AllocError::AlreadyAllocated { index });
        }
        inner.node_map.set_range(index, 1)?;
        Ok(())
    }

    /// Mark a node allocated during the mount-time scan (no reservation
    /// involved; the on-disk record already says so).
    pub fn note_node_allocated(&self, index: NodeIndex) -> AllocResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.node_map.set_range(u64::from(index), 1)
    }

    /// Return an extent to the free pool. The caller persists the cleared
    /// bitmap range and the decremented counter through a transaction.
    pub fn free_extent(&self, extent: Extent) -> AllocResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if !inner.block_map.all_set(extent.start(), extent.length()) {
            return Err(AllocError::DoubleFree {
                what: "extent",
                index: extent.start(),
            });
        }
        inner.block_map.clear_range(extent.start(), extent.length())?;
        trace!(?extent, "extent freed");
        Ok(())
    }

    /// Return a node slot to the free pool.
    pub fn free_node(&self, index: NodeIndex) -> AllocResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if !inner.node_map.get(u64::from(index)) {
            return Err(AllocError::DoubleFree {
                what: "node",
                index: u64::from(index),
            });
        }
        inner.node_map.clear_range(u64::from(index), 1)?;
        trace!(node = index, "node freed");
        Ok(())
    }

    /// Whether every block of `[start, start + length)` is committed.
    pub fn blocks_allocated(&self, start: u64, length: u64) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.block_map.all_set(start, length)
    }

    /// Whether node `index` is committed.
    pub fn node_allocated(&self, index: NodeIndex) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.node_map.get(u64::from(index))
    }

    /// Popcount of the committed block bitmap.
    pub fn allocated_block_count(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").block_map.count_ones()
    }

    /// Popcount of the committed node bitmap.
    pub fn allocated_node_count(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").node_map.count_ones()
    }

    /// Total data blocks tracked.
    pub fn data_block_count(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").block_map.len()
    }

    /// Total node slots tracked.
    pub fn node_count(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").node_map.len()
    }

    /// Extend the block address space to `new_total` bits, the new bits
    /// free. Existing allocations are preserved bit-for-bit.
    pub fn grow_blocks(&self, new_total: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.block_map.grow(new_total);
        inner.block_reserved.grow(new_total);
        debug!(new_total, "block address space grown");
    }

    /// Extend the node address space to `new_total` slots.
    pub fn grow_nodes(&self, new_total: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.node_map.grow(new_total);
        inner.node_reserved.grow(new_total);
        debug!(new_total, "node address space grown");
    }

    /// Copy the committed block bitmap's on-disk bytes starting at
    /// `byte_offset` into `out`, for staging bitmap-region blocks into a
    /// transaction.
    pub fn copy_block_map_bytes(&self, byte_offset: usize, out: &mut [u8]) {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.block_map.copy_bytes(byte_offset, out);
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("lock poisoned");
        f.debug_struct("Allocator")
            .field("data_blocks", &inner.block_map.len())
            .field("allocated_blocks", &inner.block_map.count_ones())
            .field("nodes", &inner.node_map.len())
            .field("allocated_nodes", &inner.node_map.count_ones())
            .finish()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, Debug)]
    enum Op {
        Reserve(u64),
        PromoteOldest,
        DropOldest,
        FreeFirstAllocated(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..20).prop_map(Op::Reserve),
            Just(Op::PromoteOldest),
            Just(Op::DropOldest),
            (1u64..8).prop_map(Op::FreeFirstAllocated),
        ]
    }

    proptest! {
        /// Popcount of the committed bitmap always equals the model's
        /// allocated-count, for arbitrary reserve/promote/drop/free
        /// sequences -- the allocator-side half of the superblock counter
        /// invariant.
        #[test]
        fn popcount_matches_model(ops in proptest::collection::vec(op_strategy(), 1..60)) {
            let alloc = allocator(256, 8);
            let mut pending: Vec<Vec<ReservedExtent>> = Vec::new();
            let mut model_allocated: u64 = 0;

            for op in ops {
                match op {
                    Op::Reserve(n) => {
                        if let Ok(r) = alloc.reserve_blocks(n) {
                            pending.push(r);
                        }
                    }
                    Op::PromoteOldest => {
                        if !pending.is_empty() {
                            let batch = pending.remove(0);
                            for r in &batch {
                                alloc.mark_blocks_allocated(r).unwrap();
                                model_allocated += r.extent().length();
                            }
                        }
                    }
                    Op::DropOldest => {
                        if !pending.is_empty() {
                            pending.remove(0);
                        }
                    }
                    Op::FreeFirstAllocated(len) => {
                        // Find a committed run to free, scanning the public view.
                        let mut start = None;
                        for b in 0..alloc.data_block_count() {
                            if alloc.blocks_allocated(b, len) {
                                start = Some(b);
                                break;
                            }
                        }
                        if let Some(s) = start {
                            alloc.free_extent(Extent::new(s, len).unwrap()).unwrap();
                            model_allocated -= len;
                        }
                    }
                }
                prop_assert_eq!(alloc.allocated_block_count(), model_allocated);
            }
        }
    }

    fn allocator(blocks: u64, nodes: u64) -> Allocator {
        Allocator::new(Bitmap::new(blocks), Bitmap::new(nodes))
    }
}
