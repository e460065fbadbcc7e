//! The node map: 128-byte metadata records, one per blob or per
//! extent-continuation.
//!
//! Nodes owning the same blob form a singly linked chain of slot indices
//! (an index-based arena: `next` is a [`NodeIndex`] with [`NODE_NIL`] as
//! the terminator, never a pointer). The first node of a chain carries the
//! blob metadata; continuation nodes carry extents only. Chain traversal
//! is bounded by the node count, so a corrupt cycle is detected instead of
//! looping.
//!
//! Record byte layout (little-endian):
//!
//! ```text
//! [0..4)     flags (bit 0: allocated, bit 1: container, bit 2: compressed)
//! [4..8)     next node index (NODE_NIL terminates the chain)
//! [8..40)    merkle root digest (zero for container nodes)
//! [40..48)   logical size         [48..56)  stored size
//! [56..58)   extent count         [58..60)  tree block count
//! [60..64)   reserved
//! [64..120)  7 packed extents
//! [120..124) reserved
//! [124..128) CRC32 of bytes [0..124)
//! ```
//!
//! A free slot is all zeros; the CRC is only meaningful for allocated
//! records.

use casfs_device::BlockDevice;
use casfs_types::{Digest, Extent, NodeIndex, BLOCK_SIZE, NODES_PER_BLOCK, NODE_NIL, NODE_SIZE};

use crate::error::{CoreError, CoreResult};
use crate::format::Superblock;

const FLAG_ALLOCATED: u32 = 1;
const FLAG_CONTAINER: u32 = 1 << 1;
const FLAG_COMPRESSED: u32 = 1 << 2;

/// Packed extents per record.
pub const INLINE_EXTENTS: usize = 7;

/// One node-map slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeRecord {
    pub allocated: bool,
    /// Extent-continuation record (no blob metadata).
    pub container: bool,
    /// Blob payload is zstd-compressed (blob nodes only).
    pub compressed: bool,
    /// Next node in the chain, or [`NODE_NIL`].
    pub next: NodeIndex,
    /// The blob's name (blob nodes only; null for containers).
    pub digest: Digest,
    /// Uncompressed content length (blob nodes only).
    pub logical_size: u64,
    /// Stored payload length (blob nodes only).
    pub stored_size: u64,
    /// Merkle tree blocks at the head of the chain (blob nodes only).
    pub tree_blocks: u16,
    /// Extents owned by this record, data-region-relative.
    pub extents: Vec<Extent>,
}

impl NodeRecord {
    /// A free (zeroed) slot.
    pub fn free() -> Self {
        Self {
            next: NODE_NIL,
            digest: Digest::null(),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> [u8; NODE_SIZE] {
        let mut raw = [0u8; NODE_SIZE];
        if !self.allocated {
            return raw;
        }
        let mut flags = FLAG_ALLOCATED;
        if self.container {
            flags |= FLAG_CONTAINER;
        }
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        raw[0..4].copy_from_slice(&flags.to_le_bytes());
        raw[4..8].copy_from_slice(&self.next.to_le_bytes());
        raw[8..40].copy_from_slice(self.digest.as_bytes());
        raw[40..48].copy_from_slice(&self.logical_size.to_le_bytes());
        raw[48..56].copy_from_slice(&self.stored_size.to_le_bytes());
        raw[56..58].copy_from_slice(&(self.extents.len() as u16).to_le_bytes());
        raw[58..60].copy_from_slice(&self.tree_blocks.to_le_bytes());
        for (i, extent) in self.extents.iter().enumerate() {
            raw[64 + i * 8..72 + i * 8].copy_from_slice(&extent.to_raw().to_le_bytes());
        }
        let crc = crc32fast::hash(&raw[0..124]);
        raw[124..128].copy_from_slice(&crc.to_le_bytes());
        raw
    }

    pub fn decode(index: NodeIndex, raw: &[u8]) -> CoreResult<Self> {
        debug_assert_eq!(raw.len(), NODE_SIZE);
        let flags = u32::from_le_bytes(raw[0..4].try_into().expect("sliced"));
        if flags & FLAG_ALLOCATED == 0 {
            return Ok(Self::free());
        }
        let stored_crc = u32::from_le_bytes(raw[124..128].try_into().expect("sliced"));
        let actual_crc = crc32fast::hash(&raw[0..124]);
        if stored_crc != actual_crc {
            return Err(CoreError::corruption(format!(
                "node {index}: record crc mismatch"
            )));
        }

        let extent_count = u16::from_le_bytes(raw[56..58].try_into().expect("sliced")) as usize;
        if extent_count > INLINE_EXTENTS {
            return Err(CoreError::corruption(format!(
                "node {index}: {extent_count} extents exceeds the inline limit"
            )));
        }
        let mut extents = Vec::with_capacity(extent_count);
        for i in 0..extent_count {
            let word = u64::from_le_bytes(raw[64 + i * 8..72 + i * 8].try_into().expect("sliced"));
            let extent = Extent::from_raw(word).ok_or_else(|| {
                CoreError::corruption(format!("node {index}: extent slot {i} is empty"))
            })?;
            extents.push(extent);
        }

        let mut digest_bytes = [0u8; 32];
        digest_bytes.copy_from_slice(&raw[8..40]);
        Ok(Self {
            allocated: true,
            container: flags & FLAG_CONTAINER != 0,
            compressed: flags & FLAG_COMPRESSED != 0,
            next: u32::from_le_bytes(raw[4..8].try_into().expect("sliced")),
            digest: Digest::from_hash(digest_bytes),
            logical_size: u64::from_le_bytes(raw[40..48].try_into().expect("sliced")),
            stored_size: u64::from_le_bytes(raw[48..56].try_into().expect("sliced")),
            tree_blocks: u16::from_le_bytes(raw[58..60].try_into().expect("sliced")),
            extents,
        })
    }

    /// Blocks owned by this record.
    pub fn block_count(&self) -> u64 {
        self.extents.iter().map(Extent::length).sum()
    }
}

/// In-memory arena of node records, loaded from the node-map region at
/// mount and staged back block-by-block through transactions.
#[derive(Debug)]
pub struct NodeMap {
    records: Vec<NodeRecord>,
    region_start: u64,
}

impl NodeMap {
    /// Load `sb.node_count` records from the node-map region.
    pub fn load(device: &dyn BlockDevice, sb: &Superblock) -> CoreResult<Self> {
        let blocks_needed = sb.node_count.div_ceil(NODES_PER_BLOCK as u64);
        let bytes = device.read_blocks(sb.node_map_start, blocks_needed)?;
        let mut records = Vec::with_capacity(sb.node_count as usize);
        for index in 0..sb.node_count {
            let at = (index as usize) * NODE_SIZE;
            records.push(NodeRecord::decode(
                index as NodeIndex,
                &bytes[at..at + NODE_SIZE],
            )?);
        }
        Ok(Self {
            records,
            region_start: sb.node_map_start,
        })
    }

    /// An empty map for a freshly formatted filesystem.
    pub fn empty(sb: &Superblock) -> Self {
        Self {
            records: vec![NodeRecord::free(); sb.node_count as usize],
            region_start: sb.node_map_start,
        }
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: NodeIndex) -> CoreResult<&NodeRecord> {
        self.records
            .get(index as usize)
            .ok_or_else(|| CoreError::corruption(format!("node index {index} out of range")))
    }

    pub fn set(&mut self, index: NodeIndex, record: NodeRecord) -> CoreResult<()> {
        let slot = self
            .records
            .get_mut(index as usize)
            .ok_or_else(|| CoreError::corruption(format!("node index {index} out of range")))?;
        *slot = record;
        Ok(())
    }

    pub fn clear(&mut self, index: NodeIndex) -> CoreResult<()> {
        self.set(index, NodeRecord::free())
    }

    /// Extend the arena with free slots (volume growth).
    pub fn grow(&mut self, new_count: u64) {
        assert!(new_count >= self.len(), "node map cannot shrink");
        self.records.resize(new_count as usize, NodeRecord::free());
    }

    /// Indices of all allocated slots.
    pub fn allocated_indices(&self) -> Vec<NodeIndex> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.allocated)
            .map(|(i, _)| i as NodeIndex)
            .collect()
    }

    /// Walk the chain starting at `first`, returning the node indices in
    /// order. Traversal is bounded by the arena size, so a cycle (or a
    /// link to a free or non-container slot) surfaces as corruption
    /// rather than an endless walk.
    pub fn chain(&self, first: NodeIndex) -> CoreResult<Vec<NodeIndex>> {
        let mut out = Vec::new();
        let mut current = first;
        for _ in 0..self.records.len() + 1 {
            if current == NODE_NIL {
                return Ok(out);
            }
            let record = self.get(current)?;
            if !record.allocated {
                return Err(CoreError::corruption(format!(
                    "chain from node {first} links to free node {current}"
                )));
            }
            if !out.is_empty() && !record.container {
                return Err(CoreError::corruption(format!(
                    "chain from node {first} links to non-container node {current}"
                )));
            }
            out.push(current);
            current = record.next;
        }
        Err(CoreError::corruption(format!(
            "chain from node {first} does not terminate"
        )))
    }

    /// All data-region-relative blocks of the chain starting at `first`,
    /// in chain order: tree blocks first, payload after.
    pub fn chain_blocks(&self, first: NodeIndex) -> CoreResult<Vec<u64>> {
        let mut blocks = Vec::new();
        for index in self.chain(first)? {
            let record = self.get(index)?;
            if !record.container && record.extents.is_empty() {
                return Err(CoreError::corruption(format!(
                    "blob node {index} owns no extents"
                )));
            }
            for extent in &record.extents {
                blocks.extend(extent.start()..extent.end());
            }
        }
        Ok(blocks)
    }

    /// Node-map region block (device-absolute) holding `index`.
    pub fn block_of(&self, index: NodeIndex) -> u64 {
        self.region_start + u64::from(index) / NODES_PER_BLOCK as u64
    }

    /// Encode the full node-map block containing `index`, ready to stage
    /// into a transaction.
    pub fn encode_block_of(&self, index: NodeIndex) -> Vec<u8> {
        let first = (u64::from(index) / NODES_PER_BLOCK as u64) * NODES_PER_BLOCK as u64;
        let mut block = vec![0u8; BLOCK_SIZE];
        for slot in 0..NODES_PER_BLOCK as u64 {
            let i = (first + slot) as usize;
            if i >= self.records.len() {
                break;
            }
            let at = (slot as usize) * NODE_SIZE;
            block[at..at + NODE_SIZE].copy_from_slice(&self.records[i].encode());
        }
        block
    }
}
