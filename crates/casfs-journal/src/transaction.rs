use casfs_alloc::{ReservedExtent, ReservedNode};
use casfs_device::WriteOp;
use casfs_types::BLOCK_SIZE;

use crate::entry::JournalOp;

/// An in-memory batch of pending writes, submitted to the journal as one
/// atomic unit.
///
/// Metadata ops (bitmap blocks, node-map blocks, the superblock) go
/// through the ring buffer and are applied in the order they were added.
/// Data ops are new-content writes issued ahead of the metadata append;
/// trim ops are advisory discards issued after application. The
/// transaction also keeps alive the reservations it consumes: they are
/// released only after the commit is durable, when the transaction is
/// dropped by the journal worker.
///
/// A transaction is owned by the operation building it until handed to
/// [`Journal::commit`](crate::Journal::commit); after that it cannot be
/// cancelled, only awaited.
#[derive(Default)]
pub struct Transaction {
    pub(crate) metadata_ops: Vec<JournalOp>,
    pub(crate) data_ops: Vec<WriteOp>,
    pub(crate) trim_ops: Vec<(u64, u64)>,
    reserved_extents: Vec<ReservedExtent>,
    reserved_nodes: Vec<ReservedNode>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a metadata write of block-aligned `data` at device-absolute
    /// `target`. Applied in the order added.
    pub fn add_metadata_write(&mut self, target: u64, data: Vec<u8>) {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        self.metadata_ops.push(JournalOp { target, data });
    }

    /// Queue a data-block write, issued (and flushed) before the metadata
    /// entry is appended.
    pub fn add_data_write(&mut self, block: u64, data: Vec<u8>) {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        self.data_ops.push(WriteOp { block, data });
    }

    /// Queue an advisory trim of `count` blocks at device-absolute
    /// `block`, issued after the metadata ops are applied.
    pub fn add_trim(&mut self, block: u64, count: u64) {
        self.trim_ops.push((block, count));
    }

    /// Keep a block reservation alive until this transaction is durable.
    pub fn hold_extent(&mut self, reserved: ReservedExtent) {
        self.reserved_extents.push(reserved);
    }

    /// Keep a node reservation alive until this transaction is durable.
    pub fn hold_node(&mut self, reserved: ReservedNode) {
        self.reserved_nodes.push(reserved);
    }

    /// Number of metadata ops queued.
    pub fn metadata_op_count(&self) -> usize {
        self.metadata_ops.len()
    }

    /// Whether the transaction carries no work at all. Empty transactions
    /// are still committable; they act as ordering barriers (sync).
    pub fn is_empty(&self) -> bool {
        self.metadata_ops.is_empty() && self.data_ops.is_empty() && self.trim_ops.is_empty()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("metadata_ops", &self.metadata_ops.len())
            .field("data_ops", &self.data_ops.len())
            .field("trim_ops", &self.trim_ops.len())
            .field("reserved_extents", &self.reserved_extents.len())
            .field("reserved_nodes", &self.reserved_nodes.len())
            .finish()
    }
}
