use std::sync::{Arc, Mutex};

use casfs_types::{Extent, NodeIndex};
use tracing::trace;

use crate::allocator::AllocInner;

/// A provisional claim on a run of free data blocks.
///
/// The claimed bits are tracked only in the allocator's reservation
/// overlay; nothing is persisted. Dropping the reservation returns the
/// claim to the free pool. Promotion via
/// [`Allocator::mark_blocks_allocated`](crate::Allocator::mark_blocks_allocated)
/// copies the claim into the committed bitmap; the overlay bits are still
/// released on drop, which is why a transaction keeps its reservations
/// alive until the commit is durable.
pub struct ReservedExtent {
    inner: Arc<Mutex<AllocInner>>,
    extent: Extent,
}

impl ReservedExtent {
    pub(crate) fn new(inner: Arc<Mutex<AllocInner>>, extent: Extent) -> Self {
        Self { inner, extent }
    }

    /// The reserved block run (data-region-relative).
    pub fn extent(&self) -> Extent {
        self.extent
    }
}

impl Drop for ReservedExtent {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        // The overlay range cannot fail: it was validated at reserve time
        // and the bitmap never shrinks.
        let _ = inner
            .block_reserved
            .clear_range(self.extent.start(), self.extent.length());
        trace!(extent = ?self.extent, "block reservation released");
    }
}

impl std::fmt::Debug for ReservedExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReservedExtent({:?})", self.extent)
    }
}

/// A provisional claim on a free node slot. Same lifecycle as
/// [`ReservedExtent`].
pub struct ReservedNode {
    inner: Arc<Mutex<AllocInner>>,
    index: NodeIndex,
}

impl ReservedNode {
    pub(crate) fn new(inner: Arc<Mutex<AllocInner>>, index: NodeIndex) -> Self {
        Self { inner, index }
    }

    /// The reserved node slot.
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

impl Drop for ReservedNode {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let _ = inner.node_reserved.clear_range(u64::from(self.index), 1);
        trace!(node = self.index, "node reservation released");
    }
}

impl std::fmt::Debug for ReservedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReservedNode({})", self.index)
    }
}
