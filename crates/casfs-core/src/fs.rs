//! The mounted filesystem object.
//!
//! [`CasFs`] is the explicit handle every operation goes through -- it
//! owns the allocator, journal, node map, and blob cache, and its
//! lifetime spans mount to unmount. There is no global filesystem
//! instance.
//!
//! # Mount pipeline
//!
//! 1. Read and validate the superblock (a format error aborts the mount).
//! 2. Replay the journal. A read-only device with a non-empty journal
//!    fails the mount closed; replay needs a writable disk.
//! 3. Load the block bitmap and node map; verify the bitmap popcounts
//!    against the superblock counters.
//! 4. Scan the node map: validate every allocated chain and register
//!    every blob in the cache. A duplicate root digest aborts the mount.
//! 5. Start the journal (writable mounts) and commit the first
//!    transaction: clean flag cleared, format revision clamped.
//!
//! # Write path
//!
//! [`CasFs::create_blob`] hands out a [`BlobWriter`]; `complete` computes
//! the merkle tree (the blob's name is the root digest, derived rather
//! than chosen), optionally compresses the payload, reserves nodes and
//! extents, writes the data blocks, and commits one transaction carrying
//! the bitmap, node-map, and superblock updates. The superblock is always
//! the last metadata write of a transaction.
//!
//! # Read path
//!
//! [`CasFs::open_blob`] resolves the name through the cache and returns a
//! [`BlobReader`]; reads page data in on demand and every newly paged
//! chunk is verified against the blob's merkle tree before any byte is
//! returned.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use casfs_alloc::{Allocator, Bitmap};
use casfs_device::{BlockDevice, VolumeManager};
use casfs_journal::{
    pending_entries, replay, ApplyMode, Journal, JournalConfig, Transaction,
};
use casfs_merkle::MerkleTree;
use casfs_pager::{BlobCache, BlobHandle, BlobInfo, CachePolicy, Pager, TransferBuffer};
use casfs_types::{
    blocks_for_bytes, Digest, Extent, NodeIndex, BITS_PER_BITMAP_BLOCK, BLOCK_SIZE, DIGEST_LEN,
    NODE_NIL,
};
use tracing::{debug, error, info, warn};

use crate::check::check_device;
use crate::error::{CoreError, CoreResult};
use crate::format::{load_superblock, Superblock, CURRENT_REVISION};
use crate::node_map::{NodeMap, NodeRecord, INLINE_EXTENTS};

/// Runtime mount configuration.
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Mount without a journal writer; every mutating call fails with a
    /// read-only error. Implied when the device itself is read-only.
    pub read_only: bool,
    /// What happens to a blob's paged-in data at its last close.
    pub cache_policy: CachePolicy,
    /// Compress new blobs when it saves at least one block.
    pub compress: bool,
    /// Run the consistency check after every applied transaction and log
    /// a corruption report.
    pub verify_after_commit: bool,
    /// How journal entries reach their final locations. `Manual` is for
    /// crash tests and offline tooling.
    pub apply_mode: ApplyMode,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            cache_policy: CachePolicy::NeverEvict,
            compress: true,
            verify_after_commit: false,
            apply_mode: ApplyMode::Background,
        }
    }
}

/// Counters and flags reported by [`CasFs::stats`].
#[derive(Clone, Copy, Debug)]
pub struct FsStats {
    pub data_block_count: u64,
    pub alloc_block_count: u64,
    pub node_count: u64,
    pub alloc_node_count: u64,
    pub blob_count: usize,
    pub format_revision: u64,
    pub read_only: bool,
}

/// Metadata mutated only inside the transaction-build critical section.
pub(crate) struct Meta {
    pub(crate) superblock: Superblock,
    pub(crate) node_map: NodeMap,
}

/// A mounted content-addressed blob filesystem.
pub struct CasFs {
    device: Arc<dyn BlockDevice>,
    volume: Option<Arc<dyn VolumeManager>>,
    options: MountOptions,
    pub(crate) meta: Arc<Mutex<Meta>>,
    pub(crate) allocator: Arc<Allocator>,
    cache: Arc<BlobCache>,
    pager: Pager,
    journal: Option<Journal>,
    /// Latched when a commit-side device error leaves the in-memory
    /// state ahead of the disk; all further mutation is refused.
    degraded: AtomicBool,
}

impl CasFs {
    /// Mount a formatted device. `volume` is consulted only by the
    /// growth operations; a filesystem without one can never grow.
    pub fn mount(
        device: Arc<dyn BlockDevice>,
        volume: Option<Arc<dyn VolumeManager>>,
        options: MountOptions,
    ) -> CoreResult<Self> {
        let mut sb = load_superblock(device.as_ref())?;

        if device.is_read_only() {
            let pending = pending_entries(device.as_ref(), sb.journal_start, sb.journal_blocks)?;
            if pending > 0 {
                return Err(CoreError::ReplayOnReadOnly { pending });
            }
        } else {
            let report = replay(device.as_ref(), sb.journal_start, sb.journal_blocks)?;
            if report.entries > 0 {
                info!(entries = report.entries, "recovered journaled transactions");
                // Replay may have rewritten the superblock.
                sb = load_superblock(device.as_ref())?;
            }
        }
        if !sb.is_clean() {
            warn!("previous unmount was not clean");
        }

        let bitmap_blocks = sb.data_block_count.div_ceil(BITS_PER_BITMAP_BLOCK);
        let bitmap_bytes = device.read_blocks(sb.block_bitmap_start, bitmap_blocks)?;
        let block_map = Bitmap::from_bytes(&bitmap_bytes, sb.data_block_count);
        if block_map.count_ones() != sb.alloc_block_count {
            return Err(CoreError::corruption(format!(
                "block bitmap holds {} set bits, superblock says {}",
                block_map.count_ones(),
                sb.alloc_block_count
            )));
        }

        let node_map = NodeMap::load(device.as_ref(), &sb)?;
        let allocator = Arc::new(Allocator::new(block_map, Bitmap::new(sb.node_count)));
        for index in node_map.allocated_indices() {
            allocator.note_node_allocated(index)?;
        }
        if allocator.allocated_node_count() != sb.alloc_node_count {
            return Err(CoreError::corruption(format!(
                "node map holds {} allocated records, superblock says {}",
                allocator.allocated_node_count(),
                sb.alloc_node_count
            )));
        }

        let cache = Arc::new(BlobCache::new(options.cache_policy));
        let pager = Pager::new(Arc::clone(&device), TransferBuffer::default());
        scan_nodes(device.as_ref(), &sb, &node_map, &allocator, &cache)?;

        let writable = !options.read_only && !device.is_read_only();
        let journal = if writable {
            let journal = Journal::open(
                Arc::clone(&device),
                sb.journal_start,
                sb.journal_blocks,
                JournalConfig {
                    mode: options.apply_mode,
                },
            )?;
            if options.verify_after_commit {
                let hook_device = Arc::clone(&device);
                let hook_lock = journal.apply_lock();
                journal.set_post_apply_hook(Box::new(move || {
                    let _shared = hook_lock.read().expect("lock poisoned");
                    match check_device(hook_device.as_ref()) {
                        Ok(report) if report.is_clean() => {}
                        Ok(report) => {
                            for problem in &report.problems {
                                error!(%problem, "post-commit consistency check failed");
                            }
                        }
                        Err(e) => error!(error = %e, "post-commit consistency check errored"),
                    }
                }));
            }
            Some(journal)
        } else {
            None
        };

        let fs = Self {
            device,
            volume,
            options,
            meta: Arc::new(Mutex::new(Meta {
                superblock: sb,
                node_map,
            })),
            allocator,
            cache,
            pager,
            journal,
            degraded: AtomicBool::new(false),
        };

        if writable {
            // First transaction of a writable mount: mark the volume
            // dirty and clamp the format revision.
            let mut meta = fs.meta.lock().expect("lock poisoned");
            meta.superblock.set_clean(false);
            if meta.superblock.format_revision > CURRENT_REVISION {
                warn!(
                    stored = meta.superblock.format_revision,
                    current = CURRENT_REVISION,
                    "lowering too-new format revision"
                );
                meta.superblock.format_revision = CURRENT_REVISION;
            } else if meta.superblock.format_revision < CURRENT_REVISION {
                info!(
                    from = meta.superblock.format_revision,
                    to = CURRENT_REVISION,
                    "raising format revision"
                );
                meta.superblock.format_revision = CURRENT_REVISION;
            }
            let mut txn = Transaction::new();
            txn.add_metadata_write(0, meta.superblock.encode());
            drop(meta);
            fs.submit(txn)?;
        }

        info!(
            blobs = fs.cache.len(),
            revision = fs.meta.lock().expect("lock poisoned").superblock.format_revision,
            policy = %fs.cache.policy(),
            read_only = !writable,
            "filesystem mounted"
        );
        Ok(fs)
    }

    /// Cleanly unmount: wait out the journal, set the clean flag, and
    /// flush the device. Dropping a `CasFs` without calling this leaves
    /// the clean flag cleared, which the next mount reports.
    pub fn unmount(self) -> CoreResult<()> {
        if self.journal.is_some() && !self.degraded.load(Ordering::Acquire) {
            let mut meta = self.meta.lock().expect("lock poisoned");
            meta.superblock.set_clean(true);
            let mut txn = Transaction::new();
            txn.add_metadata_write(0, meta.superblock.encode());
            drop(meta);
            let completion = self.submit(txn)?;
            self.finish(completion)?;
            if let Some(journal) = &self.journal {
                journal.shutdown();
            }
        }
        self.device.flush()?;
        info!("filesystem unmounted");
        Ok(())
    }

    /// Begin creating a blob. `expected_size` drives a capacity
    /// precheck; the actual reservation happens at
    /// [`BlobWriter::complete`], when the final (possibly compressed)
    /// size is known.
    pub fn create_blob(&self, expected_size: u64) -> CoreResult<BlobWriter<'_>> {
        self.writable_journal()?;
        let needed = blocks_for_bytes(expected_size).max(1);
        let free = self.allocator.data_block_count() - self.allocator.allocated_block_count();
        if needed > free {
            return Err(CoreError::Alloc(casfs_alloc::AllocError::OutOfSpace {
                what: "blocks",
                requested: needed,
                free,
            }));
        }
        Ok(BlobWriter {
            fs: self,
            buf: Vec::new(),
        })
    }

    /// Open a blob by name.
    pub fn open_blob(&self, digest: &Digest) -> CoreResult<BlobReader<'_>> {
        let handle = self.cache.open(digest).ok_or(CoreError::NotFound(*digest))?;
        Ok(BlobReader { fs: self, handle })
    }

    /// Delete a blob, returning its nodes and extents to the free pool.
    /// Fails with [`CoreError::Busy`] while handles are open.
    pub fn delete_blob(&self, digest: &Digest) -> CoreResult<()> {
        self.writable_journal()?;
        let mut meta = self.meta.lock().expect("lock poisoned");

        let info = match self.cache.remove(digest) {
            Ok(Some(info)) => info,
            Ok(None) => return Err(CoreError::NotFound(*digest)),
            Err(casfs_pager::PagerError::StillOpen { .. }) => {
                return Err(CoreError::Busy(*digest))
            }
            Err(e) => return Err(e.into()),
        };

        let chain = meta.node_map.chain(info.node)?;
        let mut txn = Transaction::new();
        let mut freed_extents: Vec<Extent> = Vec::new();
        for &index in &chain {
            freed_extents.extend(meta.node_map.get(index)?.extents.iter().copied());
        }
        let freed_blocks: u64 = freed_extents.iter().map(Extent::length).sum();
        for extent in &freed_extents {
            self.allocator.free_extent(*extent)?;
            txn.add_trim(
                meta.superblock.data_block(extent.start()),
                extent.length(),
            );
        }
        for &index in &chain {
            self.allocator.free_node(index)?;
            meta.node_map.clear(index)?;
        }

        stage_bitmap_blocks(&mut txn, &meta.superblock, &self.allocator, &freed_extents);
        stage_node_blocks(&mut txn, &meta.node_map, &chain);
        meta.superblock.alloc_block_count -= freed_blocks;
        meta.superblock.alloc_node_count -= chain.len() as u64;
        txn.add_metadata_write(0, meta.superblock.encode());

        // Submit before releasing the metadata lock so transactions reach
        // the journal in the order their superblock snapshots were built.
        self.submit(txn)?;
        drop(meta);
        debug!(digest = %digest.short_hex(), blocks = freed_blocks, nodes = chain.len(), "blob deleted");
        Ok(())
    }

    /// Barrier: returns once every previously submitted transaction is
    /// applied and the device is flushed. A no-op on read-only mounts.
    pub fn sync(&self) -> CoreResult<()> {
        if self.journal.is_none() {
            return Ok(());
        }
        let completion = self.submit(Transaction::new())?;
        self.finish(completion)?;
        self.device.flush()?;
        Ok(())
    }

    /// Names of all live blobs, sorted.
    pub fn list_blobs(&self) -> Vec<Digest> {
        self.cache.digests()
    }

    /// Whether a blob with this name exists.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.cache.contains(digest)
    }

    /// Current counters. Reflects committed in-memory state, which may
    /// run ahead of the disk until the journal catches up.
    pub fn stats(&self) -> FsStats {
        let meta = self.meta.lock().expect("lock poisoned");
        FsStats {
            data_block_count: meta.superblock.data_block_count,
            alloc_block_count: meta.superblock.alloc_block_count,
            node_count: meta.superblock.node_count,
            alloc_node_count: meta.superblock.alloc_node_count,
            blob_count: self.cache.len(),
            format_revision: meta.superblock.format_revision,
            read_only: self.journal.is_none() || self.degraded.load(Ordering::Acquire),
        }
    }

    /// Run the consistency check against the on-disk state, holding the
    /// shared side of the apply lock so no mid-commit state is observed.
    pub fn check(&self) -> CoreResult<crate::check::CheckReport> {
        match &self.journal {
            Some(journal) => {
                let lock = journal.apply_lock();
                let _shared = lock.read().expect("lock poisoned");
                check_device(self.device.as_ref())
            }
            None => check_device(self.device.as_ref()),
        }
    }

    pub(crate) fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub(crate) fn volume(&self) -> Option<&Arc<dyn VolumeManager>> {
        self.volume.as_ref()
    }

    /// The journal, if this mount can write.
    pub(crate) fn writable_journal(&self) -> CoreResult<&Journal> {
        let journal = self.journal.as_ref().ok_or(CoreError::ReadOnly)?;
        if self.degraded.load(Ordering::Acquire) || journal.is_failed() {
            return Err(CoreError::Journal(casfs_journal::JournalError::Failed));
        }
        Ok(journal)
    }

    /// Commit a transaction, latching the degraded flag on failure: a
    /// commit-side device error leaves in-memory state the disk never
    /// saw, so no further mutation can be allowed.
    pub(crate) fn submit(&self, txn: Transaction) -> CoreResult<casfs_journal::Completion> {
        let journal = self.writable_journal()?;
        match journal.commit(txn) {
            Ok(completion) => Ok(completion),
            Err(e) => {
                error!(error = %e, "transaction commit failed; degrading to read-only");
                self.degraded.store(true, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Wait for a committed transaction to be fully applied.
    pub(crate) fn finish(&self, completion: casfs_journal::Completion) -> CoreResult<()> {
        match self.options.apply_mode {
            ApplyMode::Background => completion.wait()?,
            ApplyMode::Manual => {
                self.writable_journal()?.apply_pending()?;
            }
        }
        Ok(())
    }

    fn commit_blob(&self, data: Vec<u8>) -> CoreResult<Digest> {
        self.writable_journal()?;

        let tree = MerkleTree::from_data(&data);
        let digest = tree.root();

        // Compress only when it saves at least one block of storage.
        let mut stored = data.clone();
        let mut compressed = false;
        if self.options.compress && data.len() > BLOCK_SIZE {
            match zstd::encode_all(data.as_slice(), 3) {
                Ok(packed) => {
                    if blocks_for_bytes(packed.len() as u64) < blocks_for_bytes(data.len() as u64)
                    {
                        stored = packed;
                        compressed = true;
                    }
                }
                Err(e) => warn!(error = %e, "compression failed; storing raw"),
            }
        }

        let leaf_count = tree.leaf_count() as u64;
        let tree_blocks = if leaf_count == 1 {
            0
        } else {
            blocks_for_bytes(leaf_count * DIGEST_LEN as u64)
        };
        // Every blob owns at least one payload block, so every allocated
        // blob node has at least one extent.
        let payload_blocks = blocks_for_bytes(stored.len() as u64).max(1);
        let total_blocks = tree_blocks + payload_blocks;

        let mut meta = self.meta.lock().expect("lock poisoned");
        if self.cache.contains(&digest) {
            return Err(CoreError::AlreadyExists(digest));
        }
        let reserved_extents = self.allocator.reserve_blocks(total_blocks)?;
        let extents: Vec<Extent> = reserved_extents.iter().map(|r| r.extent()).collect();
        let node_count = 1 + extents.len().saturating_sub(INLINE_EXTENTS).div_ceil(INLINE_EXTENTS);
        let mut reserved_nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            reserved_nodes.push(self.allocator.reserve_node()?);
        }
        let nodes: Vec<NodeIndex> = reserved_nodes.iter().map(|r| r.index()).collect();

        // Lay the tree level and the payload across the chain's blocks.
        let mut content = tree_content(&tree, tree_blocks, &stored, payload_blocks);
        debug_assert_eq!(content.len() as u64, total_blocks * BLOCK_SIZE as u64);
        let mut txn = Transaction::new();
        let mut offset = 0usize;
        for extent in &extents {
            let len = (extent.length() as usize) * BLOCK_SIZE;
            txn.add_data_write(
                meta.superblock.data_block(extent.start()),
                content[offset..offset + len].to_vec(),
            );
            offset += len;
        }
        drop(content);

        for reserved in &reserved_extents {
            self.allocator.mark_blocks_allocated(reserved)?;
        }
        for reserved in &reserved_nodes {
            self.allocator.mark_node_allocated(reserved)?;
        }

        for (i, &index) in nodes.iter().enumerate() {
            let slice = &extents[i * INLINE_EXTENTS..((i + 1) * INLINE_EXTENTS).min(extents.len())];
            let next = nodes.get(i + 1).copied().unwrap_or(NODE_NIL);
            let record = if i == 0 {
                NodeRecord {
                    allocated: true,
                    container: false,
                    compressed,
                    next,
                    digest,
                    logical_size: data.len() as u64,
                    stored_size: stored.len() as u64,
                    tree_blocks: tree_blocks as u16,
                    extents: slice.to_vec(),
                }
            } else {
                NodeRecord {
                    allocated: true,
                    container: true,
                    next,
                    extents: slice.to_vec(),
                    ..NodeRecord::free()
                }
            };
            meta.node_map.set(index, record)?;
        }

        stage_bitmap_blocks(&mut txn, &meta.superblock, &self.allocator, &extents);
        stage_node_blocks(&mut txn, &meta.node_map, &nodes);
        meta.superblock.alloc_block_count += total_blocks;
        meta.superblock.alloc_node_count += nodes.len() as u64;
        txn.add_metadata_write(0, meta.superblock.encode());

        for reserved in reserved_extents {
            txn.hold_extent(reserved);
        }
        for reserved in reserved_nodes {
            txn.hold_node(reserved);
        }

        let payload: Vec<u64> = meta.node_map.chain_blocks(nodes[0])?[tree_blocks as usize..]
            .iter()
            .map(|&rel| meta.superblock.data_block(rel))
            .collect();
        let info = BlobInfo {
            node: nodes[0],
            digest,
            logical_size: data.len() as u64,
            stored_size: stored.len() as u64,
            compressed,
            payload_blocks: payload,
        };

        // Submit before releasing the metadata lock so transactions reach
        // the journal in the order their superblock snapshots were built;
        // register before releasing it so a concurrent create of the same
        // content sees the duplicate.
        self.submit(txn)?;
        let entry = self.cache.register(info, tree.leaves().to_vec())?;
        entry.seed(&data);
        drop(meta);
        debug!(
            digest = %digest.short_hex(),
            bytes = data.len(),
            blocks = total_blocks,
            nodes = nodes.len(),
            compressed,
            "blob created"
        );
        Ok(digest)
    }
}

impl std::fmt::Debug for CasFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("CasFs")
            .field("blobs", &stats.blob_count)
            .field("alloc_blocks", &stats.alloc_block_count)
            .field("alloc_nodes", &stats.alloc_node_count)
            .field("read_only", &stats.read_only)
            .finish()
    }
}

/// In-progress blob creation. Append content, then
/// [`complete`](Self::complete) to derive the name and commit. Dropping
/// the writer abandons the blob with no disk effect.
pub struct BlobWriter<'fs> {
    fs: &'fs CasFs,
    buf: Vec<u8>,
}

impl std::fmt::Debug for BlobWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobWriter")
            .field("len", &self.buf.len())
            .finish()
    }
}

impl BlobWriter<'_> {
    /// Append content bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered so far.
    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Derive the blob's name, write its data, and commit. Returns the
    /// root digest the blob is now addressable by.
    pub fn complete(self) -> CoreResult<Digest> {
        self.fs.commit_blob(self.buf)
    }
}

/// An open blob. Reads go through the verifying pager; dropping the
/// reader closes the handle, applying the cache policy at the last
/// close.
pub struct BlobReader<'fs> {
    fs: &'fs CasFs,
    handle: BlobHandle,
}

impl BlobReader<'_> {
    /// The blob's name.
    pub fn digest(&self) -> Digest {
        self.handle.entry().info().digest
    }

    /// Uncompressed content length.
    pub fn size(&self) -> u64 {
        self.handle.entry().info().logical_size
    }

    /// Read `[offset, offset + length)`, clamped to the blob's size.
    pub fn read(&self, offset: u64, length: u64) -> CoreResult<Vec<u8>> {
        Ok(self.fs.pager.read_range(self.handle.entry(), offset, length)?)
    }

    /// Read the entire content.
    pub fn read_all(&self) -> CoreResult<Vec<u8>> {
        self.read(0, self.size())
    }
}

/// One buffer holding the chain's full content: the serialized leaf
/// level padded to `tree_blocks`, then the stored payload padded to
/// `payload_blocks`.
fn tree_content(tree: &MerkleTree, tree_blocks: u64, stored: &[u8], payload_blocks: u64) -> Vec<u8> {
    let mut content =
        Vec::with_capacity(((tree_blocks + payload_blocks) as usize) * BLOCK_SIZE);
    if tree_blocks > 0 {
        content.extend_from_slice(&tree.leaves_to_bytes());
        content.resize((tree_blocks as usize) * BLOCK_SIZE, 0);
    }
    content.extend_from_slice(stored);
    content.resize(((tree_blocks + payload_blocks) as usize) * BLOCK_SIZE, 0);
    content
}

/// Stage every bitmap-region block whose bits `extents` touch.
fn stage_bitmap_blocks(
    txn: &mut Transaction,
    sb: &Superblock,
    allocator: &Allocator,
    extents: &[Extent],
) {
    let mut region_blocks: BTreeSet<u64> = BTreeSet::new();
    for extent in extents {
        let first = extent.start() / BITS_PER_BITMAP_BLOCK;
        let last = (extent.end() - 1) / BITS_PER_BITMAP_BLOCK;
        region_blocks.extend(first..=last);
    }
    for region_block in region_blocks {
        let mut buf = vec![0u8; BLOCK_SIZE];
        allocator.copy_block_map_bytes((region_block as usize) * BLOCK_SIZE, &mut buf);
        txn.add_metadata_write(sb.block_bitmap_start + region_block, buf);
    }
}

/// Stage every node-map block holding one of `nodes`.
fn stage_node_blocks(txn: &mut Transaction, node_map: &NodeMap, nodes: &[NodeIndex]) {
    let mut seen: BTreeSet<u64> = BTreeSet::new();
    for &index in nodes {
        let block = node_map.block_of(index);
        if seen.insert(block) {
            txn.add_metadata_write(block, node_map.encode_block_of(index));
        }
    }
}

/// Mount-time node scan: validate every allocated chain and register
/// every blob. Duplicate digests and malformed chains abort the mount.
fn scan_nodes(
    device: &dyn BlockDevice,
    sb: &Superblock,
    node_map: &NodeMap,
    allocator: &Allocator,
    cache: &BlobCache,
) -> CoreResult<()> {
    for index in node_map.allocated_indices() {
        let record = node_map.get(index)?;
        if record.container {
            continue;
        }

        let chain_blocks = node_map.chain_blocks(index)?;
        for &block in &chain_blocks {
            if block >= sb.data_block_count {
                return Err(CoreError::corruption(format!(
                    "node {index}: extent block {block} beyond data region of {} blocks",
                    sb.data_block_count
                )));
            }
            if !allocator.blocks_allocated(block, 1) {
                return Err(CoreError::corruption(format!(
                    "node {index}: extent block {block} is not marked allocated"
                )));
            }
        }

        let leaf_count = casfs_merkle::chunk_count(record.logical_size);
        let expected_tree = if leaf_count == 1 {
            0
        } else {
            blocks_for_bytes(leaf_count * DIGEST_LEN as u64)
        };
        if u64::from(record.tree_blocks) != expected_tree {
            return Err(CoreError::corruption(format!(
                "node {index}: {} tree blocks recorded, {expected_tree} expected",
                record.tree_blocks
            )));
        }
        let expected_payload = blocks_for_bytes(record.stored_size).max(1);
        if chain_blocks.len() as u64 != expected_tree + expected_payload {
            return Err(CoreError::corruption(format!(
                "node {index}: chain owns {} blocks, {} expected",
                chain_blocks.len(),
                expected_tree + expected_payload
            )));
        }

        let leaves = if expected_tree == 0 {
            vec![record.digest]
        } else {
            let mut bytes = Vec::with_capacity((expected_tree as usize) * BLOCK_SIZE);
            for &block in &chain_blocks[..expected_tree as usize] {
                bytes.extend_from_slice(&device.read_blocks(sb.data_block(block), 1)?);
            }
            MerkleTree::leaves_from_bytes(&bytes, leaf_count as usize)?
        };

        let info = BlobInfo {
            node: index,
            digest: record.digest,
            logical_size: record.logical_size,
            stored_size: record.stored_size,
            compressed: record.compressed,
            payload_blocks: chain_blocks[expected_tree as usize..]
                .iter()
                .map(|&rel| sb.data_block(rel))
                .collect(),
        };
        cache.register(info, leaves)?;
    }
    debug!(blobs = cache.len(), "node scan complete");
    Ok(())
}
