use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

use casfs_merkle::{chunk_count, MerkleTree, CHUNK_SIZE};
use casfs_types::{Digest, NodeIndex};
use tracing::{debug, trace};

use crate::error::{PagerError, PagerResult};
use crate::policy::CachePolicy;

/// Immutable description of a stored blob, captured at registration.
#[derive(Clone, Debug)]
pub struct BlobInfo {
    /// Node slot owning the blob's chain.
    pub node: NodeIndex,
    /// Root digest -- the blob's name.
    pub digest: Digest,
    /// Uncompressed content length in bytes.
    pub logical_size: u64,
    /// Stored payload length in bytes (equals `logical_size` unless
    /// compressed).
    pub stored_size: u64,
    /// Whether the stored payload is zstd-compressed.
    pub compressed: bool,
    /// Device-absolute block numbers of the stored payload, in payload
    /// order (tree blocks excluded).
    pub payload_blocks: Vec<u64>,
}

/// Resident data for one blob.
///
/// Uncompressed blobs page chunk-by-chunk; compressed blobs are paged in
/// whole (the frame cannot be decoded piecemeal) and cached uncompressed.
pub(crate) enum Residency {
    Chunks(Vec<Option<Vec<u8>>>),
    Whole(Option<Vec<u8>>),
}

pub(crate) struct EntryInner {
    open_count: u32,
    pub(crate) residency: Residency,
    /// Chunk indices with a page-in in flight (compressed blobs use a
    /// single slot, index 0).
    pub(crate) in_flight: HashSet<u64>,
}

/// One cached blob. Exactly one entry exists per allocated node.
pub struct CacheEntry {
    info: BlobInfo,
    tree: MerkleTree,
    policy: CachePolicy,
    pub(crate) inner: Mutex<EntryInner>,
    pub(crate) arrived: Condvar,
}

impl CacheEntry {
    fn new(info: BlobInfo, tree: MerkleTree, policy: CachePolicy) -> Self {
        let residency = if info.compressed {
            Residency::Whole(None)
        } else {
            Residency::Chunks(vec![None; chunk_count(info.logical_size) as usize])
        };
        Self {
            info,
            tree,
            policy,
            inner: Mutex::new(EntryInner {
                open_count: 0,
                residency,
                in_flight: HashSet::new(),
            }),
            arrived: Condvar::new(),
        }
    }

    /// The blob's stored description.
    pub fn info(&self) -> &BlobInfo {
        &self.info
    }

    /// The verified merkle tree (root already checked against the name).
    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    /// Current open-handle count.
    pub fn open_count(&self) -> u32 {
        self.inner.lock().expect("lock poisoned").open_count
    }

    /// Whether any resident data is held. Tests use this to observe
    /// eviction.
    pub fn has_resident_data(&self) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        match &inner.residency {
            Residency::Chunks(slots) => slots.iter().any(|s| s.is_some()),
            Residency::Whole(slot) => slot.is_some(),
        }
    }

    /// Pre-fill residency with just-written content, sparing the first
    /// reader a page-in. Skipped when the policy would evict the data at
    /// the close that follows creation anyway.
    pub fn seed(&self, data: &[u8]) {
        if self.policy == CachePolicy::EvictImmediately {
            return;
        }
        debug_assert_eq!(data.len() as u64, self.info.logical_size);
        let mut inner = self.inner.lock().expect("lock poisoned");
        match &mut inner.residency {
            Residency::Chunks(slots) => {
                if data.is_empty() {
                    slots[0] = Some(Vec::new());
                } else {
                    for (i, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
                        slots[i] = Some(chunk.to_vec());
                    }
                }
            }
            Residency::Whole(slot) => *slot = Some(data.to_vec()),
        }
    }

    fn open(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.open_count += 1;
    }

    fn close(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.open_count = inner.open_count.saturating_sub(1);
        if inner.open_count == 0 && self.policy == CachePolicy::EvictImmediately {
            match &mut inner.residency {
                Residency::Chunks(slots) => slots.iter_mut().for_each(|s| *s = None),
                Residency::Whole(slot) => *slot = None,
            }
            trace!(digest = %self.info.digest.short_hex(), "evicted on close");
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("node", &self.info.node)
            .field("digest", &self.info.digest)
            .field("open_count", &self.open_count())
            .finish()
    }
}

/// An open reference to a cached blob. Dropping the handle closes it,
/// applying the eviction policy at the last close.
pub struct BlobHandle {
    entry: Arc<CacheEntry>,
}

impl BlobHandle {
    /// The underlying cache entry.
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

impl Drop for BlobHandle {
    fn drop(&mut self) {
        self.entry.close();
    }
}

impl std::fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlobHandle({})", self.entry.info().digest.short_hex())
    }
}

struct Maps {
    by_node: HashMap<NodeIndex, Arc<CacheEntry>>,
    by_digest: HashMap<Digest, NodeIndex>,
}

/// Registry of all live blobs, keyed by node index and by digest.
pub struct BlobCache {
    policy: CachePolicy,
    maps: Mutex<Maps>,
}

impl BlobCache {
    pub fn new(policy: CachePolicy) -> Self {
        debug!(%policy, "blob cache created");
        Self {
            policy,
            maps: Mutex::new(Maps {
                by_node: HashMap::new(),
                by_digest: HashMap::new(),
            }),
        }
    }

    /// The eviction policy in force.
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Register a blob. `leaves` is the stored merkle leaf level (for a
    /// single-chunk blob, the name itself). The leaves are re-hashed and
    /// the computed root must equal the blob's name; a mismatch, a
    /// duplicate digest, or a duplicate node is a corruption error.
    pub fn register(&self, info: BlobInfo, leaves: Vec<Digest>) -> PagerResult<Arc<CacheEntry>> {
        let tree = MerkleTree::from_leaves(leaves)?;
        let computed = tree.root();
        if computed != info.digest {
            return Err(PagerError::RootMismatch {
                digest: info.digest,
                computed,
            });
        }

        let mut maps = self.maps.lock().expect("lock poisoned");
        if let Some(&existing) = maps.by_digest.get(&info.digest) {
            return Err(PagerError::DuplicateDigest {
                digest: info.digest,
                existing,
                new: info.node,
            });
        }
        if maps.by_node.contains_key(&info.node) {
            return Err(PagerError::DuplicateNode { node: info.node });
        }

        let node = info.node;
        let digest = info.digest;
        let entry = Arc::new(CacheEntry::new(info, tree, self.policy));
        maps.by_node.insert(node, Arc::clone(&entry));
        maps.by_digest.insert(digest, node);
        trace!(node, digest = %digest.short_hex(), "blob registered");
        Ok(entry)
    }

    /// Whether a blob with this name exists.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.maps
            .lock()
            .expect("lock poisoned")
            .by_digest
            .contains_key(digest)
    }

    /// Open a blob by name, bumping its open count.
    pub fn open(&self, digest: &Digest) -> Option<BlobHandle> {
        let maps = self.maps.lock().expect("lock poisoned");
        let node = maps.by_digest.get(digest)?;
        let entry = Arc::clone(maps.by_node.get(node)?);
        drop(maps);
        entry.open();
        Some(BlobHandle { entry })
    }

    /// Look up an entry by node index without opening it.
    pub fn entry_by_node(&self, node: NodeIndex) -> Option<Arc<CacheEntry>> {
        self.maps
            .lock()
            .expect("lock poisoned")
            .by_node
            .get(&node)
            .cloned()
    }

    /// Remove a blob (deletion). Fails while handles are open: the entry
    /// must reach Closed before it can reach Free.
    pub fn remove(&self, digest: &Digest) -> PagerResult<Option<BlobInfo>> {
        let mut maps = self.maps.lock().expect("lock poisoned");
        let Some(&node) = maps.by_digest.get(digest) else {
            return Ok(None);
        };
        let entry = maps.by_node.get(&node).expect("digest and node maps agree");
        let open_count = entry.open_count();
        if open_count > 0 {
            return Err(PagerError::StillOpen {
                digest: *digest,
                open_count,
            });
        }
        let entry = maps.by_node.remove(&node).expect("checked above");
        maps.by_digest.remove(digest);
        trace!(node, digest = %digest.short_hex(), "blob removed from cache");
        Ok(Some(entry.info.clone()))
    }

    /// Names of all live blobs, sorted.
    pub fn digests(&self) -> Vec<Digest> {
        let maps = self.maps.lock().expect("lock poisoned");
        let mut out: Vec<Digest> = maps.by_digest.keys().copied().collect();
        out.sort();
        out
    }

    /// Number of live blobs.
    pub fn len(&self) -> usize {
        self.maps.lock().expect("lock poisoned").by_node.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache")
            .field("policy", &self.policy)
            .field("entries", &self.len())
            .finish()
    }
}
