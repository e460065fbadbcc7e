use casfs_alloc::AllocError;
use casfs_device::DeviceError;
use casfs_journal::JournalError;
use casfs_merkle::MerkleError;
use casfs_pager::PagerError;
use casfs_types::Digest;

/// Errors from filesystem-core operations.
///
/// The variants follow the error taxonomy the filesystem is built around:
/// I/O errors abort the operation (journal failures degrade the mount to
/// read-only), out-of-space and no-room are normal failures, corruption
/// and format errors are fatal for the object or the mount respectively.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Underlying device failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Allocator failure. `OutOfSpace` is a normal failure; the rest
    /// indicate metadata corruption.
    #[error("allocator error: {0}")]
    Alloc(#[from] AllocError),

    /// Journal failure. After one of these the filesystem is read-only.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// Pager or blob-cache failure, including merkle verification
    /// failures scoped to a single blob.
    #[error("pager error: {0}")]
    Pager(#[from] PagerError),

    /// Malformed stored merkle tree.
    #[error("merkle error: {0}")]
    Merkle(#[from] MerkleError),

    /// The superblock failed validation; the mount aborts entirely.
    #[error("format error: {reason}")]
    Format { reason: String },

    /// On-disk metadata is inconsistent. Fatal for the affected object;
    /// at mount time, fatal for the mount.
    #[error("corruption: {reason}")]
    Corruption { reason: String },

    /// A blob with this name already exists. Content-addressed names
    /// make this a normal outcome of re-writing identical content.
    #[error("blob {0} already exists")]
    AlreadyExists(Digest),

    /// No blob with this name.
    #[error("blob {0} not found")]
    NotFound(Digest),

    /// The blob still has open handles; it must be closed before it can
    /// be deleted.
    #[error("blob {0} is busy")]
    Busy(Digest),

    /// A mutating operation was issued against a read-only mount.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// The journal holds committed-but-unapplied entries and the device
    /// cannot be written; the mount fails closed.
    #[error("cannot replay {pending} journal entries on a read-only device")]
    ReplayOnReadOnly { pending: usize },

    /// The address space cannot grow any further. A normal, non-fatal
    /// failure.
    #[error("no room to grow: requested {requested} more {what}")]
    NoRoom { what: &'static str, requested: u64 },
}

impl CoreError {
    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        Self::Corruption {
            reason: reason.into(),
        }
    }

    pub(crate) fn format(reason: impl Into<String>) -> Self {
        Self::Format {
            reason: reason.into(),
        }
    }
}

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
