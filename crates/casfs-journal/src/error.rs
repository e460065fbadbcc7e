use casfs_device::DeviceError;

/// Errors from journal operations.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Underlying device failure. After one of these the journal latches
    /// into a failed state and the filesystem degrades to read-only.
    #[error("journal device error: {0}")]
    Device(#[from] DeviceError),

    /// Entry payload could not be serialized or deserialized.
    #[error("journal serialization error: {0}")]
    Serialization(String),

    /// The journal header block failed validation at mount.
    #[error("corrupt journal header: {reason}")]
    CorruptHeader { reason: String },

    /// A single transaction is larger than the whole ring.
    #[error("journal entry of {blocks} blocks exceeds ring capacity {capacity}")]
    EntryTooLarge { blocks: u64, capacity: u64 },

    /// No ring space and nothing pending that could free it (manual
    /// application mode only).
    #[error("journal full: need {needed} blocks, {free} free")]
    Full { needed: u64, free: u64 },

    /// The journal worker has shut down.
    #[error("journal is shut down")]
    Shutdown,

    /// A previous device error put the journal into the failed state.
    #[error("journal has failed; filesystem is read-only")]
    Failed,
}

/// Result alias for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;
