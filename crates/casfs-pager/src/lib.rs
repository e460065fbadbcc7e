//! Demand pager and blob cache for casfs.
//!
//! Blob data is never trusted straight off the device. Reads go through
//! the [`Pager`], which pages absent blocks into memory through a bounded
//! [`TransferBuffer`] and verifies every newly paged chunk against the
//! blob's merkle tree before a single byte reaches the reader. A failed
//! check is a distinguishable corruption error scoped to that blob, never
//! a silently wrong read.
//!
//! The [`BlobCache`] tracks one entry per allocated node, keyed by node
//! index and by root digest -- registering a second entry with the same
//! digest is a corruption error. Entries move between three states:
//!
//! - **Open**: at least one handle held; resident data stays.
//! - **Closed-cached**: no handles. Under [`CachePolicy::NeverEvict`] the
//!   resident data is retained until teardown; under
//!   [`CachePolicy::EvictImmediately`] it is dropped at the last close,
//!   so a future open re-pages and re-verifies from storage.
//! - **Evicted/removed**: the entry is gone (blob deleted or filesystem
//!   torn down).
//!
//! At most one page-in is in flight per block: concurrent readers of the
//! same absent block join the in-flight request instead of issuing a
//! duplicate storage read.

pub mod cache;
pub mod error;
pub mod pager;
pub mod policy;
pub mod transfer;

pub use cache::{BlobCache, BlobHandle, BlobInfo, CacheEntry};
pub use error::{PagerError, PagerResult};
pub use pager::Pager;
pub use policy::CachePolicy;
pub use transfer::TransferBuffer;
