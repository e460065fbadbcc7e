//! Filesystem core for casfs.
//!
//! Ties the subsystem crates together into a mountable filesystem:
//!
//! - [`format`] -- the superblock, the region layout, and `mkfs`
//! - [`node_map`] -- 128-byte node records and blob chains
//! - [`fs`] -- the [`CasFs`] handle: mount/unmount, blob
//!   create/open/delete, sync, enumeration
//! - [`volume`] -- growing the block and node address space
//! - [`check`] -- the consistency check, runnable offline or after every
//!   commit via a mount option
//!
//! A blob's name is the BLAKE3 merkle root of its content. Metadata
//! changes flow through the write-ahead journal, so a crash at any point
//! recovers to a consistent state at the next mount.

pub mod check;
pub mod error;
pub mod format;
pub mod fs;
pub mod node_map;
pub mod volume;

pub use check::{check_device, CheckReport};
pub use error::{CoreError, CoreResult};
pub use format::{format_device, load_superblock, FormatOptions, Superblock, CURRENT_REVISION};
pub use fs::{BlobReader, BlobWriter, CasFs, FsStats, MountOptions};
pub use node_map::{NodeMap, NodeRecord};

pub use casfs_journal::ApplyMode;
pub use casfs_pager::CachePolicy;
pub use casfs_types::Digest;
