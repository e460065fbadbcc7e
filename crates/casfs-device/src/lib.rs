//! Block device and volume manager collaborators for casfs.
//!
//! The filesystem core never talks to hardware directly; it goes through
//! the [`BlockDevice`] trait, and the volume grower goes through
//! [`VolumeManager`]. Every operation on these traits is fallible -- the
//! core treats all of them as I/O that can fail and never assumes success.
//!
//! # Implementations
//!
//! - [`MemDevice`] -- byte-vector backed device for tests and embedding.
//!   Doubles as a [`VolumeManager`] with a bounded growable capacity, and
//!   counts reads/flushes so tests can assert paging behavior.
//! - [`FileDevice`] -- positioned I/O against an image file, used by the
//!   operator CLI.

pub mod error;
pub mod file;
pub mod memory;
pub mod traits;

pub use error::{DeviceError, DeviceResult};
pub use file::FileDevice;
pub use memory::MemDevice;
pub use traits::{BlockDevice, ExtendStatus, VolumeManager, WriteOp};
