//! Write-ahead journal for casfs.
//!
//! The journal makes a batch of metadata block writes atomic and
//! replayable after a crash. A [`Transaction`] collects the batch --
//! bitmap blocks, node-map blocks, the superblock -- together with the
//! data-block writes and trims that ride along, and the reservations it
//! consumes. [`Journal::commit`] then runs the pipeline:
//!
//! 1. data-block writes are issued and flushed (new content lands on disk
//!    before anything marks it allocated, so a crash can at worst lose an
//!    uncommitted allocation, never expose garbage as live data);
//! 2. the metadata ops are serialized into a sequence-numbered, CRC-framed
//!    entry and appended to the on-disk ring buffer, then flushed -- at
//!    this point the transaction is durable;
//! 3. a background worker applies each op to its final location, strictly
//!    in submission order, then advances the ring's checkpoint header and
//!    resolves the caller's [`Completion`].
//!
//! At mount time, [`replay`] scans the ring from the last checkpoint and
//! re-applies every committed-but-unapplied entry before any other
//! filesystem activity. Replay is idempotent: entries carry their target
//! locations, so re-applying rewrites identical bytes.
//!
//! Application takes an exclusive lock that consistency checks share (see
//! [`Journal::apply_lock`]), so a check never observes a torn mid-commit
//! state.

pub mod entry;
pub mod error;
pub mod journal;
pub mod replay;
pub mod transaction;

pub use entry::JournalOp;
pub use error::{JournalError, JournalResult};
pub use journal::{ApplyMode, Completion, Journal, JournalConfig};
pub use replay::{format_journal, pending_entries, replay, ReplayReport};
pub use transaction::Transaction;
