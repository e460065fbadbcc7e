use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use casfs_device::{BlockDevice, WriteOp};
use tracing::{debug, error, trace, warn};

use crate::entry::{encode_entry, JournalHeader, JournalOp};
use crate::error::{JournalError, JournalResult};
use crate::transaction::Transaction;

/// How committed entries reach their final locations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyMode {
    /// A background worker applies entries as they are committed.
    Background,
    /// Entries stay in the ring until [`Journal::apply_pending`] is
    /// called. Used by crash tests and offline tooling; a filesystem
    /// mounted this way is durable but never checkpoints on its own.
    Manual,
}

/// Journal configuration.
#[derive(Clone, Debug)]
pub struct JournalConfig {
    pub mode: ApplyMode,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            mode: ApplyMode::Background,
        }
    }
}

/// Waitable handle for a committed transaction.
///
/// Resolves once the transaction's metadata ops are applied and the
/// checkpoint has advanced past its entry. Completions resolve in
/// submission order; the sequence number is the entry's position in that
/// order.
pub struct Completion {
    seq: u64,
    rx: mpsc::Receiver<JournalResult<()>>,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("seq", &self.seq).finish()
    }
}

impl Completion {
    /// The committed entry's sequence number.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// Block until the transaction is fully applied.
    pub fn wait(self) -> JournalResult<()> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(JournalError::Shutdown),
        }
    }

    /// Poll without blocking. `None` means still in flight.
    pub fn try_wait(&self) -> Option<JournalResult<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(JournalError::Shutdown)),
        }
    }
}

/// Ring geometry: one header block followed by the entry area.
#[derive(Clone, Copy, Debug)]
struct Ring {
    /// Device-absolute block of the header.
    header_block: u64,
    /// Device-absolute block of entry offset zero.
    first_block: u64,
    /// Entry-area size in blocks.
    blocks: u64,
}

/// Mutable append-side state. `head`/`tail` are entry-area offsets;
/// `live` counts blocks between them (including wrap padding), so
/// `blocks - live` is always the free space and live entries are never
/// overwritten.
struct WriterState {
    head: u64,
    tail: u64,
    next_seq: u64,
    live: u64,
}

/// A durable entry waiting to be applied.
struct WorkItem {
    seq: u64,
    offset: u64,
    blocks: u64,
    pad: u64,
    ops: Vec<JournalOp>,
    /// Keeps trims and reservations alive until application; dropped (and
    /// reservations released) only after the commit is fully applied.
    txn: Transaction,
    done: mpsc::Sender<JournalResult<()>>,
}

/// Hook run after each applied transaction (the runtime verify-after-
/// commit option).
pub type PostApplyHook = Box<dyn Fn() + Send + Sync>;

struct Shared {
    device: Arc<dyn BlockDevice>,
    ring: Ring,
    state: Mutex<WriterState>,
    space: Condvar,
    apply_lock: Arc<RwLock<()>>,
    failed: AtomicBool,
    hook: Mutex<Option<PostApplyHook>>,
}

/// The write-ahead journal.
///
/// `commit` makes a [`Transaction`] durable and queues it for
/// application; see the crate docs for the full pipeline. One `Journal`
/// exists per mounted filesystem, created after [`replay`](crate::replay)
/// has run.
pub struct Journal {
    shared: Arc<Shared>,
    mode: ApplyMode,
    sender: Mutex<Option<mpsc::Sender<WorkItem>>>,
    pending: Mutex<VecDeque<WorkItem>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Journal {
    /// Open the journal over an already-replayed (empty) ring.
    pub fn open(
        device: Arc<dyn BlockDevice>,
        journal_start: u64,
        journal_blocks: u64,
        config: JournalConfig,
    ) -> JournalResult<Self> {
        if journal_blocks < 2 {
            return Err(JournalError::CorruptHeader {
                reason: format!("journal region of {journal_blocks} blocks is too small"),
            });
        }
        let ring = Ring {
            header_block: journal_start,
            first_block: journal_start + 1,
            blocks: journal_blocks - 1,
        };
        let header_bytes = device.read_blocks(ring.header_block, 1)?;
        let header = JournalHeader::decode(&header_bytes)?;
        if header.head_offset >= ring.blocks {
            return Err(JournalError::CorruptHeader {
                reason: format!(
                    "head offset {} outside ring of {} blocks",
                    header.head_offset, ring.blocks
                ),
            });
        }

        let shared = Arc::new(Shared {
            device,
            ring,
            state: Mutex::new(WriterState {
                head: header.head_offset,
                tail: header.head_offset,
                next_seq: header.head_seq,
                live: 0,
            }),
            space: Condvar::new(),
            apply_lock: Arc::new(RwLock::new(())),
            failed: AtomicBool::new(false),
            hook: Mutex::new(None),
        });

        let journal = Self {
            shared: Arc::clone(&shared),
            mode: config.mode,
            sender: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            worker: Mutex::new(None),
        };

        if config.mode == ApplyMode::Background {
            let (tx, rx) = mpsc::channel::<WorkItem>();
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("casfs-journal".into())
                .spawn(move || run_worker(worker_shared, rx))
                .map_err(|e| JournalError::Serialization(format!("spawn failed: {e}")))?;
            *journal.sender.lock().expect("lock poisoned") = Some(tx);
            *journal.worker.lock().expect("lock poisoned") = Some(handle);
        }

        debug!(
            head = header.head_offset,
            seq = header.head_seq,
            ring_blocks = ring.blocks,
            mode = ?config.mode,
            "journal opened"
        );
        Ok(journal)
    }

    /// The lock serializing transaction application against consistency
    /// checks: application holds it exclusively, checks hold it shared.
    pub fn apply_lock(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.shared.apply_lock)
    }

    /// Install the post-apply hook (runtime verify-after-commit option).
    pub fn set_post_apply_hook(&self, hook: PostApplyHook) {
        *self.shared.hook.lock().expect("lock poisoned") = Some(hook);
    }

    /// Whether a device error has latched the journal into the failed
    /// (read-only) state.
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Commit a transaction: issue its data writes, make its metadata
    /// entry durable in the ring, and queue it for application. Returns
    /// once the entry is durable; the [`Completion`] resolves when the
    /// entry is applied.
    pub fn commit(&self, mut txn: Transaction) -> JournalResult<Completion> {
        if self.is_failed() {
            return Err(JournalError::Failed);
        }

        // Data before metadata: new content must be on disk before any
        // entry marking it allocated can become durable.
        if !txn.data_ops.is_empty() {
            self.shared.device.write_blocks(&txn.data_ops)?;
            self.shared.device.flush()?;
            txn.data_ops.clear();
        }

        let ops = std::mem::take(&mut txn.metadata_ops);
        let ring = self.shared.ring;

        let mut state = self.shared.state.lock().expect("lock poisoned");
        let seq = state.next_seq;
        let frame = encode_entry(seq, &ops)?;
        let blocks = (frame.len() / casfs_types::BLOCK_SIZE) as u64;
        if blocks > ring.blocks {
            return Err(JournalError::EntryTooLarge {
                blocks,
                capacity: ring.blocks,
            });
        }

        // Find space, skipping the tail fragment when the frame would
        // straddle the wrap point.
        let (offset, pad) = loop {
            let mut pad = if state.tail + blocks > ring.blocks {
                ring.blocks - state.tail
            } else {
                0
            };
            if pad > 0 && state.live == 0 {
                // Empty ring: relocate to offset zero instead of padding.
                state.head = 0;
                state.tail = 0;
                let header = JournalHeader {
                    head_offset: 0,
                    head_seq: state.next_seq,
                };
                self.shared.device.write_blocks(&[WriteOp {
                    block: ring.header_block,
                    data: header.encode(),
                }])?;
                self.shared.device.flush()?;
                pad = 0;
            }
            let free = ring.blocks - state.live;
            if blocks + pad <= free {
                let offset = if pad > 0 { 0 } else { state.tail };
                break (offset, pad);
            }
            match self.mode {
                ApplyMode::Background => {
                    state = self.shared.space.wait(state).expect("lock poisoned");
                    if self.is_failed() {
                        return Err(JournalError::Failed);
                    }
                }
                ApplyMode::Manual => {
                    return Err(JournalError::Full {
                        needed: blocks + pad,
                        free,
                    });
                }
            }
        };

        // Durable append.
        self.shared.device.write_blocks(&[WriteOp {
            block: ring.first_block + offset,
            data: frame,
        }])?;
        self.shared.device.flush()?;

        state.tail = (offset + blocks) % ring.blocks;
        state.live += pad + blocks;
        state.next_seq = seq + 1;
        drop(state);

        trace!(seq, offset, blocks, pad, "journal entry appended");

        let (done_tx, done_rx) = mpsc::channel();
        let item = WorkItem {
            seq,
            offset,
            blocks,
            pad,
            ops,
            txn,
            done: done_tx,
        };

        match self.mode {
            ApplyMode::Background => {
                let sender = self.sender.lock().expect("lock poisoned");
                match sender.as_ref() {
                    Some(tx) => tx.send(item).map_err(|_| JournalError::Shutdown)?,
                    None => return Err(JournalError::Shutdown),
                }
            }
            ApplyMode::Manual => {
                self.pending.lock().expect("lock poisoned").push_back(item);
            }
        }

        Ok(Completion { seq, rx: done_rx })
    }

    /// Apply every queued entry now (manual mode). Returns the number of
    /// entries applied.
    pub fn apply_pending(&self) -> JournalResult<usize> {
        let mut applied = 0;
        loop {
            let item = self.pending.lock().expect("lock poisoned").pop_front();
            let Some(mut item) = item else { break };
            let result = apply_item(&self.shared, &mut item);
            let failed = result.is_err();
            let _ = item.done.send(result);
            if failed {
                self.shared.failed.store(true, Ordering::Release);
                return Err(JournalError::Failed);
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Number of committed-but-unapplied entries (manual mode).
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("lock poisoned").len()
    }

    /// Stop accepting commits, drain the worker, and join it. Called on
    /// unmount after the final clean-flag transaction.
    pub fn shutdown(&self) {
        // Dropping the sender lets the worker drain its queue and exit.
        self.sender.lock().expect("lock poisoned").take();
        if let Some(handle) = self.worker.lock().expect("lock poisoned").take() {
            if handle.join().is_err() {
                error!("journal worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().expect("lock poisoned");
        f.debug_struct("Journal")
            .field("mode", &self.mode)
            .field("head", &state.head)
            .field("tail", &state.tail)
            .field("next_seq", &state.next_seq)
            .field("live_blocks", &state.live)
            .field("failed", &self.is_failed())
            .finish()
    }
}

fn run_worker(shared: Arc<Shared>, rx: mpsc::Receiver<WorkItem>) {
    while let Ok(mut item) = rx.recv() {
        if shared.failed.load(Ordering::Acquire) {
            let _ = item.done.send(Err(JournalError::Failed));
            continue;
        }
        let result = apply_item(&shared, &mut item);
        if let Err(e) = &result {
            error!(seq = item.seq, error = %e, "journal application failed; latching read-only");
            shared.failed.store(true, Ordering::Release);
            // Wake any committer waiting for space; it will observe the
            // failed flag.
            shared.space.notify_all();
        }
        let _ = item.done.send(result);
    }
}

/// Apply one durable entry to its final locations and advance the
/// checkpoint. Shared by the background worker and manual application.
fn apply_item(shared: &Shared, item: &mut WorkItem) -> JournalResult<()> {
    let writes: Vec<WriteOp> = item
        .ops
        .drain(..)
        .map(|op| WriteOp {
            block: op.target,
            data: op.data,
        })
        .collect();

    {
        // Exclusive against consistency checks: no check may observe some
        // of this entry's ops applied and others not.
        let _guard = shared.apply_lock.write().expect("lock poisoned");
        if !writes.is_empty() {
            shared.device.write_blocks(&writes)?;
            shared.device.flush()?;
        }
    }

    // Advisory trims after the metadata is live.
    if shared.device.supports_trim() {
        for &(block, count) in &item.txn.trim_ops {
            if let Err(e) = shared.device.trim(block, count) {
                warn!(block, count, error = %e, "trim failed; continuing");
            }
        }
    }

    // Advance the checkpoint past this entry.
    let mut state = shared.state.lock().expect("lock poisoned");
    state.head = (item.offset + item.blocks) % shared.ring.blocks;
    state.live -= item.pad + item.blocks;
    let header = JournalHeader {
        head_offset: state.head,
        head_seq: item.seq + 1,
    };
    shared.device.write_blocks(&[WriteOp {
        block: shared.ring.header_block,
        data: header.encode(),
    }])?;
    shared.device.flush()?;
    drop(state);
    shared.space.notify_all();

    trace!(seq = item.seq, "journal entry applied");

    if let Some(hook) = shared.hook.lock().expect("lock poisoned").as_ref() {
        hook();
    }
    Ok(())
}
