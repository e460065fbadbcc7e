//! Mount-time journal replay.
//!
//! Before any other filesystem activity, the ring is scanned from the last
//! checkpoint and every committed-but-unapplied entry is re-applied to its
//! final location. Scanning stops at the first frame that fails magic,
//! CRC, or sequence validation -- that is the torn tail of the log.
//! Re-applying an already-applied entry rewrites identical bytes, so
//! replay is idempotent.

use casfs_device::{BlockDevice, WriteOp};
use casfs_types::BLOCK_SIZE;
use tracing::{debug, info, warn};

use crate::entry::{decode_payload, parse_entry_head, JournalHeader, JournalOp};
use crate::error::{JournalError, JournalResult};

/// Outcome of a replay pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries re-applied.
    pub entries: usize,
    /// Individual block ops re-applied.
    pub ops: usize,
}

/// A validated entry found during the scan.
pub(crate) struct ScannedEntry {
    pub offset: u64,
    pub blocks: u64,
    pub seq: u64,
    pub ops: Vec<JournalOp>,
}

/// Scan the ring from the checkpoint, returning every valid entry in
/// sequence order.
pub(crate) fn scan(
    device: &dyn BlockDevice,
    journal_start: u64,
    journal_blocks: u64,
) -> JournalResult<(JournalHeader, Vec<ScannedEntry>)> {
    if journal_blocks < 2 {
        return Err(JournalError::CorruptHeader {
            reason: format!("journal region of {journal_blocks} blocks is too small"),
        });
    }
    let ring_blocks = journal_blocks - 1;
    let first_block = journal_start + 1;

    let header_bytes = device.read_blocks(journal_start, 1)?;
    let header = JournalHeader::decode(&header_bytes)?;
    if header.head_offset >= ring_blocks {
        return Err(JournalError::CorruptHeader {
            reason: format!(
                "head offset {} outside ring of {ring_blocks} blocks",
                header.head_offset
            ),
        });
    }

    let mut entries = Vec::new();
    let mut offset = header.head_offset;
    let mut expected_seq = header.head_seq;
    let mut scanned_blocks: u64 = 0;
    let mut probed_wrap = false;

    while scanned_blocks < ring_blocks {
        let first = device.read_blocks(first_block + offset, 1)?;
        let parsed = parse_entry_head(&first, ring_blocks)
            .filter(|head| head.seq == expected_seq)
            .filter(|head| offset + head.blocks() <= ring_blocks);

        let Some(head) = parsed else {
            // A failed parse mid-ring may mean the writer skipped the tail
            // fragment and continued at offset zero; probe there once.
            if !probed_wrap && offset != 0 {
                scanned_blocks += ring_blocks - offset;
                offset = 0;
                probed_wrap = true;
                continue;
            }
            break;
        };

        let blocks = head.blocks();
        let mut frame = first;
        if blocks > 1 {
            let rest = device.read_blocks(first_block + offset + 1, blocks - 1)?;
            frame.extend_from_slice(&rest);
        }
        let Some(ops) = decode_payload(&head, &frame) else {
            warn!(offset, seq = expected_seq, "torn journal entry; stopping scan");
            break;
        };

        entries.push(ScannedEntry {
            offset,
            blocks,
            seq: head.seq,
            ops,
        });
        scanned_blocks += blocks;
        offset = (offset + blocks) % ring_blocks;
        expected_seq += 1;
    }

    Ok((header, entries))
}

/// Number of committed-but-unapplied entries, without applying anything.
///
/// A read-only mount uses this to fail closed: replay requires a writable
/// device.
pub fn pending_entries(
    device: &dyn BlockDevice,
    journal_start: u64,
    journal_blocks: u64,
) -> JournalResult<usize> {
    let (_, entries) = scan(device, journal_start, journal_blocks)?;
    Ok(entries.len())
}

/// Replay the journal: apply every committed-but-unapplied entry to its
/// final location, then reset the checkpoint to the empty ring.
pub fn replay(
    device: &dyn BlockDevice,
    journal_start: u64,
    journal_blocks: u64,
) -> JournalResult<ReplayReport> {
    let (header, entries) = scan(device, journal_start, journal_blocks)?;
    if entries.is_empty() {
        debug!("journal clean; nothing to replay");
        return Ok(ReplayReport::default());
    }

    let ring_blocks = journal_blocks - 1;
    let mut report = ReplayReport::default();
    for entry in &entries {
        let writes: Vec<WriteOp> = entry
            .ops
            .iter()
            .map(|op| WriteOp {
                block: op.target,
                data: op.data.clone(),
            })
            .collect();
        debug_assert!(writes.iter().all(|w| w.data.len() % BLOCK_SIZE == 0));
        if !writes.is_empty() {
            device.write_blocks(&writes)?;
        }
        report.entries += 1;
        report.ops += entry.ops.len();
    }
    device.flush()?;

    // All entries are applied; the ring is empty again.
    let last = entries.last().expect("entries is non-empty");
    let new_header = JournalHeader {
        head_offset: (last.offset + last.blocks) % ring_blocks,
        head_seq: last.seq + 1,
    };
    device.write_blocks(&[WriteOp {
        block: journal_start,
        data: new_header.encode(),
    }])?;
    device.flush()?;

    info!(
        entries = report.entries,
        ops = report.ops,
        from_seq = header.head_seq,
        "journal replayed"
    );
    Ok(report)
}

/// Write a fresh, empty journal header. Used when formatting a device.
pub fn format_journal(
    device: &dyn BlockDevice,
    journal_start: u64,
    journal_blocks: u64,
) -> JournalResult<()> {
    if journal_blocks < 2 {
        return Err(JournalError::CorruptHeader {
            reason: format!("journal region of {journal_blocks} blocks is too small"),
        });
    }
    let header = JournalHeader {
        head_offset: 0,
        head_seq: 1,
    };
    device.write_blocks(&[WriteOp {
        block: journal_start,
        data: header.encode(),
    }])?;
    device.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use casfs_device::MemDevice;

    use crate::journal::{ApplyMode, Journal, JournalConfig};
    use crate::transaction::Transaction;

    const JOURNAL_START: u64 = 1;
    const JOURNAL_BLOCKS: u64 = 9; // 1 header + 8 ring blocks
    const DATA_BASE: u64 = 10;

    /// Device layout for these tests: block 0 unused, journal at 1..10,
    /// "metadata" targets from 10 up.
    fn fresh_device() -> Arc<MemDevice> {
        let dev = Arc::new(MemDevice::new(32));
        format_journal(dev.as_ref(), JOURNAL_START, JOURNAL_BLOCKS).unwrap();
        dev
    }

    fn manual_journal(dev: &Arc<MemDevice>) -> Journal {
        Journal::open(
            Arc::<MemDevice>::clone(dev) as Arc<dyn casfs_device::BlockDevice>,
            JOURNAL_START,
            JOURNAL_BLOCKS,
            JournalConfig {
                mode: ApplyMode::Manual,
            },
        )
        .unwrap()
    }

    fn metadata_txn(target: u64, fill: u8) -> Transaction {
        let mut txn = Transaction::new();
        txn.add_metadata_write(target, vec![fill; BLOCK_SIZE]);
        txn
    }

    #[test]
    fn committed_but_unapplied_entries_replay() {
        let dev = fresh_device();
        {
            let journal = manual_journal(&dev);
            journal.commit(metadata_txn(DATA_BASE, 0x11)).unwrap();
            journal.commit(metadata_txn(DATA_BASE + 1, 0x22)).unwrap();
            assert_eq!(journal.pending_count(), 2);
            // Simulated crash: journal dropped without applying.
        }

        // Targets untouched before replay.
        assert_eq!(dev.read_blocks(DATA_BASE, 1).unwrap(), vec![0u8; BLOCK_SIZE]);

        let report = replay(dev.as_ref(), JOURNAL_START, JOURNAL_BLOCKS).unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.ops, 2);
        assert_eq!(
            dev.read_blocks(DATA_BASE, 1).unwrap(),
            vec![0x11; BLOCK_SIZE]
        );
        assert_eq!(
            dev.read_blocks(DATA_BASE + 1, 1).unwrap(),
            vec![0x22; BLOCK_SIZE]
        );

        // Ring is empty afterwards.
        assert_eq!(
            pending_entries(dev.as_ref(), JOURNAL_START, JOURNAL_BLOCKS).unwrap(),
            0
        );
    }

    #[test]
    fn replay_twice_is_identical_to_once() {
        let dev = fresh_device();
        {
            let journal = manual_journal(&dev);
            journal.commit(metadata_txn(DATA_BASE, 0x33)).unwrap();
            journal.commit(metadata_txn(DATA_BASE + 2, 0x44)).unwrap();
        }
        let crashed = dev.snapshot();

        // Image A: replay once.
        let dev_a = MemDevice::from_image(crashed.clone(), 32);
        replay(&dev_a, JOURNAL_START, JOURNAL_BLOCKS).unwrap();

        // Image B: replay, rewind the checkpoint to its pre-replay value,
        // replay again -- every entry is re-applied a second time.
        let dev_b = MemDevice::from_image(crashed.clone(), 32);
        let old_header = crashed[(JOURNAL_START as usize) * BLOCK_SIZE
            ..(JOURNAL_START as usize + 1) * BLOCK_SIZE]
            .to_vec();
        replay(&dev_b, JOURNAL_START, JOURNAL_BLOCKS).unwrap();
        dev_b
            .write_blocks(&[WriteOp {
                block: JOURNAL_START,
                data: old_header,
            }])
            .unwrap();
        let second = replay(&dev_b, JOURNAL_START, JOURNAL_BLOCKS).unwrap();
        assert_eq!(second.entries, 2);

        assert_eq!(dev_a.snapshot(), dev_b.snapshot());
    }

    #[test]
    fn torn_tail_entry_is_not_applied() {
        let dev = fresh_device();
        {
            let journal = manual_journal(&dev);
            journal.commit(metadata_txn(DATA_BASE, 0x55)).unwrap();
            journal.commit(metadata_txn(DATA_BASE + 1, 0x66)).unwrap();
        }

        // Each one-op entry spans two blocks; the second entry starts at
        // ring offset 2. Corrupt a payload byte in its first block.
        let entry_block = JOURNAL_START + 1 + 2;
        let mut bytes = dev.read_blocks(entry_block, 1).unwrap();
        bytes[200] ^= 0xFF;
        dev.write_blocks(&[WriteOp {
            block: entry_block,
            data: bytes,
        }])
        .unwrap();

        let report = replay(dev.as_ref(), JOURNAL_START, JOURNAL_BLOCKS).unwrap();
        assert_eq!(report.entries, 1);
        assert_eq!(
            dev.read_blocks(DATA_BASE, 1).unwrap(),
            vec![0x55; BLOCK_SIZE]
        );
        // The torn entry's target is untouched.
        assert_eq!(
            dev.read_blocks(DATA_BASE + 1, 1).unwrap(),
            vec![0u8; BLOCK_SIZE]
        );
    }

    #[test]
    fn replay_survives_ring_wrap() {
        let dev = fresh_device();
        {
            let journal = manual_journal(&dev);
            // Two-block entries in an 8-block ring. Fill and drain two so
            // the tail sits at offset 4, then leave three live entries:
            // the second of them needs the wrap-skip past offset 6.
            for i in 0..2 {
                journal.commit(metadata_txn(DATA_BASE + i, i as u8 + 1)).unwrap();
            }
            journal.apply_pending().unwrap();
            for i in 0..3 {
                journal
                    .commit(metadata_txn(DATA_BASE + 10 + i, 0xA0 + i as u8))
                    .unwrap();
            }
        }

        let report = replay(dev.as_ref(), JOURNAL_START, JOURNAL_BLOCKS).unwrap();
        assert_eq!(report.entries, 3);
        for i in 0..3 {
            assert_eq!(
                dev.read_blocks(DATA_BASE + 10 + i, 1).unwrap(),
                vec![0xA0 + i as u8; BLOCK_SIZE]
            );
        }
    }

    #[test]
    fn corrupt_header_fails_scan() {
        let dev = Arc::new(MemDevice::new(16));
        // Never formatted: all-zero header.
        let err = replay(dev.as_ref(), JOURNAL_START, JOURNAL_BLOCKS).unwrap_err();
        assert!(matches!(err, JournalError::CorruptHeader { .. }));
    }
}
