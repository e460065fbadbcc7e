use std::sync::Arc;

use casfs_device::BlockDevice;
use casfs_merkle::CHUNK_SIZE;
use casfs_types::BLOCK_SIZE;
use tracing::{trace, warn};

use crate::cache::{CacheEntry, Residency};
use crate::error::{PagerError, PagerResult};
use crate::transfer::TransferBuffer;

/// Demand pager: serves blob reads, paging absent blocks from storage and
/// verifying every newly paged chunk before it becomes visible.
pub struct Pager {
    device: Arc<dyn BlockDevice>,
    transfer: TransferBuffer,
}

impl Pager {
    pub fn new(device: Arc<dyn BlockDevice>, transfer: TransferBuffer) -> Self {
        Self { device, transfer }
    }

    /// Read `[offset, offset + length)` of a blob's content. The range is
    /// clamped to the blob's logical size; reads past the end return the
    /// bytes that exist (possibly none).
    ///
    /// Fails with a corruption error -- and returns no data at all -- if
    /// any chunk covering the range fails verification.
    pub fn read_range(
        &self,
        entry: &CacheEntry,
        offset: u64,
        length: u64,
    ) -> PagerResult<Vec<u8>> {
        let info = entry.info();
        let end = offset.saturating_add(length).min(info.logical_size);
        if offset >= end {
            return Ok(Vec::new());
        }

        if info.compressed {
            self.ensure_whole(entry)?;
            let inner = entry.inner.lock().expect("lock poisoned");
            let Residency::Whole(Some(data)) = &inner.residency else {
                unreachable!("ensure_whole leaves the blob resident");
            };
            return Ok(data[offset as usize..end as usize].to_vec());
        }

        let first_chunk = offset / CHUNK_SIZE as u64;
        let last_chunk = (end - 1) / CHUNK_SIZE as u64;
        self.ensure_chunks(entry, first_chunk, last_chunk)?;

        let inner = entry.inner.lock().expect("lock poisoned");
        let Residency::Chunks(slots) = &inner.residency else {
            unreachable!("uncompressed blobs page by chunk");
        };
        let mut out = Vec::with_capacity((end - offset) as usize);
        for chunk in first_chunk..=last_chunk {
            let data = slots[chunk as usize]
                .as_ref()
                .expect("ensure_chunks leaves the range resident");
            let chunk_base = chunk * CHUNK_SIZE as u64;
            let from = offset.max(chunk_base) - chunk_base;
            let to = (end - chunk_base).min(data.len() as u64);
            out.extend_from_slice(&data[from as usize..to as usize]);
        }
        Ok(out)
    }

    /// Make every chunk in `[first, last]` resident, verifying each as it
    /// arrives. Chunks already being paged in by another reader are
    /// waited on, not re-read.
    fn ensure_chunks(&self, entry: &CacheEntry, first: u64, last: u64) -> PagerResult<()> {
        loop {
            let mut claimed: Vec<u64> = Vec::new();
            {
                let mut inner = entry.inner.lock().expect("lock poisoned");
                let (resident, in_flight): (Vec<bool>, Vec<bool>) = {
                    let Residency::Chunks(slots) = &inner.residency else {
                        unreachable!("uncompressed blobs page by chunk");
                    };
                    (
                        (first..=last).map(|c| slots[c as usize].is_some()).collect(),
                        (first..=last).map(|c| inner.in_flight.contains(&c)).collect(),
                    )
                };
                if resident.iter().all(|&r| r) {
                    return Ok(());
                }
                for (i, chunk) in (first..=last).enumerate() {
                    if !resident[i] && !in_flight[i] {
                        claimed.push(chunk);
                    }
                }
                if claimed.is_empty() {
                    // Everything missing is already in flight; join those
                    // requests.
                    let _unused = entry
                        .arrived
                        .wait(inner)
                        .expect("lock poisoned");
                    continue;
                }
                for &chunk in &claimed {
                    inner.in_flight.insert(chunk);
                }
            }

            let result = self.fetch_chunks(entry, &claimed);
            {
                let mut inner = entry.inner.lock().expect("lock poisoned");
                for chunk in &claimed {
                    inner.in_flight.remove(chunk);
                }
            }
            entry.arrived.notify_all();
            result?;
        }
    }

    /// Read the claimed chunks from storage, verify, and install them.
    fn fetch_chunks(&self, entry: &CacheEntry, chunks: &[u64]) -> PagerResult<()> {
        let info = entry.info();
        // Coalesce claims into contiguous device runs.
        let mut runs: Vec<(u64, Vec<u64>)> = Vec::new();
        for &chunk in chunks {
            let device_block = info.payload_blocks[chunk as usize];
            match runs.last_mut() {
                Some((start, members))
                    if *start + members.len() as u64 == device_block
                        && members.last() == Some(&(chunk - 1)) =>
                {
                    members.push(chunk);
                }
                _ => runs.push((device_block, vec![chunk])),
            }
        }

        for (start_block, members) in runs {
            let bytes =
                self.transfer
                    .read_run(self.device.as_ref(), start_block, members.len() as u64)?;
            for (i, &chunk) in members.iter().enumerate() {
                let block = &bytes[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE];
                let valid = chunk_valid_len(info.stored_size, chunk);
                let data = &block[..valid];
                if !entry.tree().verify_chunk(chunk, data) {
                    warn!(
                        digest = %info.digest.short_hex(),
                        chunk,
                        "merkle verification failed on page-in"
                    );
                    return Err(PagerError::Corruption {
                        digest: info.digest,
                        chunk,
                    });
                }
                let mut inner = entry.inner.lock().expect("lock poisoned");
                if let Residency::Chunks(slots) = &mut inner.residency {
                    slots[chunk as usize] = Some(data.to_vec());
                }
            }
        }
        trace!(digest = %info.digest.short_hex(), chunks = chunks.len(), "paged in");
        Ok(())
    }

    /// Make a compressed blob's full content resident: page in the whole
    /// stored payload, decompress, then verify every chunk.
    fn ensure_whole(&self, entry: &CacheEntry) -> PagerResult<()> {
        loop {
            {
                let mut inner = entry.inner.lock().expect("lock poisoned");
                if let Residency::Whole(Some(_)) = &inner.residency {
                    return Ok(());
                }
                if inner.in_flight.contains(&0) {
                    let _unused = entry.arrived.wait(inner).expect("lock poisoned");
                    continue;
                }
                inner.in_flight.insert(0);
            }

            let result = self.fetch_whole(entry);
            let mut inner = entry.inner.lock().expect("lock poisoned");
            inner.in_flight.remove(&0);
            match result {
                Ok(data) => {
                    inner.residency = Residency::Whole(Some(data));
                    drop(inner);
                    entry.arrived.notify_all();
                    return Ok(());
                }
                Err(e) => {
                    drop(inner);
                    entry.arrived.notify_all();
                    return Err(e);
                }
            }
        }
    }

    fn fetch_whole(&self, entry: &CacheEntry) -> PagerResult<Vec<u8>> {
        let info = entry.info();

        // The payload may be fragmented; read each contiguous run.
        let mut stored = Vec::with_capacity(info.payload_blocks.len() * BLOCK_SIZE);
        let mut i = 0;
        while i < info.payload_blocks.len() {
            let start = info.payload_blocks[i];
            let mut count = 1u64;
            while i + (count as usize) < info.payload_blocks.len()
                && info.payload_blocks[i + count as usize] == start + count
            {
                count += 1;
            }
            stored.extend_from_slice(&self.transfer.read_run(
                self.device.as_ref(),
                start,
                count,
            )?);
            i += count as usize;
        }
        stored.truncate(info.stored_size as usize);

        let data = zstd::decode_all(stored.as_slice()).map_err(|e| PagerError::Decompression {
            digest: info.digest,
            reason: e.to_string(),
        })?;
        if data.len() as u64 != info.logical_size {
            return Err(PagerError::SizeMismatch {
                digest: info.digest,
                expected: info.logical_size,
                actual: data.len() as u64,
            });
        }

        // Verify every chunk of the uncompressed content before any of it
        // becomes visible.
        if data.is_empty() {
            if !entry.tree().verify_chunk(0, &[]) {
                return Err(PagerError::Corruption {
                    digest: info.digest,
                    chunk: 0,
                });
            }
        } else {
            for (chunk, piece) in data.chunks(CHUNK_SIZE).enumerate() {
                if !entry.tree().verify_chunk(chunk as u64, piece) {
                    warn!(
                        digest = %info.digest.short_hex(),
                        chunk,
                        "merkle verification failed after decompression"
                    );
                    return Err(PagerError::Corruption {
                        digest: info.digest,
                        chunk: chunk as u64,
                    });
                }
            }
        }
        trace!(digest = %info.digest.short_hex(), bytes = data.len(), "compressed blob paged in");
        Ok(data)
    }
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("transfer_blocks", &self.transfer.capacity_blocks())
            .finish()
    }
}

/// Valid bytes of chunk `chunk` in a stored payload of `stored_size`
/// bytes (the final chunk is usually short).
fn chunk_valid_len(stored_size: u64, chunk: u64) -> usize {
    let base = chunk * CHUNK_SIZE as u64;
    stored_size
        .saturating_sub(base)
        .min(CHUNK_SIZE as u64) as usize
}
