//! Crash injection and recovery.
//!
//! These tests drive the filesystem in manual journal-application mode,
//! snapshot the device at the moment of a simulated power loss, and
//! remount the byte-identical image. A committed-but-unapplied
//! transaction must replay completely; a torn one must vanish completely.

use std::sync::Arc;

use casfs_core::{
    check_device, format_device, load_superblock, ApplyMode, CasFs, CoreError, FormatOptions,
    MountOptions,
};
use casfs_device::{BlockDevice, FileDevice, MemDevice, WriteOp};
use casfs_pager::PagerError;
use casfs_types::BLOCK_SIZE;
use rand::{Rng, SeedableRng};

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn format_opts() -> FormatOptions {
    FormatOptions {
        data_blocks: 120,
        max_data_blocks: 120,
        node_count: 64,
        max_node_count: 64,
        journal_blocks: 9,
    }
}

fn fresh_device() -> Arc<MemDevice> {
    let dev = Arc::new(MemDevice::new(137));
    format_device(dev.as_ref(), format_opts()).unwrap();
    dev
}

fn manual_mount(dev: &Arc<MemDevice>) -> CasFs {
    CasFs::mount(
        Arc::clone(dev) as Arc<dyn BlockDevice>,
        None,
        MountOptions {
            apply_mode: ApplyMode::Manual,
            ..MountOptions::default()
        },
    )
    .unwrap()
}

fn default_mount(dev: &Arc<MemDevice>) -> CasFs {
    CasFs::mount(
        Arc::clone(dev) as Arc<dyn BlockDevice>,
        None,
        MountOptions::default(),
    )
    .unwrap()
}

fn put(fs: &CasFs, data: &[u8]) -> casfs_types::Digest {
    let mut writer = fs.create_blob(data.len() as u64).unwrap();
    writer.append(data);
    writer.complete().unwrap()
}

/// Commit a blob allocating a node and extents, crash after the journal
/// append but before application, remount. The node and its extents are
/// either both allocated or both free -- here, both allocated, because
/// the entry was durable.
#[test]
fn committed_transaction_survives_crash_before_application() {
    let dev = fresh_device();
    let data = payload(3 * BLOCK_SIZE + 99, 1);
    let digest = {
        let fs = manual_mount(&dev);
        let d = put(&fs, &data);
        // Manual mode: the entry is durable in the ring but nothing has
        // been applied. Dropping the mount simulates the crash.
        d
    };

    // Before replay, the on-disk metadata still shows the pre-commit
    // state.
    let sb = load_superblock(dev.as_ref()).unwrap();
    assert_eq!(sb.alloc_block_count, 0);

    let image = dev.snapshot();
    let recovered = Arc::new(MemDevice::from_image(image, 137));
    let fs = default_mount(&recovered);
    let reader = fs.open_blob(&digest).unwrap();
    assert_eq!(reader.read_all().unwrap(), data);
    drop(reader);

    let report = fs.check().unwrap();
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    assert!(report.alloc_block_count > 0);
    assert_eq!(report.alloc_node_count, 1);
    fs.unmount().unwrap();
}

/// Tear the blob transaction's journal entry. Replay must stop at the
/// torn entry: the allocation vanishes entirely, never half-applies.
#[test]
fn torn_entry_loses_the_allocation_cleanly() {
    let dev = fresh_device();
    {
        let fs = manual_mount(&dev);
        put(&fs, &payload(2 * BLOCK_SIZE, 2));
    }

    // Ring layout in manual mode: entry 1 is the mount's clean-flag
    // transaction (one superblock op, two ring blocks), entry 2 is the
    // blob transaction starting at ring offset 2.
    let sb = load_superblock(dev.as_ref()).unwrap();
    let entry_block = sb.journal_start + 1 + 2;
    let mut bytes = dev.read_blocks(entry_block, 1).unwrap();
    bytes[300] ^= 0xFF;
    dev.write_blocks(&[WriteOp {
        block: entry_block,
        data: bytes,
    }])
    .unwrap();

    let image = dev.snapshot();
    let recovered = Arc::new(MemDevice::from_image(image, 137));
    let fs = default_mount(&recovered);
    assert!(fs.list_blobs().is_empty());

    let report = fs.check().unwrap();
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    assert_eq!(report.alloc_block_count, 0);
    assert_eq!(report.alloc_node_count, 0);
    fs.unmount().unwrap();
}

/// Everything outside the journal region, which legitimately differs
/// across mounts (ring offsets and sequence numbers advance).
fn settled_state(image: &[u8]) -> Vec<u8> {
    let sb = load_superblock(&MemDevice::from_image(image.to_vec(), 137)).unwrap();
    let mut out = image.to_vec();
    let from = (sb.journal_start as usize) * BLOCK_SIZE;
    let to = ((sb.journal_start + sb.journal_blocks) as usize) * BLOCK_SIZE;
    out[from..to].fill(0);
    out
}

/// Mounting the same crashed image twice ends in the same settled state:
/// the first mount replays, the second finds an empty ring and changes
/// nothing.
#[test]
fn recovery_is_idempotent_across_mounts() {
    let dev = fresh_device();
    let data = payload(BLOCK_SIZE + 7, 3);
    let digest = {
        let fs = manual_mount(&dev);
        put(&fs, &data)
    };
    let crashed = dev.snapshot();

    let once = Arc::new(MemDevice::from_image(crashed.clone(), 137));
    default_mount(&once).unmount().unwrap();
    let after_first = once.snapshot();

    let again = Arc::new(MemDevice::from_image(after_first.clone(), 137));
    let fs = default_mount(&again);
    assert_eq!(fs.list_blobs(), vec![digest]);
    assert_eq!(fs.open_blob(&digest).unwrap().read_all().unwrap(), data);
    fs.unmount().unwrap();
    assert_eq!(settled_state(&again.snapshot()), settled_state(&after_first));
}

/// A read-only device with committed-but-unapplied entries cannot be
/// mounted: replay needs a writable disk.
#[test]
fn read_only_device_with_pending_journal_fails_closed() {
    let dev = fresh_device();
    {
        let fs = manual_mount(&dev);
        put(&fs, b"stranded");
    }

    let mut recovered = MemDevice::from_image(dev.snapshot(), 137);
    recovered.set_read_only(true);
    let err = CasFs::mount(
        Arc::new(recovered) as Arc<dyn BlockDevice>,
        None,
        MountOptions {
            read_only: true,
            ..MountOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, CoreError::ReplayOnReadOnly { pending } if pending > 0));
}

/// Two allocated nodes carrying the same root digest fail the mount-time
/// scan as corruption, never a silent overwrite.
#[test]
fn duplicate_digest_fails_mount() {
    let dev = fresh_device();
    {
        let fs = default_mount(&dev);
        put(&fs, b"twinned");
        fs.unmount().unwrap();
    }

    // Clone node 0's record into slot 1 with its own freshly "allocated"
    // block, keeping every counter consistent so only the duplicate
    // digest is wrong.
    let sb = load_superblock(dev.as_ref()).unwrap();
    let mut node_block = dev.read_blocks(sb.node_map_start, 1).unwrap();
    let mut clone: Vec<u8> = node_block[0..128].to_vec();
    // Point the clone's first extent at block 60.
    let extent = casfs_types::Extent::new(60, 1).unwrap();
    clone[64..72].copy_from_slice(&extent.to_raw().to_le_bytes());
    let crc = crc32fast::hash(&clone[0..124]);
    clone[124..128].copy_from_slice(&crc.to_le_bytes());
    node_block[128..256].copy_from_slice(&clone);
    dev.write_blocks(&[WriteOp {
        block: sb.node_map_start,
        data: node_block,
    }])
    .unwrap();

    let mut bitmap = dev.read_blocks(sb.block_bitmap_start, 1).unwrap();
    bitmap[60 / 8] |= 1 << (60 % 8);
    dev.write_blocks(&[WriteOp {
        block: sb.block_bitmap_start,
        data: bitmap,
    }])
    .unwrap();
    let mut forged = sb;
    forged.alloc_block_count += 1;
    forged.alloc_node_count += 1;
    dev.write_blocks(&[WriteOp {
        block: 0,
        data: forged.encode(),
    }])
    .unwrap();

    let err = CasFs::mount(
        Arc::clone(&dev) as Arc<dyn BlockDevice>,
        None,
        MountOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Pager(PagerError::DuplicateDigest { .. })
    ));

    // The same forgery is visible to the offline check.
    let report = check_device(dev.as_ref()).unwrap();
    assert!(report.problems.iter().any(|p| p.contains("share digest")));
}

/// Full lifecycle against a file-backed image, the way the operator CLI
/// drives it.
#[test]
fn file_backed_image_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("casfs.img");
    let data = payload(4 * BLOCK_SIZE + 1000, 4);

    let digest = {
        let dev = Arc::new(FileDevice::create(&path, 137).unwrap());
        format_device(dev.as_ref(), format_opts()).unwrap();
        let fs = CasFs::mount(
            Arc::clone(&dev) as Arc<dyn BlockDevice>,
            None,
            MountOptions::default(),
        )
        .unwrap();
        let d = put(&fs, &data);
        fs.unmount().unwrap();
        d
    };

    let dev = Arc::new(FileDevice::open(&path, false).unwrap());
    let fs = CasFs::mount(
        Arc::clone(&dev) as Arc<dyn BlockDevice>,
        None,
        MountOptions::default(),
    )
    .unwrap();
    assert_eq!(fs.list_blobs(), vec![digest]);
    assert_eq!(fs.open_blob(&digest).unwrap().read_all().unwrap(), data);
    fs.unmount().unwrap();
}
