//! Volume growth against a fully allocated filesystem.

use std::sync::Arc;

use casfs_core::{format_device, CasFs, CoreError, FormatOptions, MountOptions};
use casfs_device::{BlockDevice, MemDevice, VolumeManager};
use casfs_types::{Digest, BLOCK_SIZE};
use rand::{Rng, SeedableRng};

/// Superblock + 1 bitmap block + 1 node-map block + 5 journal blocks.
const METADATA_BLOCKS: u64 = 8;

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn growable_device(data_blocks: u64, max_device_blocks: u64) -> Arc<MemDevice> {
    let dev = Arc::new(MemDevice::with_limit(
        data_blocks + METADATA_BLOCKS,
        max_device_blocks,
    ));
    format_device(
        dev.as_ref(),
        FormatOptions {
            data_blocks,
            max_data_blocks: 512,
            node_count: 64,
            max_node_count: 64,
            journal_blocks: 5,
        },
    )
    .unwrap();
    dev
}

fn mount(dev: &Arc<MemDevice>) -> CasFs {
    CasFs::mount(
        Arc::clone(dev) as Arc<dyn BlockDevice>,
        Some(Arc::clone(dev) as Arc<dyn VolumeManager>),
        MountOptions {
            // Incompressible payloads below, but keep block math exact.
            compress: false,
            ..MountOptions::default()
        },
    )
    .unwrap()
}

/// One blob of `n - 1` payload blocks occupies exactly `n` blocks
/// (payload plus one merkle tree block).
fn put_blocks(fs: &CasFs, n: u64, seed: u64) -> Digest {
    let data = payload(((n - 1) as usize) * BLOCK_SIZE, seed);
    let mut writer = fs.create_blob(data.len() as u64).unwrap();
    writer.append(&data);
    writer.complete().unwrap()
}

/// Starting from a 100-block data region allocated to the last block,
/// `add_blocks(50)` makes 50 fresh allocations succeed without touching
/// any previously allocated block.
#[test]
fn grow_fully_allocated_filesystem() {
    let dev = growable_device(100, 256);
    let fs = mount(&dev);

    let before: Vec<Digest> = (0..10).map(|i| put_blocks(&fs, 10, i)).collect();
    fs.sync().unwrap();
    assert_eq!(fs.stats().alloc_block_count, 100);

    // Not a single block left: the capacity precheck refuses outright.
    assert!(matches!(
        fs.create_blob(1),
        Err(CoreError::Alloc(casfs_alloc::AllocError::OutOfSpace { .. }))
    ));

    assert_eq!(fs.add_blocks(50).unwrap(), 150);

    // All 50 new blocks allocate.
    let after: Vec<Digest> = (0..5).map(|i| put_blocks(&fs, 10, 100 + i)).collect();
    fs.sync().unwrap();
    assert_eq!(fs.stats().alloc_block_count, 150);

    // Every pre-growth blob still reads back intact.
    for (i, digest) in before.iter().enumerate() {
        let reader = fs.open_blob(digest).unwrap();
        assert_eq!(reader.read_all().unwrap(), payload(9 * BLOCK_SIZE, i as u64));
    }
    for (i, digest) in after.iter().enumerate() {
        let reader = fs.open_blob(digest).unwrap();
        assert_eq!(
            reader.read_all().unwrap(),
            payload(9 * BLOCK_SIZE, 100 + i as u64)
        );
    }

    let report = fs.check().unwrap();
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    fs.unmount().unwrap();
}

/// The grown layout commits atomically: a remount sees either the old
/// or the new geometry with every blob intact.
#[test]
fn grown_layout_survives_remount() {
    let dev = growable_device(100, 256);
    let digests: Vec<Digest>;
    {
        let fs = mount(&dev);
        digests = (0..10).map(|i| put_blocks(&fs, 10, i)).collect();
        fs.add_blocks(50).unwrap();
        fs.unmount().unwrap();
    }

    let fs = mount(&dev);
    assert_eq!(fs.stats().data_block_count, 150);
    assert_eq!(fs.stats().alloc_block_count, 100);
    for (i, digest) in digests.iter().enumerate() {
        let reader = fs.open_blob(digest).unwrap();
        assert_eq!(reader.read_all().unwrap(), payload(9 * BLOCK_SIZE, i as u64));
    }
    fs.unmount().unwrap();
}

/// Growth that the volume manager refuses leaves the filesystem exactly
/// as it was.
#[test]
fn refused_growth_changes_nothing() {
    let dev = growable_device(100, 120);
    let fs = mount(&dev);
    let digest = put_blocks(&fs, 10, 0);
    fs.sync().unwrap();

    assert!(matches!(
        fs.add_blocks(50),
        Err(CoreError::NoRoom { what: "blocks", .. })
    ));
    assert_eq!(fs.stats().data_block_count, 100);
    assert_eq!(fs.stats().alloc_block_count, 10);
    let reader = fs.open_blob(&digest).unwrap();
    assert_eq!(reader.read_all().unwrap(), payload(9 * BLOCK_SIZE, 0));
    drop(reader);

    let report = fs.check().unwrap();
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    fs.unmount().unwrap();
}
