//! Eviction policy behavior, observed through the device read counter.

use std::sync::Arc;

use casfs_core::{format_device, CachePolicy, CasFs, FormatOptions, MountOptions};
use casfs_device::{BlockDevice, MemDevice};
use casfs_types::{Digest, BLOCK_SIZE};
use rand::{Rng, SeedableRng};

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn mounted(policy: CachePolicy) -> (Arc<MemDevice>, CasFs) {
    let dev = Arc::new(MemDevice::new(137));
    format_device(
        dev.as_ref(),
        FormatOptions {
            data_blocks: 120,
            max_data_blocks: 120,
            node_count: 64,
            max_node_count: 64,
            journal_blocks: 9,
        },
    )
    .unwrap();
    let fs = CasFs::mount(
        Arc::clone(&dev) as Arc<dyn BlockDevice>,
        None,
        MountOptions {
            cache_policy: policy,
            ..MountOptions::default()
        },
    )
    .unwrap();
    (dev, fs)
}

fn put(fs: &CasFs, data: &[u8]) -> Digest {
    let mut writer = fs.create_blob(data.len() as u64).unwrap();
    writer.append(data);
    writer.complete().unwrap()
}

/// With EvictImmediately, the last close drops the resident data: the
/// next open has to page in (and re-verify) from storage again.
#[test]
fn evict_immediately_re_pages_after_close() {
    let (dev, fs) = mounted(CachePolicy::EvictImmediately);
    let data = payload(3 * BLOCK_SIZE, 1);
    let digest = put(&fs, &data);
    fs.sync().unwrap();

    let reader = fs.open_blob(&digest).unwrap();
    let first_open_reads = {
        let before = dev.read_calls();
        assert_eq!(reader.read_all().unwrap(), data);
        dev.read_calls() - before
    };
    assert!(first_open_reads > 0, "nothing was seeded under eviction");
    drop(reader);

    // Closed: the cached data is gone, so reading again costs another
    // page-in.
    let reader = fs.open_blob(&digest).unwrap();
    let before = dev.read_calls();
    assert_eq!(reader.read_all().unwrap(), data);
    assert!(
        dev.read_calls() > before,
        "close must have dropped the resident data"
    );
    drop(reader);
    fs.unmount().unwrap();
}

/// With NeverEvict, data stays resident across close: a later open reads
/// from memory without touching the device.
#[test]
fn never_evict_keeps_data_resident_across_close() {
    let (dev, fs) = mounted(CachePolicy::NeverEvict);
    let data = payload(3 * BLOCK_SIZE, 2);
    let digest = put(&fs, &data);
    fs.sync().unwrap();

    // Creation seeded the cache, so even the first read is memory-only.
    let reader = fs.open_blob(&digest).unwrap();
    let before = dev.read_calls();
    assert_eq!(reader.read_all().unwrap(), data);
    drop(reader);

    let reader = fs.open_blob(&digest).unwrap();
    assert_eq!(reader.read_all().unwrap(), data);
    assert_eq!(dev.read_calls(), before, "no re-page across close");
    drop(reader);
    fs.unmount().unwrap();
}

/// NeverEvict still has to page once when the blob arrives by mount-time
/// scan rather than creation; after that, closes never cost a re-page.
#[test]
fn never_evict_pages_once_after_remount() {
    let digest;
    let data = payload(2 * BLOCK_SIZE + 17, 3);
    let image = {
        let (dev, fs) = mounted(CachePolicy::NeverEvict);
        digest = put(&fs, &data);
        fs.unmount().unwrap();
        dev.snapshot()
    };

    let dev = Arc::new(MemDevice::from_image(image, 137));
    let fs = CasFs::mount(
        Arc::clone(&dev) as Arc<dyn BlockDevice>,
        None,
        MountOptions::default(),
    )
    .unwrap();

    let reader = fs.open_blob(&digest).unwrap();
    let before = dev.read_calls();
    assert_eq!(reader.read_all().unwrap(), data);
    let paged = dev.read_calls() - before;
    assert!(paged > 0, "first read after remount must page in");
    drop(reader);

    let reader = fs.open_blob(&digest).unwrap();
    let before = dev.read_calls();
    assert_eq!(reader.read_all().unwrap(), data);
    assert_eq!(dev.read_calls(), before);
    drop(reader);
    fs.unmount().unwrap();
}
