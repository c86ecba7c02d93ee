//! Black-box scenarios against the public `FileSystem` API, mirroring
//! the literal walkthroughs this core is expected to satisfy.

use std::sync::Arc;

use edu_fs::device::MemBlockDevice;
use edu_fs::param::{DIRECT_BLOCKS, MAX_FILE_SIZE, SECTOR_SIZE};
use edu_fs::{FileSystem, FsError};

fn fresh(sectors: u32) -> (Arc<MemBlockDevice>, FileSystem) {
    let dev = Arc::new(MemBlockDevice::new(sectors));
    let fs = FileSystem::init(dev.clone(), true);
    (dev, fs)
}

#[test]
fn direct_block_write() {
    let (_dev, fs) = fresh(4000);
    fs.create("/a", 0).unwrap();

    let h = fs.open("/a").unwrap();
    assert_eq!(fs.write(&h, b"hello"), 5);
    assert_eq!(h.inode().length(), 5);

    let h2 = fs.open("/a").unwrap();
    let mut out = [0u8; 5];
    assert_eq!(fs.read(&h2, &mut out), 5);
    assert_eq!(&out, b"hello");

    fs.shutdown();
}

#[test]
fn cross_sector_boundary_write() {
    let (_dev, fs) = fresh(4000);
    fs.create("/a", 0).unwrap();

    let payload: Vec<u8> = (0..600u32).map(|i| (i % 256) as u8).collect();
    let h = fs.open("/a").unwrap();
    assert_eq!(fs.write(&h, &payload), 600);
    assert_eq!(h.inode().length(), 600);

    let h2 = fs.open("/a").unwrap();
    let mut out = vec![0u8; 600];
    assert_eq!(fs.read(&h2, &mut out), 600);
    assert_eq!(out, payload);

    fs.shutdown();
}

#[test]
fn single_indirect_reach() {
    let (_dev, fs) = fresh(4000);
    fs.create("/a", 0).unwrap();

    let offset = (DIRECT_BLOCKS as u64) * (SECTOR_SIZE as u64);
    assert_eq!(offset, 63_488);

    let h = fs.open("/a").unwrap();
    h.seek(offset);
    assert_eq!(fs.write(&h, &[0xAB]), 1);
    assert_eq!(h.inode().length(), 63_489);

    fs.shutdown();
}

#[test]
fn double_indirect_reach() {
    let (_dev, fs) = fresh(4000);
    fs.create("/a", 0).unwrap();

    let offset = 127_488u64;
    let h = fs.open("/a").unwrap();
    h.seek(offset);
    assert_eq!(fs.write(&h, &[0xCD]), 1);
    assert_eq!(h.inode().length(), offset + 1);

    fs.shutdown();
}

#[test]
fn size_ceiling_truncates_final_write() {
    let (_dev, fs) = fresh(4000);
    fs.create("/a", 0).unwrap();

    let h = fs.open("/a").unwrap();
    h.seek(MAX_FILE_SIZE - 50);
    let payload = vec![0x11u8; 100];
    assert_eq!(fs.write(&h, &payload), 50);
    assert_eq!(h.inode().length(), MAX_FILE_SIZE);

    h.seek(MAX_FILE_SIZE);
    assert_eq!(fs.write(&h, &[0x22]), 0);

    fs.shutdown();
}

#[test]
fn directory_lifecycle() {
    let (_dev, fs) = fresh(4000);
    fs.mkdir("/d").unwrap();
    fs.create("/d/x", 0).unwrap();

    assert_eq!(fs.remove("/d"), Err(FsError::NotEmpty));
    fs.remove("/d/x").unwrap();
    fs.remove("/d").unwrap();

    fs.shutdown();
}

#[test]
fn concurrent_opens_share_one_inode() {
    let (dev, fs) = fresh(4000);
    let _ = dev;
    fs.create("/a", 0).unwrap();

    let fs = Arc::new(fs);
    let fs_a = Arc::clone(&fs);
    let fs_b = Arc::clone(&fs);
    let t1 = std::thread::spawn(move || fs_a.open("/a").unwrap());
    let t2 = std::thread::spawn(move || fs_b.open("/a").unwrap());
    let h1 = t1.join().unwrap();
    let h2 = t2.join().unwrap();

    assert!(Arc::ptr_eq(h1.inode(), h2.inode()));
    fs.shutdown();
}

#[test]
fn remove_then_recreate_reuses_the_freed_sector() {
    let (_dev, fs) = fresh(4000);
    fs.create("/a", 0).unwrap();
    fs.remove("/a").unwrap();
    // The sector `/a` owned is back in the free map; creating another
    // file must succeed rather than exhausting the map.
    fs.create("/b", 0).unwrap();
    fs.shutdown();
}

#[test]
fn create_open_close_remove_returns_to_the_prior_free_sector_set() {
    // Bitmap, root inode, root's data sector, `/a`'s inode, and `/a`'s
    // data sector exhaust every sector on this device. `/b` can only
    // be created afterward if closing and removing `/a` actually frees
    // both of its sectors back to the map.
    let (_dev, fs) = fresh(5);
    fs.create("/a", 0).unwrap();

    {
        let h = fs.open("/a").unwrap();
        assert_eq!(fs.write(&h, b"x"), 1);
        // `h` drops here, closing the inode and returning its open
        // count to zero.
    }

    fs.remove("/a").unwrap();

    // The freed sector is available again: a file system this small
    // only has room for one more inode if `/a`'s sector was actually
    // released back to the free map.
    fs.create("/b", 0).unwrap();
    fs.shutdown();
}

#[test]
fn write_then_read_round_trips_across_an_arbitrary_range() {
    let (_dev, fs) = fresh(4000);
    fs.create("/a", 0).unwrap();

    let h = fs.open("/a").unwrap();
    let offset = 2_000u64;
    let payload: Vec<u8> = (0..777u32).map(|i| (i * 7 % 251) as u8).collect();
    h.seek(offset);
    assert_eq!(fs.write(&h, &payload), payload.len());

    let h2 = fs.open("/a").unwrap();
    h2.seek(offset);
    let mut out = vec![0u8; payload.len()];
    assert_eq!(fs.read(&h2, &mut out), payload.len());
    assert_eq!(out, payload);

    fs.shutdown();
}
