use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use keelfs::format::{format_simple, SimpleGeometry};
use keelfs::vfs::{FsKind, InodeKind, Vfs};
use keelfs::{DeviceId, FsError, MemBlockDevice, StorageConfig, BLOCK_SIZE};

const ROOT: DeviceId = DeviceId(1);

fn formatted(blocks: u64) -> Arc<MemBlockDevice> {
    let device = Arc::new(MemBlockDevice::new(blocks));
    format_simple(device.as_ref(), &SimpleGeometry::default()).expect("Failed to format device");
    device
}

fn boot(device: &Arc<MemBlockDevice>) -> Vfs {
    let vfs = Vfs::new(StorageConfig::default()).expect("Failed to build stack");
    vfs.register_device(ROOT, device.clone()).expect("Failed to register device");
    vfs.mount_root(ROOT, FsKind::Simple).expect("Failed to mount root");
    vfs
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Data written through the stack must be on the device, not just cached
#[test]
fn test_data_persists_across_remount() {
    env_logger::builder().is_test(true).try_init().ok();

    let device = formatted(2048);
    let small = pattern(5000, 1);
    // reaches past the direct blocks into the indirect block
    let large = pattern(11 * BLOCK_SIZE + 5000, 7);

    {
        let vfs = boot(&device);
        vfs.mkdir("/docs").expect("mkdir");
        vfs.create("/docs/small", InodeKind::File).expect("create small");
        vfs.create("/docs/large", InodeKind::File).expect("create large");
        assert_eq!(vfs.write_file("/docs/small", 0, &small).expect("write small"), small.len());
        assert_eq!(vfs.write_file("/docs/large", 0, &large).expect("write large"), large.len());
        vfs.shutdown().expect("shutdown");
    }

    println!("Remounting...");
    let vfs = boot(&device);
    let mut names: Vec<_> = vfs
        .read_dir("/docs")
        .expect("read_dir")
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec![".", "..", "large", "small"]);

    assert_eq!(vfs.stat("/docs/small").expect("stat").size, 5000);
    assert_eq!(vfs.read_file("/docs/small", 0, 8192).expect("read small"), small);
    assert_eq!(vfs.read_file("/docs/large", 0, large.len()).expect("read large"), large);

    // reads at an offset cross the indirect boundary
    let at = 10 * BLOCK_SIZE + 100;
    assert_eq!(
        vfs.read_file("/docs/large", at as u64, 2 * BLOCK_SIZE).expect("read slice"),
        &large[at..at + 2 * BLOCK_SIZE]
    );
    vfs.shutdown().expect("shutdown");
}

#[test]
fn test_append_and_overwrite() {
    let device = formatted(1024);
    let vfs = boot(&device);
    vfs.create("/log", InodeKind::File).expect("create");

    vfs.write_file("/log", 0, b"hello ").expect("write");
    vfs.write_file("/log", 6, b"world").expect("append");
    vfs.write_file("/log", 0, b"J").expect("overwrite");
    assert_eq!(vfs.read_file("/log", 0, 64).expect("read"), b"Jello world");

    // no holes on this format
    assert!(matches!(
        vfs.write_file("/log", 100, b"x"),
        Err(FsError::InvalidArgument(_))
    ));
    assert_eq!(vfs.stat("/log").expect("stat").size, 11);
}

#[test]
fn test_full_disk_gives_short_write() {
    env_logger::builder().is_test(true).try_init().ok();

    let device = formatted(256);
    let vfs = boot(&device);
    let before = vfs.statfs("/").expect("statfs");
    assert_eq!(before.kind, FsKind::Simple);
    assert!(before.free_blocks > 0);

    vfs.create("/fill", InodeKind::File).expect("create");
    let data = vec![0xeeu8; 300 * BLOCK_SIZE];
    let written = vfs.write_file("/fill", 0, &data).expect("write");
    assert!(written > 0 && written < data.len());
    assert_eq!(vfs.statfs("/").expect("statfs").free_blocks, 0);
    assert_eq!(vfs.stat("/fill").expect("stat").size, written as u64);

    // nothing left for a second file
    vfs.create("/more", InodeKind::File).expect("create");
    assert!(matches!(vfs.write_file("/more", 0, &[1u8; BLOCK_SIZE]), Err(FsError::NoSpace)));

    vfs.unlink("/fill").expect("unlink");
    vfs.unlink("/more").expect("unlink");
    assert_eq!(vfs.statfs("/").expect("statfs").free_blocks, before.free_blocks);
}

#[test]
fn test_inode_exhaustion_and_reuse() {
    let device = Arc::new(MemBlockDevice::new(512));
    let geometry = SimpleGeometry {
        ninodes: 8,
        ..Default::default()
    };
    format_simple(device.as_ref(), &geometry).expect("format");
    let vfs = boot(&device);

    // inode 0 is never used and 1 is the root
    let mut made = 0;
    loop {
        match vfs.create(&format!("/f{}", made), InodeKind::File) {
            Ok(_) => made += 1,
            Err(FsError::NoInodes) => break,
            Err(err) => panic!("unexpected error: {}", err),
        }
    }
    assert_eq!(made, 6);

    vfs.unlink("/f0").expect("unlink");
    vfs.create("/again", InodeKind::File).expect("reuse freed inode");
}

#[test]
fn test_nested_directories() {
    let device = formatted(1024);
    let vfs = boot(&device);
    vfs.mkdir("/a").expect("mkdir");
    vfs.mkdir("/a/b").expect("mkdir");
    vfs.mkdir("/a/b/c").expect("mkdir");
    vfs.create("/a/b/c/leaf", InodeKind::File).expect("create");
    vfs.write_file("/a/b/c/leaf", 0, b"deep").expect("write");

    assert_eq!(vfs.read_file("//a//b/c/../c/leaf", 0, 16).expect("read"), b"deep");
    assert_eq!(vfs.stat("/a/b/c/../../..").expect("stat").inum, vfs.stat("/").expect("stat").inum);

    assert!(matches!(vfs.unlink("/a/b"), Err(FsError::DirectoryNotEmpty)));
    vfs.unlink("/a/b/c/leaf").expect("unlink");
    vfs.unlink("/a/b/c").expect("unlink");
    vfs.unlink("/a/b").expect("unlink");
    vfs.unlink("/a").expect("unlink");
    assert_eq!(vfs.read_dir("/").expect("read_dir").len(), 2);
    assert_eq!(vfs.inodes().in_use(), 1);
}

/// Random overwrites and appends agree with an in-memory model
#[test]
fn test_random_writes_match_model() {
    let device = formatted(2048);
    let vfs = boot(&device);
    vfs.create("/model", InodeKind::File).expect("create");

    let mut rng = StdRng::seed_from_u64(0x6b65_656c);
    let limit = 40 * BLOCK_SIZE;
    let mut model: Vec<u8> = Vec::new();
    for _ in 0..200 {
        let off = rng.gen_range(0..=model.len().min(limit - 1));
        let len = rng.gen_range(1..=3 * BLOCK_SIZE).min(limit - off).max(1);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        assert_eq!(vfs.write_file("/model", off as u64, &data).expect("write"), len);

        if off + len > model.len() {
            model.resize(off + len, 0);
        }
        model[off..off + len].copy_from_slice(&data);
    }

    assert_eq!(vfs.stat("/model").expect("stat").size, model.len() as u64);
    assert_eq!(vfs.read_file("/model", 0, limit).expect("read"), model);
    vfs.shutdown().expect("shutdown");

    let vfs = boot(&device);
    assert_eq!(vfs.read_file("/model", 0, limit).expect("read"), model);
}
