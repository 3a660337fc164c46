use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

use keelfs::ext2::disk::{
    inode, Ext2Superblock, GroupDesc, ADDR_PER_BLOCK, DIND_BLOCK, GROUP_DESC_SIZE, IND_BLOCK, NDIR_BLOCKS,
    SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, TIND_BLOCK, VALID_FS,
};
use keelfs::format::{format_ext2, Ext2Geometry};
use keelfs::vfs::{FsKind, InodeKind, InodePrivate, Vfs};
use keelfs::{DeviceId, FsError, MemBlockDevice, StorageConfig, BLOCK_SIZE};

const DEV: DeviceId = DeviceId(3);

/// 16 MiB image split into four groups
fn formatted() -> Arc<MemBlockDevice> {
    let device = Arc::new(MemBlockDevice::new(4096));
    let geometry = Ext2Geometry {
        blocks_per_group: 1024,
        inodes_per_group: 128,
        volume_name: "e2e".to_string(),
        ..Default::default()
    };
    format_ext2(device.as_ref(), &geometry).expect("Failed to format ext2 image");
    device
}

fn boot(device: &Arc<MemBlockDevice>) -> Vfs {
    let vfs = Vfs::new(StorageConfig::default()).expect("Failed to build stack");
    vfs.register_device(DEV, device.clone()).expect("Failed to register device");
    vfs.mount_root(DEV, FsKind::Ext2).expect("Failed to mount ext2 root");
    vfs
}

fn on_disk_superblock(device: &MemBlockDevice) -> Ext2Superblock {
    let block = device.block(0);
    Ext2Superblock::from_bytes(&block[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE])
}

/// Group descriptors as written to the device
fn on_disk_groups(device: &MemBlockDevice) -> Vec<GroupDesc> {
    let sb = on_disk_superblock(device);
    let gdt = device.block(sb.first_data_block as u64 + 1);
    (0..sb.group_count() as usize)
        .map(|g| GroupDesc::from_bytes(&gdt[g * GROUP_DESC_SIZE..(g + 1) * GROUP_DESC_SIZE]))
        .collect()
}

fn group_of(device: &MemBlockDevice, block: u32) -> usize {
    let sb = on_disk_superblock(device);
    ((block - sb.first_data_block) / sb.blocks_per_group) as usize
}

/// Whether `block` is marked used in its group's on-disk bitmap
fn block_in_use(device: &MemBlockDevice, block: u32) -> bool {
    let sb = on_disk_superblock(device);
    let bit = ((block - sb.first_data_block) % sb.blocks_per_group) as usize;
    let desc = &on_disk_groups(device)[group_of(device, block)];
    let bitmap = device.block(desc.block_bitmap as u64);
    bitmap[bit / 8] & (1 << (bit % 8)) != 0
}

fn raw_inode(vfs: &Vfs, path: &str) -> Vec<u8> {
    let _op = vfs.begin_op();
    let ip = vfs.namei(path).expect("namei");
    let node = ip.lock().expect("lock");
    match &node.private {
        InodePrivate::Ext2(private) => private.raw.clone(),
        _ => panic!("{} is not an ext2 inode", path),
    }
}

/// Nonzero block numbers stored in an indirect block
fn pointers(device: &MemBlockDevice, block: u32) -> Vec<u32> {
    let data = device.block(block as u64);
    (0..ADDR_PER_BLOCK)
        .map(|i| LittleEndian::read_u32(&data[i * 4..i * 4 + 4]))
        .filter(|&b| b != 0)
        .collect()
}

#[test]
fn test_free_counts_across_groups() {
    env_logger::builder().is_test(true).try_init().ok();

    let device = formatted();
    let vfs = boot(&device);
    let before = vfs.statfs("/").expect("statfs");
    assert_eq!(before.kind, FsKind::Ext2);
    assert_eq!(before.total_inodes, 512);

    // inodes are handed out round-robin, so these land in every group
    for i in 0..8 {
        let path = format!("/f{}", i);
        vfs.create(&path, InodeKind::File).expect("create");
        vfs.write_file(&path, 0, &vec![i as u8; 3 * BLOCK_SIZE]).expect("write");
    }
    let inums: Vec<u32> = (0..8).map(|i| vfs.stat(&format!("/f{}", i)).expect("stat").inum).collect();
    let groups: std::collections::BTreeSet<u32> = inums.iter().map(|inum| (inum - 1) / 128).collect();
    assert_eq!(groups.len(), 4);

    let used = vfs.statfs("/").expect("statfs");
    assert_eq!(used.free_inodes, before.free_inodes - 8);
    assert_eq!(used.free_blocks, before.free_blocks - 24);

    println!("Unmounting and checking the superblock...");
    vfs.shutdown().expect("shutdown");
    let sb = on_disk_superblock(&device);
    assert_eq!(sb.free_blocks_count as u64, used.free_blocks);
    assert_eq!(sb.free_inodes_count as u64, used.free_inodes);
    assert_ne!(sb.state & VALID_FS, 0);
    assert_eq!(sb.mnt_count, 1);

    let vfs = boot(&device);
    // mounted filesystems are marked not clean
    assert_eq!(on_disk_superblock(&device).state & VALID_FS, 0);
    for i in 0..8 {
        let path = format!("/f{}", i);
        assert_eq!(vfs.read_file(&path, 0, 4 * BLOCK_SIZE).expect("read"), vec![i as u8; 3 * BLOCK_SIZE]);
        vfs.unlink(&path).expect("unlink");
    }
    let after = vfs.statfs("/").expect("statfs");
    assert_eq!(after.free_blocks, before.free_blocks);
    assert_eq!(after.free_inodes, before.free_inodes);
    vfs.shutdown().expect("shutdown");
}

#[test]
fn test_file_spanning_groups_charges_each_group() {
    env_logger::builder().is_test(true).try_init().ok();

    let device = formatted();
    let vfs = boot(&device);
    vfs.create("/wide", InodeKind::File).expect("create");
    let before = on_disk_groups(&device);

    let nblocks = 1500;
    let data = vec![0x3cu8; nblocks * BLOCK_SIZE];
    assert_eq!(vfs.write_file("/wide", 0, &data).expect("write"), data.len());

    let mut taken = vec![0u16; before.len()];
    {
        let _op = vfs.begin_op();
        let ip = vfs.namei("/wide").expect("namei");
        let mut node = ip.lock().expect("lock");
        for lblock in 0..nblocks as u64 {
            let block = node.map_block(lblock, false).expect("map").expect("mapped");
            taken[group_of(&device, block)] += 1;
        }
    }
    // indirect blocks count in the group they sit in
    let raw = raw_inode(&vfs, "/wide");
    let ind = inode::block(&raw, IND_BLOCK);
    let dind = inode::block(&raw, DIND_BLOCK);
    assert_ne!(ind, 0);
    assert_ne!(dind, 0);
    let mut meta = vec![ind, dind];
    meta.extend(pointers(&device, dind));
    for &block in &meta {
        taken[group_of(&device, block)] += 1;
    }

    let after = on_disk_groups(&device);
    println!("blocks taken per group: {:?}", taken);
    assert!(taken.iter().filter(|&&n| n > 0).count() >= 2);
    assert_eq!(taken.iter().map(|&n| n as usize).sum::<usize>(), nblocks + meta.len());
    for (g, (b, a)) in before.iter().zip(&after).enumerate() {
        assert_eq!(b.free_blocks_count - a.free_blocks_count, taken[g], "group {}", g);
    }

    vfs.unlink("/wide").expect("unlink");
    let freed = on_disk_groups(&device);
    for (b, f) in before.iter().zip(&freed) {
        assert_eq!(b.free_blocks_count, f.free_blocks_count);
    }
    vfs.shutdown().expect("shutdown");
}

#[test]
fn test_sparse_triple_indirect_file() {
    env_logger::builder().is_test(true).try_init().ok();

    let device = formatted();
    let vfs = boot(&device);
    let before = vfs.statfs("/").expect("statfs").free_blocks;

    // first logical block reached through the triple-indirect pointer
    let tind = (NDIR_BLOCKS + ADDR_PER_BLOCK + ADDR_PER_BLOCK * ADDR_PER_BLOCK) as u64;
    let far = tind * BLOCK_SIZE as u64 + 10;

    vfs.create("/sparse", InodeKind::File).expect("create");
    vfs.write_file("/sparse", 0, b"head").expect("write head");
    vfs.write_file("/sparse", far, b"tail").expect("write tail");

    let st = vfs.stat("/sparse").expect("stat");
    assert_eq!(st.size, far + 4);
    // head block, then tind, dind, ind and the data block
    assert_eq!(vfs.statfs("/").expect("statfs").free_blocks, before - 5);

    assert_eq!(vfs.read_file("/sparse", 0, 4).expect("read"), b"head");
    assert_eq!(vfs.read_file("/sparse", far, 16).expect("read"), b"tail");
    assert_eq!(
        vfs.read_file("/sparse", 40 * BLOCK_SIZE as u64, 64).expect("read hole"),
        vec![0u8; 64]
    );

    // head, then the chain tind -> dind -> ind -> data
    let raw = raw_inode(&vfs, "/sparse");
    let head = inode::block(&raw, 0);
    let tind_block = inode::block(&raw, TIND_BLOCK);
    let dind_block = pointers(&device, tind_block)[0];
    let ind_block = pointers(&device, dind_block)[0];
    let data_block = pointers(&device, ind_block)[0];
    let owned = [head, tind_block, dind_block, ind_block, data_block];
    assert!(owned.iter().all(|&b| b != 0 && block_in_use(&device, b)));

    vfs.truncate("/sparse").expect("truncate");
    assert_eq!(vfs.stat("/sparse").expect("stat").size, 0);
    assert_eq!(vfs.statfs("/").expect("statfs").free_blocks, before);
    for &block in &owned {
        assert!(!block_in_use(&device, block), "block {} still marked used", block);
    }
    vfs.shutdown().expect("shutdown");
}

#[test]
fn test_directory_grows_and_empties() {
    let device = formatted();
    let vfs = boot(&device);
    vfs.mkdir("/d").expect("mkdir");

    for i in 0..300 {
        vfs.create(&format!("/d/file_{:03}", i), InodeKind::File).expect("create");
    }
    let entries = vfs.read_dir("/d").expect("read_dir");
    assert_eq!(entries.len(), 302);
    assert!(entries.iter().all(|e| e.kind.is_some()));
    assert_eq!(vfs.stat("/d").expect("stat").size, 2 * BLOCK_SIZE as u64);

    assert!(matches!(vfs.unlink("/d"), Err(FsError::DirectoryNotEmpty)));
    for i in 0..300 {
        vfs.unlink(&format!("/d/file_{:03}", i)).expect("unlink");
    }
    assert_eq!(vfs.read_dir("/d").expect("read_dir").len(), 2);
    vfs.unlink("/d").expect("unlink dir");
    assert!(matches!(vfs.stat("/d"), Err(FsError::NotFound)));
    vfs.shutdown().expect("shutdown");
}

#[test]
fn test_directory_link_counts() {
    let device = formatted();
    let vfs = boot(&device);
    let root_links = vfs.stat("/").expect("stat").nlink;
    assert_eq!(root_links, 2);

    vfs.mkdir("/a").expect("mkdir");
    vfs.mkdir("/a/b").expect("mkdir");
    assert_eq!(vfs.stat("/").expect("stat").nlink, 3);
    assert_eq!(vfs.stat("/a").expect("stat").nlink, 3);
    assert_eq!(vfs.stat("/a/b").expect("stat").nlink, 2);

    vfs.unlink("/a/b").expect("unlink");
    assert_eq!(vfs.stat("/a").expect("stat").nlink, 2);
    vfs.unlink("/a").expect("unlink");
    assert_eq!(vfs.stat("/").expect("stat").nlink, 2);
    vfs.shutdown().expect("shutdown");
}
