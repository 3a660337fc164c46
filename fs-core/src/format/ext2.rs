//! ext2 image creation
//!
//! Produces a revision 1 image with 4 KiB blocks, sparse superblock
//! backups and a root directory, laid out the way mke2fs lays out a small
//! filesystem without a resize inode.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::clock::{Clock, SystemClock};
use crate::error::{FsError, Result};
use crate::ext2::disk::{
    dirent, inode, Ext2Superblock, GroupDesc, DESC_PER_BLOCK, DYNAMIC_REV, EXT2_SUPER_MAGIC,
    FEATURE_INCOMPAT_FILETYPE, FEATURE_RO_COMPAT_LARGE_FILE, FEATURE_RO_COMPAT_SPARSE_SUPER, FT_DIR,
    GOOD_OLD_FIRST_INO, GROUP_DESC_SIZE, ROOT_INO, S_IFDIR, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, VALID_FS,
};

/// Geometry of an ext2 image
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ext2Geometry {
    /// Image size in blocks; the whole device when unset
    pub size: Option<u32>,
    pub blocks_per_group: u32,
    /// Rounded up to fill whole inode-table blocks
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub volume_name: String,
}

impl Default for Ext2Geometry {
    fn default() -> Self {
        Self {
            size: None,
            blocks_per_group: (BLOCK_SIZE * 8) as u32,
            inodes_per_group: 8192,
            inode_size: 128,
            volume_name: String::new(),
        }
    }
}

/// Where one group's metadata lives
#[derive(Debug, Clone, Copy)]
struct GroupPlan {
    start: u32,
    len: u32,
    has_super: bool,
    desc: GroupDesc,
    /// Blocks used by metadata, from the start of the group
    used: u32,
}

fn invalid(msg: String) -> FsError {
    FsError::InvalidArgument(msg)
}

/// Write an empty ext2 filesystem holding only the root directory.
pub fn format_ext2(device: &dyn BlockDevice, geometry: &Ext2Geometry) -> Result<Ext2Superblock> {
    let device_blocks = device.block_count().min(u32::MAX as u64) as u32;
    let mut blocks = geometry.size.unwrap_or(device_blocks);
    if blocks > device_blocks {
        return Err(invalid(format!("image of {} blocks on a device of {}", blocks, device_blocks)));
    }
    let bits = (BLOCK_SIZE * 8) as u32;
    let bpg = geometry.blocks_per_group;
    if bpg < 64 || bpg > bits || bpg % 8 != 0 {
        return Err(invalid(format!("{} blocks per group", bpg)));
    }
    let isz = geometry.inode_size as usize;
    if isz < 128 || isz > BLOCK_SIZE || !isz.is_power_of_two() {
        return Err(invalid(format!("inode size {}", isz)));
    }
    let per_block = (BLOCK_SIZE / isz) as u32;
    let ipg = (geometry.inodes_per_group.max(1) + per_block - 1) / per_block * per_block;
    if ipg > bits {
        return Err(invalid(format!("{} inodes per group", ipg)));
    }
    let volume = geometry.volume_name.as_bytes();
    if volume.len() > 16 {
        return Err(invalid(format!("volume name '{}' longer than 16 bytes", geometry.volume_name)));
    }

    let now = SystemClock.now();
    let mut sb = Ext2Superblock {
        blocks_per_group: bpg,
        inodes_per_group: ipg,
        log_block_size: 2,
        magic: EXT2_SUPER_MAGIC,
        state: VALID_FS,
        rev_level: DYNAMIC_REV,
        first_ino: GOOD_OLD_FIRST_INO,
        inode_size: geometry.inode_size,
        feature_incompat: FEATURE_INCOMPAT_FILETYPE,
        feature_ro_compat: FEATURE_RO_COMPAT_SPARSE_SUPER | FEATURE_RO_COMPAT_LARGE_FILE,
        wtime: now,
        lastcheck: now,
        ..Default::default()
    };
    sb.volume_name[..volume.len()].copy_from_slice(volume);
    if let Err(err) = getrandom::getrandom(&mut sb.uuid) {
        log::warn!("no random source for the volume uuid ({}), deriving one from the clock", err);
        LittleEndian::write_u32(&mut sb.uuid[..4], now);
        LittleEndian::write_u32(&mut sb.uuid[4..8], std::process::id());
    }

    let itb = ipg * isz as u32 / BLOCK_SIZE as u32;
    let overhead = |group: u32, groups: u32| {
        let gdt = (groups + DESC_PER_BLOCK as u32 - 1) / DESC_PER_BLOCK as u32;
        let sb_blocks = if sb.group_has_super(group) { 1 + gdt } else { 0 };
        sb_blocks + 2 + itb
    };

    let mut groups = (blocks + bpg - 1) / bpg;
    if groups > 1 {
        // a trailing group too small for its own metadata is dropped
        let last = groups - 1;
        if blocks - last * bpg < overhead(last, groups) + 16 {
            groups = last;
            blocks = last * bpg;
        }
    }
    if groups == 0 || blocks.min(bpg) < overhead(0, groups) + 1 {
        return Err(invalid(format!("{} blocks cannot hold a filesystem", blocks)));
    }
    let gdt_blocks = (groups + DESC_PER_BLOCK as u32 - 1) / DESC_PER_BLOCK as u32;

    let mut plans = Vec::with_capacity(groups as usize);
    for group in 0..groups {
        let start = group * bpg;
        let len = (blocks - start).min(bpg);
        let has_super = sb.group_has_super(group);
        let mut next = start + if has_super { 1 + gdt_blocks } else { 0 };
        let block_bitmap = next;
        let inode_bitmap = next + 1;
        let inode_table = next + 2;
        next = inode_table + itb;
        if group == 0 {
            // root directory block
            next += 1;
        }
        if next > start + len {
            return Err(invalid(format!("group {} of {} blocks cannot hold its metadata", group, len)));
        }

        let used = next - start;
        let reserved_inodes = if group == 0 { GOOD_OLD_FIRST_INO - 1 } else { 0 };
        plans.push(GroupPlan {
            start,
            len,
            has_super,
            desc: GroupDesc {
                block_bitmap,
                inode_bitmap,
                inode_table,
                free_blocks_count: (len - used) as u16,
                free_inodes_count: (ipg - reserved_inodes) as u16,
                used_dirs_count: if group == 0 { 1 } else { 0 },
            },
            used,
        });
    }

    sb.blocks_count = blocks;
    sb.inodes_count = groups * ipg;
    sb.free_blocks_count = plans.iter().map(|p| p.desc.free_blocks_count as u32).sum();
    sb.free_inodes_count = plans.iter().map(|p| p.desc.free_inodes_count as u32).sum();

    let mut gdt = vec![0u8; gdt_blocks as usize * BLOCK_SIZE];
    for (i, plan) in plans.iter().enumerate() {
        plan.desc.write_to(&mut gdt[i * GROUP_DESC_SIZE..(i + 1) * GROUP_DESC_SIZE]);
    }

    let zero = vec![0u8; BLOCK_SIZE];
    for (group, plan) in plans.iter().enumerate() {
        for b in plan.start..plan.start + plan.used {
            device.write_block(b as u64, &zero)?;
        }

        if plan.has_super {
            let mut block = vec![0u8; BLOCK_SIZE];
            let at = if group == 0 { SUPERBLOCK_OFFSET } else { 0 };
            sb.block_group_nr = group as u16;
            write_superblock(&sb, &mut block[at..at + SUPERBLOCK_SIZE]);
            device.write_block(plan.start as u64, &block)?;
            for (i, chunk) in gdt.chunks(BLOCK_SIZE).enumerate() {
                device.write_block((plan.start + 1 + i as u32) as u64, chunk)?;
            }
        }

        let mut bitmap = vec![0u8; BLOCK_SIZE];
        set_bits(&mut bitmap, 0..plan.used as usize);
        set_bits(&mut bitmap, plan.len as usize..BLOCK_SIZE * 8);
        device.write_block(plan.desc.block_bitmap as u64, &bitmap)?;

        let mut bitmap = vec![0u8; BLOCK_SIZE];
        if group == 0 {
            set_bits(&mut bitmap, 0..GOOD_OLD_FIRST_INO as usize - 1);
        }
        set_bits(&mut bitmap, ipg as usize..BLOCK_SIZE * 8);
        device.write_block(plan.desc.inode_bitmap as u64, &bitmap)?;
    }
    sb.block_group_nr = 0;

    // root directory
    let root_group = &plans[0];
    let root_block = root_group.desc.inode_table + itb;
    let mut dir = vec![0u8; BLOCK_SIZE];
    let dot_len = dirent::rec_len(1);
    dirent::write(&mut dir, 0, ROOT_INO, dot_len, b".", FT_DIR);
    dirent::write(&mut dir, dot_len, ROOT_INO, BLOCK_SIZE - dot_len, b"..", FT_DIR);
    device.write_block(root_block as u64, &dir)?;

    let mut table = vec![0u8; BLOCK_SIZE];
    let off = (ROOT_INO as usize - 1) * isz;
    let raw = &mut table[off..off + isz];
    inode::set_mode(raw, S_IFDIR | 0o755);
    inode::set_links(raw, 2);
    inode::set_size(raw, BLOCK_SIZE as u32, 0);
    inode::set_times(raw, now, now, now);
    inode::set_sectors(raw, (BLOCK_SIZE / 512) as u32);
    inode::set_block(raw, 0, root_block);
    device.write_block(root_group.desc.inode_table as u64, &table)?;

    device.sync()?;
    log::info!(
        "formatted ext2 image: {} blocks in {} groups, {} inodes, {} free blocks",
        sb.blocks_count,
        groups,
        sb.inodes_count,
        sb.free_blocks_count
    );
    Ok(sb)
}

fn write_superblock(sb: &Ext2Superblock, raw: &mut [u8]) {
    sb.write_to(raw);
    // s_max_mnt_count: no forced checks; s_errors: continue
    LittleEndian::write_i16(&mut raw[54..56], -1);
    LittleEndian::write_u16(&mut raw[60..62], 1);
}

fn set_bits(bitmap: &mut [u8], range: std::ops::Range<usize>) {
    for bit in range {
        bitmap[bit / 8] |= 1 << (bit % 8);
    }
}
