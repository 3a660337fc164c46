//! The ext2-compatible backend
//!
//! Reads and writes revision 0 and 1 images with 4 KiB blocks. Every
//! metadata change is written home immediately through the buffer cache;
//! nothing here goes through the write-ahead log, so a crash between two
//! related writes (a directory entry and its inode, say) can leave them
//! out of step. Mount keeps the group descriptor blocks pinned in the cache
//! until unmount.

mod balloc;
mod dir;
pub mod disk;
mod ialloc;
mod inode;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::blockdev::{DeviceId, BLOCK_SIZE};
use crate::cache::BlockCache;
use crate::clock::Clock;
use crate::error::{FsError, Result};
use crate::fatal;
use crate::modules::Transaction;
use crate::vfs::{DirEntry, FsKind, FsOps, FsStats, InodeData, InodeKind, InodeOps};

use self::disk::{
    Ext2Superblock, GroupDesc, DESC_PER_BLOCK, DYNAMIC_REV, EXT2_SUPER_MAGIC, GROUP_DESC_SIZE,
    LINK_MAX, ROOT_INO, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, SUPPORTED_INCOMPAT, SUPPORTED_RO_COMPAT, VALID_FS,
};

pub use self::inode::{block_to_path, Ext2Private};

/// Geometry derived from the superblock at mount
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub groups: u32,
    pub inode_size: usize,
    pub first_ino: u32,
    /// First block of the descriptor table
    pub gdt_start: u32,
    pub gdt_blocks: u32,
    pub inode_table_blocks: u32,
    pub filetype: bool,
    pub large_file: bool,
}

impl Geometry {
    fn new(sb: &Ext2Superblock) -> Self {
        let groups = sb.group_count();
        let inode_size = sb.inode_size as usize;
        Self {
            blocks_count: sb.blocks_count,
            inodes_count: sb.inodes_count,
            first_data_block: sb.first_data_block,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            groups,
            inode_size,
            first_ino: sb.first_ino,
            gdt_start: sb.first_data_block + 1,
            gdt_blocks: (groups + DESC_PER_BLOCK as u32 - 1) / DESC_PER_BLOCK as u32,
            inode_table_blocks: ((sb.inodes_per_group as usize * inode_size + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32,
            filetype: sb.has_filetype(),
            large_file: sb.has_large_file(),
        }
    }

    /// First block of `group`
    pub fn group_first_block(&self, group: u32) -> u32 {
        self.first_data_block + group * self.blocks_per_group
    }

    /// Blocks in `group`; the last group may be short
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        (self.blocks_count - self.group_first_block(group)).min(self.blocks_per_group)
    }

    /// Group a block belongs to
    pub fn block_group(&self, block: u32) -> u32 {
        block.saturating_sub(self.first_data_block) / self.blocks_per_group
    }
}

/// A mounted ext2 filesystem
pub struct Ext2Fs {
    dev: DeviceId,
    cache: Arc<BlockCache>,
    clock: Arc<dyn Clock>,
    sb: Mutex<Ext2Superblock>,
    geo: Geometry,
    /// Round-robin cursor for inode allocation
    next_inode_group: AtomicUsize,
    unmounted: AtomicBool,
}

fn check_superblock(sb: &Ext2Superblock, device_blocks: u64) -> Result<()> {
    let bad = |msg: String| Err(FsError::InvalidSuperblock(msg));

    if sb.magic != EXT2_SUPER_MAGIC {
        return bad(format!("bad magic {:#06x}", sb.magic));
    }
    if sb.rev_level > DYNAMIC_REV {
        return Err(FsError::Unsupported(format!("revision {}", sb.rev_level)));
    }
    if sb.block_size() != BLOCK_SIZE as u64 {
        return Err(FsError::Unsupported(format!(
            "block size {}, only {} is supported",
            sb.block_size(),
            BLOCK_SIZE
        )));
    }
    if sb.feature_incompat & !SUPPORTED_INCOMPAT != 0 {
        return Err(FsError::Unsupported(format!(
            "incompatible features {:#x}",
            sb.feature_incompat & !SUPPORTED_INCOMPAT
        )));
    }
    if sb.feature_ro_compat & !SUPPORTED_RO_COMPAT != 0 {
        return Err(FsError::Unsupported(format!(
            "read-only-compatible features {:#x}",
            sb.feature_ro_compat & !SUPPORTED_RO_COMPAT
        )));
    }
    let bits = (BLOCK_SIZE * 8) as u32;
    if sb.blocks_per_group == 0 || sb.blocks_per_group > bits {
        return bad(format!("{} blocks per group", sb.blocks_per_group));
    }
    if sb.inodes_per_group == 0 || sb.inodes_per_group > bits {
        return bad(format!("{} inodes per group", sb.inodes_per_group));
    }
    let inode_size = sb.inode_size as usize;
    if inode_size < 128 || inode_size > BLOCK_SIZE || !inode_size.is_power_of_two() {
        return bad(format!("inode size {}", inode_size));
    }
    if sb.blocks_count as u64 > device_blocks || sb.first_data_block >= sb.blocks_count {
        return bad(format!(
            "{} blocks from {} on a device of {}",
            sb.blocks_count, sb.first_data_block, device_blocks
        ));
    }
    if sb.inodes_count as u64 != sb.group_count() as u64 * sb.inodes_per_group as u64 {
        return bad(format!(
            "{} inodes in {} groups of {}",
            sb.inodes_count,
            sb.group_count(),
            sb.inodes_per_group
        ));
    }
    if sb.first_ino <= ROOT_INO || sb.first_ino > sb.inodes_count {
        return bad(format!("first inode {}", sb.first_ino));
    }
    Ok(())
}

impl Ext2Fs {
    /// Read and check the superblock and descriptors of `dev`, then pin the
    /// descriptor blocks.
    pub fn mount(dev: DeviceId, cache: Arc<BlockCache>, clock: Arc<dyn Clock>) -> Result<Self> {
        let device_blocks = cache.devices().get(dev)?.block_count();
        let mut sb = {
            let buf = cache.acquire(dev, 0);
            Ext2Superblock::from_bytes(&buf[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE])
        };
        check_superblock(&sb, device_blocks)?;
        let geo = Geometry::new(&sb);

        for group in 0..geo.groups {
            let block = geo.gdt_start + group / DESC_PER_BLOCK as u32;
            let off = (group as usize % DESC_PER_BLOCK) * GROUP_DESC_SIZE;
            let desc = {
                let buf = cache.acquire(dev, block);
                GroupDesc::from_bytes(&buf[off..off + GROUP_DESC_SIZE])
            };
            let first = geo.group_first_block(group);
            let last = first + geo.blocks_in_group(group);
            let inside = |b: u32| b >= first && b < last;
            if !inside(desc.block_bitmap)
                || !inside(desc.inode_bitmap)
                || !inside(desc.inode_table)
                || desc.inode_table + geo.inode_table_blocks > last
            {
                return Err(FsError::InvalidSuperblock(format!(
                    "group {} descriptor points outside the group: {:?}",
                    group, desc
                )));
            }
        }

        for block in geo.gdt_start..geo.gdt_start + geo.gdt_blocks {
            cache.pin_block(dev, block);
        }

        sb.mnt_count = sb.mnt_count.wrapping_add(1);
        sb.mtime = clock.now();
        sb.state &= !VALID_FS;

        let fs = Self {
            dev,
            cache,
            clock,
            sb: Mutex::new(sb),
            geo,
            next_inode_group: AtomicUsize::new(0),
            unmounted: AtomicBool::new(false),
        };
        fs.write_super();

        log::info!(
            "{}: ext2 filesystem, {} blocks in {} groups, {} inodes",
            dev,
            geo.blocks_count,
            geo.groups,
            geo.inodes_count
        );
        Ok(fs)
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Copy of the in-memory superblock
    pub fn superblock(&self) -> Ext2Superblock {
        self.sb.lock().clone()
    }

    fn write_super(&self) {
        let sb = self.sb.lock();
        let mut buf = self.cache.acquire(self.dev, 0);
        sb.write_to(&mut buf[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE]);
        buf.flush();
    }

    fn desc_location(&self, group: u32) -> (u32, usize) {
        if group >= self.geo.groups {
            fatal!("{}: block group {} out of range ({} groups)", self.dev, group, self.geo.groups);
        }
        (
            self.geo.gdt_start + group / DESC_PER_BLOCK as u32,
            (group as usize % DESC_PER_BLOCK) * GROUP_DESC_SIZE,
        )
    }

    /// Current descriptor of `group`
    pub fn group_desc(&self, group: u32) -> GroupDesc {
        let (block, off) = self.desc_location(group);
        let buf = self.cache.acquire(self.dev, block);
        GroupDesc::from_bytes(&buf[off..off + GROUP_DESC_SIZE])
    }

    /// Apply deltas to a group's counters and write the descriptor home.
    /// Callers holding a bitmap buffer take this lock second.
    pub(crate) fn adjust_group(&self, group: u32, free_blocks: i32, free_inodes: i32, dirs: i32) {
        let (block, off) = self.desc_location(group);
        let mut buf = self.cache.acquire(self.dev, block);
        let mut desc = GroupDesc::from_bytes(&buf[off..off + GROUP_DESC_SIZE]);

        let apply = |count: u16, delta: i32, what: &str| -> u16 {
            let next = count as i32 + delta;
            if next < 0 || next > u16::MAX as i32 {
                fatal!("{}: group {} {} count {} cannot change by {}", self.dev, group, what, count, delta);
            }
            next as u16
        };
        desc.free_blocks_count = apply(desc.free_blocks_count, free_blocks, "free block");
        desc.free_inodes_count = apply(desc.free_inodes_count, free_inodes, "free inode");
        desc.used_dirs_count = apply(desc.used_dirs_count, dirs, "directory");

        desc.write_to(&mut buf[off..off + GROUP_DESC_SIZE]);
        buf.flush();
    }

    /// Block and byte offset of inode `inum` in its group's table
    pub(crate) fn inode_location(&self, inum: u32) -> (u32, usize) {
        if inum == 0 || inum > self.geo.inodes_count {
            fatal!("{}: inode {} out of range", self.dev, inum);
        }
        let group = (inum - 1) / self.geo.inodes_per_group;
        let index = ((inum - 1) % self.geo.inodes_per_group) as usize;
        let desc = self.group_desc(group);
        let byte = index * self.geo.inode_size;
        (desc.inode_table + (byte / BLOCK_SIZE) as u32, byte % BLOCK_SIZE)
    }

    fn now(&self) -> u32 {
        self.clock.now()
    }
}

impl FsOps for Ext2Fs {
    fn kind(&self) -> FsKind {
        FsKind::Ext2
    }

    fn dev(&self) -> DeviceId {
        self.dev
    }

    fn root_inum(&self) -> u32 {
        ROOT_INO
    }

    fn stats(&self) -> Result<FsStats> {
        let (free_blocks, free_inodes) = (0..self.geo.groups)
            .map(|g| self.group_desc(g))
            .fold((0u64, 0u64), |(b, i), d| {
                (b + d.free_blocks_count as u64, i + d.free_inodes_count as u64)
            });
        Ok(FsStats {
            kind: FsKind::Ext2,
            block_size: BLOCK_SIZE as u32,
            total_blocks: self.geo.blocks_count as u64,
            free_blocks,
            total_inodes: self.geo.inodes_count as u64,
            free_inodes,
            log_blocks: None,
        })
    }

    fn alloc_block(&self, goal: u32) -> Result<u32> {
        let (block, _) = self.new_blocks(goal, 1)?;
        self.zero_block(block);
        Ok(block)
    }

    fn free_block(&self, block: u32) {
        self.free_blocks(block, 1)
    }

    fn alloc_inode(&self, kind: InodeKind, parent: u32) -> Result<u32> {
        self.new_inode(kind, parent)
    }

    fn free_inode(&self, inum: u32, kind: InodeKind) {
        self.release_inode(inum, kind)
    }

    fn max_links(&self) -> u16 {
        LINK_MAX
    }

    fn begin_op(&self) -> Option<Transaction> {
        None
    }

    fn unmount(&self) -> Result<()> {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return Err(FsError::InvalidArgument(format!("{} is already unmounted", self.dev)));
        }
        let stats = self.stats()?;
        {
            let mut sb = self.sb.lock();
            sb.free_blocks_count = stats.free_blocks as u32;
            sb.free_inodes_count = stats.free_inodes as u32;
            sb.wtime = self.now();
            sb.state |= VALID_FS;
        }
        self.write_super();

        for block in self.geo.gdt_start..self.geo.gdt_start + self.geo.gdt_blocks {
            self.cache.unpin(self.dev, block);
        }
        log::info!(
            "{}: ext2 filesystem unmounted, {} free blocks, {} free inodes",
            self.dev,
            stats.free_blocks,
            stats.free_inodes
        );
        Ok(())
    }
}

impl InodeOps for Ext2Fs {
    fn read_inode(&self, ip: &mut InodeData) -> Result<()> {
        self.load_inode(ip)
    }

    fn update(&self, ip: &mut InodeData) -> Result<()> {
        self.store_inode(ip)
    }

    fn truncate(&self, ip: &mut InodeData) -> Result<()> {
        self.truncate_blocks(ip)
    }

    fn map_block(&self, ip: &mut InodeData, lblock: u64, alloc: bool) -> Result<Option<u32>> {
        let block = self.get_block(ip, lblock, alloc)?;
        if alloc {
            self.store_inode(ip)?;
        }
        Ok(block)
    }

    fn read(&self, ip: &mut InodeData, off: u64, dst: &mut [u8]) -> Result<usize> {
        self.read_data(ip, off, dst)
    }

    fn write(&self, ip: &mut InodeData, off: u64, src: &[u8]) -> Result<usize> {
        self.write_data(ip, off, src)
    }

    fn lookup(&self, dp: &mut InodeData, name: &str) -> Result<Option<u32>> {
        Ok(self.find_entry(dp, name)?.map(|slot| slot.inode))
    }

    fn link(&self, dp: &mut InodeData, name: &str, inum: u32, kind: InodeKind) -> Result<()> {
        self.add_entry(dp, name, inum, kind)
    }

    fn unlink(&self, dp: &mut InodeData, name: &str) -> Result<()> {
        self.delete_entry(dp, name)
    }

    fn init_dir(&self, ip: &mut InodeData, parent: u32) -> Result<()> {
        self.make_empty_dir(ip, parent)
    }

    fn is_dir_empty(&self, dp: &mut InodeData) -> Result<bool> {
        self.dir_is_empty(dp)
    }

    fn read_dir(&self, dp: &mut InodeData) -> Result<Vec<DirEntry>> {
        self.list_entries(dp)
    }
}

impl Drop for Ext2Fs {
    fn drop(&mut self) {
        if !self.unmounted.load(Ordering::SeqCst) {
            log::warn!("{}: ext2 filesystem dropped without unmount", self.dev);
        }
    }
}
