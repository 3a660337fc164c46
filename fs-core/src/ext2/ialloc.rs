//! Inode allocation

use std::sync::atomic::Ordering;

use super::disk::inode;
use super::Ext2Fs;
use crate::block_bitmap::Bitmap;
use crate::error::{FsError, Result};
use crate::fatal;
use crate::vfs::InodeKind;

impl Ext2Fs {
    /// Claim a free inode, visiting groups round-robin, and write a fresh
    /// on-disk image for it.
    pub(super) fn new_inode(&self, kind: InodeKind, _parent: u32) -> Result<u32> {
        let geo = *self.geometry();
        let start = self.next_inode_group.fetch_add(1, Ordering::Relaxed) as u32 % geo.groups;

        for i in 0..geo.groups {
            let group = (start + i) % geo.groups;
            let desc = self.group_desc(group);
            if desc.free_inodes_count == 0 {
                continue;
            }

            // inodes below first_ino are reserved
            let mut next = if group == 0 { geo.first_ino as usize - 1 } else { 0 };
            let mut bitmap = self.cache.acquire(self.dev, desc.inode_bitmap);
            let mut bits = Bitmap::new(&mut bitmap, geo.inodes_per_group as usize);
            let bit = loop {
                match bits.find_zero_from(next) {
                    Some(bit) if !bits.test_and_set(bit) => break Some(bit),
                    Some(bit) => next = bit + 1,
                    None => break None,
                }
            };
            let bit = match bit {
                Some(bit) => bit as u32,
                None => {
                    log::warn!("{}: group {} claims free inodes but its bitmap is full", self.dev, group);
                    continue;
                }
            };
            bitmap.flush();
            let dirs = if kind == InodeKind::Dir { 1 } else { 0 };
            self.adjust_group(group, 0, -1, dirs);
            drop(bitmap);

            let inum = group * geo.inodes_per_group + bit + 1;
            self.init_inode_image(inum, kind);
            log::debug!("{}: allocated inode {} ({:?}) in group {}", self.dev, inum, kind, group);
            return Ok(inum);
        }
        Err(FsError::NoInodes)
    }

    fn init_inode_image(&self, inum: u32, kind: InodeKind) {
        let (block, off) = self.inode_location(inum);
        let isz = self.geometry().inode_size;
        let now = self.now();

        let mut buf = self.cache.acquire(self.dev, block);
        let raw = &mut buf[off..off + isz];
        raw.fill(0);
        inode::set_mode(raw, inode::mode_for(kind));
        inode::set_times(raw, now, now, now);
        buf.flush();
    }

    /// Clear the inode's bitmap bit and stamp its deletion time.
    pub(super) fn release_inode(&self, inum: u32, kind: InodeKind) {
        let geo = *self.geometry();
        if inum < geo.first_ino || inum > geo.inodes_count {
            fatal!("{}: freeing reserved or nonexistent inode {}", self.dev, inum);
        }
        let group = (inum - 1) / geo.inodes_per_group;
        let bit = ((inum - 1) % geo.inodes_per_group) as usize;
        let desc = self.group_desc(group);

        let mut bitmap = self.cache.acquire(self.dev, desc.inode_bitmap);
        if !Bitmap::new(&mut bitmap, geo.inodes_per_group as usize).test_and_clear(bit) {
            fatal!("{}: bit already cleared for inode {}", self.dev, inum);
        }
        bitmap.flush();
        let dirs = if kind == InodeKind::Dir { -1 } else { 0 };
        self.adjust_group(group, 0, 1, dirs);
        drop(bitmap);

        let (block, off) = self.inode_location(inum);
        let mut buf = self.cache.acquire(self.dev, block);
        let raw = &mut buf[off..off + geo.inode_size];
        inode::set_dtime(raw, self.now());
        inode::set_links(raw, 0);
        buf.flush();
        log::debug!("{}: freed inode {}", self.dev, inum);
    }
}
