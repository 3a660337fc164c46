//! Block allocation across groups

use super::{Ext2Fs, GroupDesc};
use crate::block_bitmap::Bitmap;
use crate::error::{FsError, Result};
use crate::fatal;

impl Ext2Fs {
    /// Allocate up to `count` contiguous blocks, as close to `goal` as the
    /// bitmaps allow. Returns the first block and the run length, which is
    /// at least one.
    ///
    /// The goal's group is searched from the goal onwards, then every other
    /// group in turn, then the goal's group again from its start.
    pub(super) fn new_blocks(&self, goal: u32, count: u32) -> Result<(u32, u32)> {
        let geo = self.geometry();
        let goal = if goal < geo.first_data_block || goal >= geo.blocks_count {
            geo.first_data_block
        } else {
            goal
        };
        let goal_group = geo.block_group(goal);
        let goal_offset = goal - geo.group_first_block(goal_group);

        let mut order = Vec::with_capacity(geo.groups as usize + 1);
        order.push((goal_group, goal_offset));
        for i in 1..geo.groups {
            order.push(((goal_group + i) % geo.groups, 0));
        }
        if goal_offset > 0 {
            order.push((goal_group, 0));
        }

        for (group, start) in order {
            let desc = self.group_desc(group);
            if desc.free_blocks_count == 0 {
                continue;
            }
            if let Some(run) = self.claim_in_group(group, &desc, start, count.max(1)) {
                return Ok(run);
            }
        }
        log::warn!("{}: no free blocks (goal {})", self.dev, goal);
        Err(FsError::NoSpace)
    }

    fn claim_in_group(&self, group: u32, desc: &GroupDesc, start: u32, count: u32) -> Option<(u32, u32)> {
        let geo = self.geometry();
        let mut bitmap = self.cache.acquire(self.dev, desc.block_bitmap);
        let limit = geo.blocks_in_group(group) as usize;
        let (bit, len) = Bitmap::new(&mut bitmap, limit).claim_run(start as usize, count as usize)?;

        let first = geo.group_first_block(group) + bit as u32;
        if self.in_system_zone(desc, first, len as u32) {
            fatal!(
                "{}: allocating blocks {}..{} in the system zone of group {}",
                self.dev,
                first,
                first + len as u32,
                group
            );
        }
        bitmap.flush();
        self.adjust_group(group, -(len as i32), 0, 0);
        Some((first, len as u32))
    }

    /// Return `count` blocks starting at `block` to their group. The range
    /// must lie inside one group.
    pub(super) fn free_blocks(&self, block: u32, count: u32) {
        let geo = *self.geometry();
        if count == 0 || block < geo.first_data_block || block as u64 + count as u64 > geo.blocks_count as u64 {
            fatal!("{}: freeing blocks not in the data zone: {} + {}", self.dev, block, count);
        }
        let group = geo.block_group(block);
        let bit = block - geo.group_first_block(group);
        if bit + count > geo.blocks_in_group(group) {
            fatal!("{}: freeing blocks {} + {} crosses the end of group {}", self.dev, block, count, group);
        }
        let desc = self.group_desc(group);
        if self.in_system_zone(&desc, block, count) {
            fatal!("{}: freeing blocks in the system zone: {} + {}", self.dev, block, count);
        }

        let mut bitmap = self.cache.acquire(self.dev, desc.block_bitmap);
        let cleared = Bitmap::new(&mut bitmap, geo.blocks_in_group(group) as usize)
            .clear_range(bit as usize, count as usize);
        if cleared != count as usize {
            fatal!(
                "{}: bit already cleared for {} of blocks {} + {}",
                self.dev,
                count as usize - cleared,
                block,
                count
            );
        }
        bitmap.flush();
        self.adjust_group(group, count as i32, 0, 0);
    }

    /// Whether `start..start + len` touches the group's bitmaps or inode table
    fn in_system_zone(&self, desc: &GroupDesc, start: u32, len: u32) -> bool {
        let end = start + len;
        let table_end = desc.inode_table + self.geometry().inode_table_blocks;
        (start..end).contains(&desc.block_bitmap)
            || (start..end).contains(&desc.inode_bitmap)
            || (start < table_end && desc.inode_table < end)
    }

    /// Zero a freshly allocated block on disk
    pub(super) fn zero_block(&self, block: u32) {
        let mut buf = self.cache.acquire(self.dev, block);
        buf.fill(0);
        buf.flush();
    }
}
