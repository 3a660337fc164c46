//! Inode images, block mapping and file data
//!
//! Logical blocks map through `i_block`: twelve direct slots, then one
//! indirect, one doubly-indirect and one triply-indirect tree. New branches
//! are written bottom-up and spliced into their parent last, so a reader
//! never follows a pointer to an unwritten block.

use byteorder::{ByteOrder, LittleEndian};

use super::disk::{inode, ADDR_PER_BLOCK, DIND_BLOCK, IND_BLOCK, NDIR_BLOCKS, N_BLOCKS, TIND_BLOCK};
use super::Ext2Fs;
use crate::blockdev::BLOCK_SIZE;
use crate::error::{FsError, Result};
use crate::fatal;
use crate::vfs::{InodeData, InodeKind, InodePrivate};

/// 512-byte units per block, the unit of `i_blocks`
const SECTORS_PER_BLOCK: u32 = (BLOCK_SIZE / 512) as u32;

/// Blocks reachable through `i_block`
const MAX_BLOCKS: u64 = NDIR_BLOCKS as u64
    + ADDR_PER_BLOCK as u64
    + (ADDR_PER_BLOCK * ADDR_PER_BLOCK) as u64
    + (ADDR_PER_BLOCK * ADDR_PER_BLOCK) as u64 * ADDR_PER_BLOCK as u64;

/// Per-inode state kept by the ext2 backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ext2Private {
    /// The on-disk inode, `inode_size` bytes
    pub raw: Vec<u8>,
    /// Last logical block allocated and the physical block it got
    pub last_alloc: Option<(u64, u32)>,
}

/// Slot indices leading to logical block `lblock`: the `i_block` index,
/// then one index per level of indirection.
pub fn block_to_path(lblock: u64) -> Result<Vec<usize>> {
    let ptrs = ADDR_PER_BLOCK as u64;
    let mut i = lblock;

    if i < NDIR_BLOCKS as u64 {
        return Ok(vec![i as usize]);
    }
    i -= NDIR_BLOCKS as u64;
    if i < ptrs {
        return Ok(vec![IND_BLOCK, i as usize]);
    }
    i -= ptrs;
    if i < ptrs * ptrs {
        return Ok(vec![DIND_BLOCK, (i / ptrs) as usize, (i % ptrs) as usize]);
    }
    i -= ptrs * ptrs;
    if i < ptrs * ptrs * ptrs {
        return Ok(vec![
            TIND_BLOCK,
            (i / (ptrs * ptrs)) as usize,
            ((i / ptrs) % ptrs) as usize,
            (i % ptrs) as usize,
        ]);
    }
    Err(FsError::FileTooLarge)
}

/// One step of a lookup: where the pointer lives and what it holds
#[derive(Debug, Clone, Copy)]
struct Step {
    /// Indirect block holding the pointer; `None` for `i_block`
    parent: Option<u32>,
    slot: usize,
    key: u32,
}

fn private(ip: &InodeData) -> &Ext2Private {
    match &ip.private {
        InodePrivate::Ext2(p) => p,
        other => fatal!("inode {} is not an ext2 inode: {:?}", ip.inum, other),
    }
}

fn private_mut(ip: &mut InodeData) -> &mut Ext2Private {
    match &mut ip.private {
        InodePrivate::Ext2(p) => p,
        other => fatal!("inode is not an ext2 inode: {:?}", other),
    }
}

fn entry(block: &[u8], slot: usize) -> u32 {
    LittleEndian::read_u32(&block[slot * 4..slot * 4 + 4])
}

fn set_entry(block: &mut [u8], slot: usize, value: u32) {
    LittleEndian::write_u32(&mut block[slot * 4..slot * 4 + 4], value)
}

/// Walk of the indirect trees during truncation
enum Frame {
    /// Visit an indirect block with `depth` levels below it
    Enter { block: u32, depth: u32 },
    /// Release an indirect block after its children
    Free(u32),
}

/// Batches frees into contiguous runs within one group
struct RunFreer<'a> {
    fs: &'a Ext2Fs,
    run: Option<(u32, u32)>,
    freed: u32,
}

impl<'a> RunFreer<'a> {
    fn new(fs: &'a Ext2Fs) -> Self {
        Self { fs, run: None, freed: 0 }
    }

    fn release(&mut self, block: u32) {
        self.freed += 1;
        let geo = self.fs.geometry();
        if let Some((start, len)) = &mut self.run {
            if *start + *len == block && geo.block_group(*start) == geo.block_group(block) {
                *len += 1;
                return;
            }
        }
        self.flush();
        self.run = Some((block, 1));
    }

    fn flush(&mut self) {
        if let Some((start, len)) = self.run.take() {
            self.fs.free_blocks(start, len);
        }
    }
}

impl Ext2Fs {
    pub(super) fn load_inode(&self, ip: &mut InodeData) -> Result<()> {
        let (block, off) = self.inode_location(ip.inum);
        let isz = self.geometry().inode_size;
        let raw = {
            let buf = self.cache.acquire(self.dev, block);
            buf[off..off + isz].to_vec()
        };

        let kind = inode::kind_from_mode(inode::mode(&raw));
        let hi = if kind == InodeKind::File && self.geometry().large_file {
            inode::size_hi(&raw) as u64
        } else {
            0
        };
        ip.kind = kind;
        ip.nlink = inode::links(&raw);
        ip.size = inode::size_lo(&raw) as u64 | hi << 32;
        ip.uid = inode::uid(&raw);
        ip.gid = inode::gid(&raw);
        ip.atime = inode::atime(&raw);
        ip.mtime = inode::mtime(&raw);
        ip.ctime = inode::ctime(&raw);
        let (major, minor) = if kind == InodeKind::Device {
            let dev = inode::block(&raw, 0);
            (((dev >> 8) & 0xff) as u16, (dev & 0xff) as u16)
        } else {
            (0, 0)
        };
        ip.major = major;
        ip.minor = minor;
        ip.private = InodePrivate::Ext2(Ext2Private { raw, last_alloc: None });
        Ok(())
    }

    pub(super) fn store_inode(&self, ip: &mut InodeData) -> Result<()> {
        let inum = ip.inum;
        let kind = ip.kind;
        let (lo, hi) = match kind {
            InodeKind::File => (ip.size as u32, (ip.size >> 32) as u32),
            _ => (ip.size as u32, 0),
        };
        let (nlink, uid, gid) = (ip.nlink, ip.uid, ip.gid);
        let (atime, ctime, mtime) = (ip.atime, ip.ctime, ip.mtime);
        let device = (ip.major as u32 & 0xff) << 8 | ip.minor as u32 & 0xff;

        let p = private_mut(ip);
        let raw = &mut p.raw;
        let mode = inode::mode(raw);
        if kind == InodeKind::Free {
            inode::set_mode(raw, 0);
        } else if inode::kind_from_mode(mode) != kind {
            inode::set_mode(raw, inode::mode_for(kind));
        }
        if kind == InodeKind::Device {
            inode::set_block(raw, 0, device);
        }
        inode::set_links(raw, nlink);
        inode::set_size(raw, lo, hi);
        inode::set_uid(raw, uid);
        inode::set_gid(raw, gid);
        inode::set_times(raw, atime, ctime, mtime);

        let (block, off) = self.inode_location(inum);
        let mut buf = self.cache.acquire(self.dev, block);
        buf[off..off + raw.len()].copy_from_slice(raw);
        buf.flush();
        Ok(())
    }

    /// Largest byte size a regular file may reach
    pub(super) fn max_file_size(&self) -> u64 {
        let limit = MAX_BLOCKS * BLOCK_SIZE as u64;
        if self.geometry().large_file {
            limit
        } else {
            limit.min(i32::MAX as u64)
        }
    }

    /// Follow `offsets` from the inode as far as allocated pointers go.
    /// The chain ends at the first zero key or at the data block.
    fn get_branch(&self, p: &Ext2Private, offsets: &[usize]) -> Vec<Step> {
        let mut chain = Vec::with_capacity(offsets.len());
        let mut key = inode::block(&p.raw, offsets[0]);
        chain.push(Step {
            parent: None,
            slot: offsets[0],
            key,
        });
        for &slot in &offsets[1..] {
            if key == 0 {
                break;
            }
            let parent = key;
            key = {
                let buf = self.cache.acquire(self.dev, parent);
                entry(&buf, slot)
            };
            chain.push(Step {
                parent: Some(parent),
                slot,
                key,
            });
        }
        chain
    }

    /// Preferred location for the block that will fill `step`
    fn find_goal(&self, ip: &InodeData, lblock: u64, step: &Step) -> u32 {
        let p = private(ip);
        if let Some((last_lblock, last_block)) = p.last_alloc {
            if lblock == last_lblock + 1 {
                return last_block + 1;
            }
        }

        // the nearest allocated pointer before ours, else the parent itself
        match step.parent {
            None => {
                if let Some(b) = (0..step.slot).rev().map(|i| inode::block(&p.raw, i)).find(|&b| b != 0) {
                    return b;
                }
            }
            Some(parent) => {
                let buf = self.cache.acquire(self.dev, parent);
                return (0..step.slot)
                    .rev()
                    .map(|i| entry(&buf, i))
                    .find(|&b| b != 0)
                    .unwrap_or(parent);
            }
        }

        // spread unrelated writers across the inode's group
        let geo = self.geometry();
        let group = (ip.inum - 1) / geo.inodes_per_group;
        let colour = (std::process::id() % 16) * (geo.blocks_per_group / 16);
        geo.group_first_block(group) + colour
    }

    /// Allocate the missing tail of `chain` (from step `k`) and splice it in.
    /// Returns the new data block.
    fn alloc_branch(&self, ip: &mut InodeData, lblock: u64, offsets: &[usize], chain: &[Step], k: usize) -> Result<u32> {
        let indirect = offsets.len() - k - 1;
        let total = indirect + 1;
        let goal = self.find_goal(ip, lblock, &chain[k]);

        let mut blocks: Vec<u32> = Vec::with_capacity(total);
        while blocks.len() < total {
            let next_goal = blocks.last().map_or(goal, |b| b + 1);
            match self.new_blocks(next_goal, (total - blocks.len()) as u32) {
                Ok((first, len)) => blocks.extend(first..first + len),
                Err(err) => {
                    for &b in &blocks {
                        self.free_blocks(b, 1);
                    }
                    return Err(err);
                }
            }
        }

        for (i, &b) in blocks.iter().enumerate() {
            let mut buf = self.cache.acquire(self.dev, b);
            buf.fill(0);
            if i < indirect {
                set_entry(&mut buf, offsets[k + 1 + i], blocks[i + 1]);
            }
            buf.flush();
        }

        let step = chain[k];
        let p = private_mut(ip);
        match step.parent {
            None => inode::set_block(&mut p.raw, step.slot, blocks[0]),
            Some(parent) => {
                let mut buf = self.cache.acquire(self.dev, parent);
                set_entry(&mut buf, step.slot, blocks[0]);
                buf.flush();
            }
        }

        let data = blocks[total - 1];
        let sectors = inode::sectors(&p.raw) + total as u32 * SECTORS_PER_BLOCK;
        inode::set_sectors(&mut p.raw, sectors);
        p.last_alloc = Some((lblock, data));
        Ok(data)
    }

    /// Map `lblock` without writing the inode back; callers that allocate
    /// must store the inode afterwards.
    pub(super) fn get_block(&self, ip: &mut InodeData, lblock: u64, alloc: bool) -> Result<Option<u32>> {
        let offsets = block_to_path(lblock)?;
        let chain = self.get_branch(private(ip), &offsets);
        let last = chain[chain.len() - 1];
        if chain.len() == offsets.len() && last.key != 0 {
            return Ok(Some(last.key));
        }
        if !alloc {
            return Ok(None);
        }
        let k = chain.len() - 1;
        self.alloc_branch(ip, lblock, &offsets, &chain, k).map(Some)
    }

    pub(super) fn truncate_blocks(&self, ip: &mut InodeData) -> Result<()> {
        let keeps_blocks = match ip.kind {
            InodeKind::Device => true,
            // fast symlinks keep their target in i_block
            InodeKind::Symlink => inode::sectors(&private(ip).raw) == 0,
            _ => false,
        };

        if !keeps_blocks {
            let roots: Vec<u32> = (0..N_BLOCKS).map(|i| inode::block(&private(ip).raw, i)).collect();
            let mut freer = RunFreer::new(self);
            for &b in roots[..NDIR_BLOCKS].iter().filter(|&&b| b != 0) {
                freer.release(b);
            }

            let mut stack: Vec<Frame> = [(TIND_BLOCK, 3), (DIND_BLOCK, 2), (IND_BLOCK, 1)]
                .iter()
                .filter(|&&(slot, _)| roots[slot] != 0)
                .map(|&(slot, depth)| Frame::Enter {
                    block: roots[slot],
                    depth,
                })
                .collect();
            while let Some(frame) = stack.pop() {
                match frame {
                    Frame::Free(block) => freer.release(block),
                    Frame::Enter { block, depth } => {
                        let children: Vec<u32> = {
                            let buf = self.cache.acquire(self.dev, block);
                            (0..ADDR_PER_BLOCK).map(|i| entry(&buf, i)).filter(|&b| b != 0).collect()
                        };
                        stack.push(Frame::Free(block));
                        if depth == 1 {
                            for child in children {
                                freer.release(child);
                            }
                        } else {
                            stack.extend(children.iter().rev().map(|&child| Frame::Enter {
                                block: child,
                                depth: depth - 1,
                            }));
                        }
                    }
                }
            }
            freer.flush();
            log::debug!("{}: inode {} truncated, {} blocks freed", self.dev, ip.inum, freer.freed);

            let p = private_mut(ip);
            for i in 0..N_BLOCKS {
                inode::set_block(&mut p.raw, i, 0);
            }
            inode::set_sectors(&mut p.raw, 0);
        }

        private_mut(ip).last_alloc = None;
        let now = self.now();
        ip.size = 0;
        ip.mtime = now;
        ip.ctime = now;
        self.store_inode(ip)
    }

    pub(super) fn read_data(&self, ip: &mut InodeData, off: u64, dst: &mut [u8]) -> Result<usize> {
        if off >= ip.size {
            return Ok(0);
        }
        let n = (dst.len() as u64).min(ip.size - off) as usize;
        let mut done = 0;
        while done < n {
            let pos = off + done as u64;
            let boff = (pos % BLOCK_SIZE as u64) as usize;
            let m = (n - done).min(BLOCK_SIZE - boff);
            match self.get_block(ip, pos / BLOCK_SIZE as u64, false)? {
                Some(b) => {
                    let buf = self.cache.acquire(self.dev, b);
                    dst[done..done + m].copy_from_slice(&buf[boff..boff + m]);
                }
                // hole
                None => dst[done..done + m].fill(0),
            }
            done += m;
        }
        Ok(n)
    }

    pub(super) fn write_data(&self, ip: &mut InodeData, off: u64, src: &[u8]) -> Result<usize> {
        match off.checked_add(src.len() as u64) {
            Some(end) if end <= self.max_file_size() => {}
            _ => return Err(FsError::FileTooLarge),
        }

        let mut done = 0;
        let mut failure = None;
        while done < src.len() {
            let pos = off + done as u64;
            let boff = (pos % BLOCK_SIZE as u64) as usize;
            let m = (src.len() - done).min(BLOCK_SIZE - boff);
            let block = match self.get_block(ip, pos / BLOCK_SIZE as u64, true) {
                Ok(Some(b)) => b,
                Ok(None) => fatal!("{}: inode {} block {} not allocated", self.dev, ip.inum, pos / BLOCK_SIZE as u64),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            let mut buf = self.cache.acquire(self.dev, block);
            buf[boff..boff + m].copy_from_slice(&src[done..done + m]);
            buf.flush();
            done += m;
        }

        if done > 0 {
            let now = self.now();
            ip.size = ip.size.max(off + done as u64);
            ip.mtime = now;
            ip.ctime = now;
        }
        self.store_inode(ip)?;
        match failure {
            Some(err) if done == 0 => Err(err),
            _ => Ok(done),
        }
    }
}
