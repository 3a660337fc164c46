//! The Simple backend: fixed layout, fixed-size directory entries, and
//! every write routed through the write-ahead log.
//!
//! Methods that modify blocks must run inside a transaction on this
//! filesystem's log; the log halts on a write outside one.

use byteorder::{ByteOrder, LittleEndian};
use std::io::Cursor;
use std::sync::Arc;

use crate::blockdev::{DeviceId, BLOCK_SIZE};
use crate::block_bitmap::Bitmap;
use crate::cache::BlockCache;
use crate::config::LogConfig;
use crate::error::{FsError, Result};
use crate::fatal;
use crate::layout::{
    Dinode, Dirent, Superblock, BPB, DINODE_SIZE, DIRENT_SIZE, MAXFILE, MAXLINK, MAXSIZE, NADDRS,
    NDIRECT, NINDIRECT, ROOTINO, SUPERBLOCK_NO, T_DEVICE, T_DIR, T_FILE,
};
use crate::modules::{Log, Transaction};
use crate::vfs::{DirEntry, FsKind, FsOps, FsStats, InodeData, InodeKind, InodeOps, InodePrivate};

/// A mounted Simple filesystem
pub struct SimpleFs {
    dev: DeviceId,
    cache: Arc<BlockCache>,
    log: Arc<Log>,
    sb: Superblock,
}

fn kind_from_disk(tag: i16) -> InodeKind {
    match tag {
        T_DIR => InodeKind::Dir,
        T_FILE => InodeKind::File,
        T_DEVICE => InodeKind::Device,
        0 => InodeKind::Free,
        other => fatal!("simplefs: unknown inode type {}", other),
    }
}

fn kind_to_disk(kind: InodeKind) -> i16 {
    match kind {
        InodeKind::Dir => T_DIR,
        InodeKind::File => T_FILE,
        InodeKind::Device => T_DEVICE,
        InodeKind::Free => 0,
        InodeKind::Symlink => fatal!("simplefs: symbolic links are not representable"),
    }
}

fn addrs_mut(ip: &mut InodeData) -> &mut [u32; NADDRS] {
    match &mut ip.private {
        InodePrivate::Simple { addrs } => addrs,
        _ => fatal!("simplefs: inode {} has no block list", ip.inum),
    }
}

impl SimpleFs {
    /// Read the superblock of `dev`, check it, and replay its log.
    pub fn open(dev: DeviceId, cache: Arc<BlockCache>, config: &LogConfig) -> Result<Self> {
        let device_blocks = cache.devices().get(dev)?.block_count();
        let sb = {
            let buf = cache.acquire(dev, SUPERBLOCK_NO);
            Superblock::read_from(&mut Cursor::new(&buf[..Superblock::SIZE]))?
        };
        sb.validate(device_blocks)?;
        if (sb.nlog as usize) <= config.max_op_blocks {
            return Err(FsError::InvalidSuperblock(format!(
                "log of {} blocks cannot hold one operation of {}",
                sb.nlog, config.max_op_blocks
            )));
        }

        let log = Arc::new(Log::open(dev, cache.clone(), sb.logstart, sb.nlog, config));
        log::info!(
            "{}: simple filesystem, {} blocks, {} inodes, log {}+{}",
            dev,
            sb.size,
            sb.ninodes,
            sb.logstart,
            sb.nlog
        );
        Ok(Self { dev, cache, log, sb })
    }

    /// Geometry read at mount
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// The filesystem's write-ahead log
    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    /// Allocate a block: first clear bit of the bitmap. The block is zeroed.
    fn balloc(&self) -> Result<u32> {
        for base in (0..self.sb.size).step_by(BPB as usize) {
            let mut bp = self.cache.acquire(self.dev, self.sb.bitmap_block(base));
            let limit = (self.sb.size - base).min(BPB) as usize;
            let claimed = Bitmap::new(&mut bp, limit).claim_run(0, 1);
            if let Some((bit, _)) = claimed {
                self.log.log_write(&bp);
                drop(bp);
                let b = base + bit as u32;
                self.bzero(b);
                return Ok(b);
            }
        }
        log::warn!("{}: out of blocks", self.dev);
        Err(FsError::NoSpace)
    }

    fn bzero(&self, b: u32) {
        let mut bp = self.cache.acquire(self.dev, b);
        bp.fill(0);
        self.log.log_write(&bp);
    }

    fn bfree(&self, b: u32) {
        if b < self.sb.data_start() || b >= self.sb.size {
            fatal!("{}: freeing metadata or out-of-range block {}", self.dev, b);
        }
        let mut bp = self.cache.acquire(self.dev, self.sb.bitmap_block(b));
        let bit = (b % BPB) as usize;
        if !Bitmap::new(&mut bp, BPB as usize).test_and_clear(bit) {
            fatal!("{}: freeing free block {}", self.dev, b);
        }
        self.log.log_write(&bp);
    }

    /// Return the block in `slot`, allocating it first if empty.
    fn ensure(&self, slot: &mut u32, alloc: bool) -> Result<Option<u32>> {
        if *slot == 0 {
            if !alloc {
                return Ok(None);
            }
            *slot = self.balloc()?;
        }
        Ok(Some(*slot))
    }

    /// Entry `idx` of indirect block `block`, allocating it first if empty.
    fn indirect(&self, block: u32, idx: usize, alloc: bool) -> Result<Option<u32>> {
        let mut bp = self.cache.acquire(self.dev, block);
        let addr = LittleEndian::read_u32(&bp[idx * 4..idx * 4 + 4]);
        if addr != 0 {
            return Ok(Some(addr));
        }
        if !alloc {
            return Ok(None);
        }
        let addr = self.balloc()?;
        LittleEndian::write_u32(&mut bp[idx * 4..idx * 4 + 4], addr);
        self.log.log_write(&bp);
        Ok(Some(addr))
    }

    fn bmap(&self, ip: &mut InodeData, lblock: u64, alloc: bool) -> Result<Option<u32>> {
        if lblock >= MAXFILE {
            return Err(FsError::FileTooLarge);
        }
        let addrs = addrs_mut(ip);
        let mut bn = lblock as usize;

        if bn < NDIRECT {
            return self.ensure(&mut addrs[bn], alloc);
        }
        bn -= NDIRECT;

        if bn < NINDIRECT {
            return match self.ensure(&mut addrs[NDIRECT], alloc)? {
                Some(ind) => self.indirect(ind, bn, alloc),
                None => Ok(None),
            };
        }
        bn -= NINDIRECT;

        let dind = match self.ensure(&mut addrs[NDIRECT + 1], alloc)? {
            Some(b) => b,
            None => return Ok(None),
        };
        match self.indirect(dind, bn / NINDIRECT, alloc)? {
            Some(ind) => self.indirect(ind, bn % NINDIRECT, alloc),
            None => Ok(None),
        }
    }

    /// Free an indirect block and, `depth` levels down, everything under it.
    fn free_indirect(&self, block: u32, depth: u32) {
        let entries: Vec<u32> = {
            let bp = self.cache.acquire(self.dev, block);
            (0..NINDIRECT)
                .map(|i| LittleEndian::read_u32(&bp[i * 4..i * 4 + 4]))
                .filter(|&a| a != 0)
                .collect()
        };
        for addr in entries {
            if depth > 1 {
                self.free_indirect(addr, depth - 1);
            } else {
                self.bfree(addr);
            }
        }
        self.bfree(block);
    }

    /// Locate `name` in `dp`: byte offset of its entry and inode number.
    fn find_entry(&self, dp: &mut InodeData, name: &str) -> Result<Option<(u64, u32)>> {
        if dp.kind != InodeKind::Dir {
            fatal!("{}: lookup in non-directory inode {}", self.dev, dp.inum);
        }
        let mut raw = [0u8; DIRENT_SIZE];
        let mut off = 0;
        while off < dp.size {
            if self.read(dp, off, &mut raw)? != DIRENT_SIZE {
                fatal!("{}: short directory read in inode {}", self.dev, dp.inum);
            }
            let de = Dirent::from_bytes(&raw);
            if de.inum != 0 && de.is_named(name) {
                return Ok(Some((off, de.inum as u32)));
            }
            off += DIRENT_SIZE as u64;
        }
        Ok(None)
    }

    fn entries(&self, dp: &mut InodeData) -> Result<Vec<(u64, Dirent)>> {
        let mut raw = [0u8; DIRENT_SIZE];
        let mut out = Vec::new();
        let mut off = 0;
        while off < dp.size {
            if self.read(dp, off, &mut raw)? != DIRENT_SIZE {
                fatal!("{}: short directory read in inode {}", self.dev, dp.inum);
            }
            out.push((off, Dirent::from_bytes(&raw)));
            off += DIRENT_SIZE as u64;
        }
        Ok(out)
    }
}

impl FsOps for SimpleFs {
    fn kind(&self) -> FsKind {
        FsKind::Simple
    }

    fn dev(&self) -> DeviceId {
        self.dev
    }

    fn root_inum(&self) -> u32 {
        ROOTINO
    }

    fn stats(&self) -> Result<FsStats> {
        let mut free_blocks = 0u64;
        for base in (0..self.sb.size).step_by(BPB as usize) {
            let mut bp = self.cache.acquire(self.dev, self.sb.bitmap_block(base));
            let limit = (self.sb.size - base).min(BPB) as usize;
            free_blocks += Bitmap::new(&mut bp, limit).count_free() as u64;
        }

        let mut free_inodes = 0u64;
        for inum in 1..self.sb.ninodes {
            let bp = self.cache.acquire(self.dev, self.sb.inode_block(inum));
            let off = Dinode::offset(inum);
            if LittleEndian::read_i16(&bp[off..off + 2]) == 0 {
                free_inodes += 1;
            }
        }

        Ok(FsStats {
            kind: FsKind::Simple,
            block_size: BLOCK_SIZE as u32,
            total_blocks: self.sb.size as u64,
            free_blocks,
            total_inodes: self.sb.ninodes as u64,
            free_inodes,
            log_blocks: Some(self.sb.nlog),
        })
    }

    fn alloc_block(&self, _goal: u32) -> Result<u32> {
        self.balloc()
    }

    fn free_block(&self, block: u32) {
        self.bfree(block)
    }

    fn alloc_inode(&self, kind: InodeKind, _parent: u32) -> Result<u32> {
        for inum in 1..self.sb.ninodes {
            let mut bp = self.cache.acquire(self.dev, self.sb.inode_block(inum));
            let off = Dinode::offset(inum);
            if LittleEndian::read_i16(&bp[off..off + 2]) != 0 {
                continue;
            }
            let dinode = Dinode {
                kind: kind_to_disk(kind),
                ..Default::default()
            };
            {
                let mut slot = &mut bp[off..off + DINODE_SIZE];
                dinode.write_to(&mut slot)?;
            }
            self.log.log_write(&bp);
            log::debug!("{}: allocated inode {} ({:?})", self.dev, inum, kind);
            return Ok(inum);
        }
        log::warn!("{}: out of inodes", self.dev);
        Err(FsError::NoInodes)
    }

    fn free_inode(&self, inum: u32, _kind: InodeKind) {
        let mut bp = self.cache.acquire(self.dev, self.sb.inode_block(inum));
        let off = Dinode::offset(inum);
        bp[off..off + DINODE_SIZE].fill(0);
        self.log.log_write(&bp);
    }

    fn max_links(&self) -> u16 {
        MAXLINK
    }

    fn begin_op(&self) -> Option<Transaction> {
        Some(self.log.begin_op())
    }

    fn unmount(&self) -> Result<()> {
        if self.log.stats().outstanding > 0 {
            return Err(FsError::Busy);
        }
        log::info!("{}: simple filesystem unmounted", self.dev);
        Ok(())
    }
}

impl InodeOps for SimpleFs {
    fn read_inode(&self, ip: &mut InodeData) -> Result<()> {
        let bp = self.cache.acquire(self.dev, self.sb.inode_block(ip.inum));
        let off = Dinode::offset(ip.inum);
        let dinode = Dinode::read_from(&mut Cursor::new(&bp[off..off + DINODE_SIZE]))?;

        ip.kind = kind_from_disk(dinode.kind);
        ip.major = dinode.major as u16;
        ip.minor = dinode.minor as u16;
        ip.nlink = dinode.nlink.max(0) as u16;
        ip.size = dinode.size as u64;
        ip.private = InodePrivate::Simple {
            addrs: dinode.addrs,
        };
        Ok(())
    }

    fn update(&self, ip: &mut InodeData) -> Result<()> {
        let dinode = Dinode {
            kind: kind_to_disk(ip.kind),
            major: ip.major as i16,
            minor: ip.minor as i16,
            nlink: ip.nlink as i16,
            size: ip.size as u32,
            addrs: *addrs_mut(ip),
        };
        let mut bp = self.cache.acquire(self.dev, self.sb.inode_block(ip.inum));
        let off = Dinode::offset(ip.inum);
        {
            let mut slot = &mut bp[off..off + DINODE_SIZE];
            dinode.write_to(&mut slot)?;
        }
        self.log.log_write(&bp);
        Ok(())
    }

    fn truncate(&self, ip: &mut InodeData) -> Result<()> {
        let addrs = *addrs_mut(ip);
        for &addr in addrs[..NDIRECT].iter().filter(|&&a| a != 0) {
            self.bfree(addr);
        }
        if addrs[NDIRECT] != 0 {
            self.free_indirect(addrs[NDIRECT], 1);
        }
        if addrs[NDIRECT + 1] != 0 {
            self.free_indirect(addrs[NDIRECT + 1], 2);
        }

        *addrs_mut(ip) = [0; NADDRS];
        ip.size = 0;
        self.update(ip)
    }

    fn map_block(&self, ip: &mut InodeData, lblock: u64, alloc: bool) -> Result<Option<u32>> {
        let before = *addrs_mut(ip);
        let block = self.bmap(ip, lblock, alloc)?;
        if *addrs_mut(ip) != before {
            self.update(ip)?;
        }
        Ok(block)
    }

    fn read(&self, ip: &mut InodeData, off: u64, dst: &mut [u8]) -> Result<usize> {
        if off > ip.size {
            return Ok(0);
        }
        let n = dst.len().min((ip.size - off) as usize);
        let mut done = 0;
        while done < n {
            let pos = off + done as u64;
            let within = (pos % BLOCK_SIZE as u64) as usize;
            let m = (n - done).min(BLOCK_SIZE - within);
            match self.bmap(ip, pos / BLOCK_SIZE as u64, false)? {
                Some(b) => {
                    let bp = self.cache.acquire(self.dev, b);
                    dst[done..done + m].copy_from_slice(&bp[within..within + m]);
                }
                None => dst[done..done + m].fill(0),
            }
            done += m;
        }
        Ok(n)
    }

    fn write(&self, ip: &mut InodeData, off: u64, src: &[u8]) -> Result<usize> {
        if off > ip.size {
            return Err(FsError::InvalidArgument(format!(
                "write at {} past end of file ({} bytes)",
                off, ip.size
            )));
        }
        if off + src.len() as u64 > MAXSIZE {
            return Err(FsError::FileTooLarge);
        }

        let mut done = 0;
        let mut failure = None;
        while done < src.len() {
            let pos = off + done as u64;
            let within = (pos % BLOCK_SIZE as u64) as usize;
            let m = (src.len() - done).min(BLOCK_SIZE - within);
            let b = match self.bmap(ip, pos / BLOCK_SIZE as u64, true) {
                Ok(Some(b)) => b,
                Ok(None) => fatal!("{}: bmap allocation returned nothing", self.dev),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let mut bp = self.cache.acquire(self.dev, b);
            bp[within..within + m].copy_from_slice(&src[done..done + m]);
            self.log.log_write(&bp);
            done += m;
        }

        if off + done as u64 > ip.size {
            ip.size = off + done as u64;
        }
        // bmap may have filled address slots even when nothing was written
        self.update(ip)?;

        match failure {
            Some(e) if done == 0 => Err(e),
            _ => Ok(done),
        }
    }

    fn lookup(&self, dp: &mut InodeData, name: &str) -> Result<Option<u32>> {
        Ok(self.find_entry(dp, name)?.map(|(_, inum)| inum))
    }

    fn link(&self, dp: &mut InodeData, name: &str, inum: u32, _kind: InodeKind) -> Result<()> {
        let inum = u16::try_from(inum)
            .map_err(|_| FsError::InvalidArgument(format!("inode {} does not fit a directory entry", inum)))?;
        let entry = Dirent::new(inum, name)?;
        if self.find_entry(dp, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let off = self
            .entries(dp)?
            .into_iter()
            .find(|(_, de)| de.inum == 0)
            .map(|(off, _)| off)
            .unwrap_or(dp.size);
        if self.write(dp, off, &entry.to_bytes())? != DIRENT_SIZE {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    fn unlink(&self, dp: &mut InodeData, name: &str) -> Result<()> {
        let (off, _) = self.find_entry(dp, name)?.ok_or(FsError::NotFound)?;
        if self.write(dp, off, &[0u8; DIRENT_SIZE])? != DIRENT_SIZE {
            fatal!("{}: short write clearing directory entry", self.dev);
        }
        Ok(())
    }

    fn init_dir(&self, ip: &mut InodeData, parent: u32) -> Result<()> {
        let inum = ip.inum;
        self.link(ip, ".", inum, InodeKind::Dir)?;
        self.link(ip, "..", parent, InodeKind::Dir)
    }

    fn is_dir_empty(&self, dp: &mut InodeData) -> Result<bool> {
        Ok(self
            .entries(dp)?
            .iter()
            .skip(2)
            .all(|(_, de)| de.inum == 0))
    }

    fn read_dir(&self, dp: &mut InodeData) -> Result<Vec<DirEntry>> {
        Ok(self
            .entries(dp)?
            .into_iter()
            .filter(|(_, de)| de.inum != 0)
            .map(|(_, de)| DirEntry {
                inum: de.inum as u32,
                name: String::from_utf8_lossy(de.name_bytes()).into_owned(),
                kind: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::{BlockDevice, DeviceTable, MemBlockDevice};
    use crate::config::CacheConfig;
    use crate::format::{format_simple, SimpleGeometry};

    const DEV: DeviceId = DeviceId(1);

    fn mount() -> (Arc<MemBlockDevice>, SimpleFs) {
        let device = Arc::new(MemBlockDevice::new(2048));
        format_simple(device.as_ref(), &SimpleGeometry::default()).unwrap();
        let devices = Arc::new(DeviceTable::new());
        devices.register(DEV, device.clone()).unwrap();
        let cache = Arc::new(BlockCache::new(devices, &CacheConfig::default()));
        let fs = SimpleFs::open(DEV, cache, &LogConfig::default()).unwrap();
        (device, fs)
    }

    fn load(fs: &SimpleFs, inum: u32) -> InodeData {
        let mut ip = InodeData {
            inum,
            ..Default::default()
        };
        fs.read_inode(&mut ip).unwrap();
        ip
    }

    #[test]
    fn test_block_allocation_is_unique_until_freed() {
        let (_device, fs) = mount();
        let _tx = fs.begin_op();

        let a = fs.alloc_block(0).unwrap();
        let b = fs.alloc_block(0).unwrap();
        assert_ne!(a, b);
        assert!(a >= fs.superblock().data_start());

        fs.free_block(a);
        assert_eq!(fs.alloc_block(0).unwrap(), a);
    }

    #[test]
    fn test_bmap_is_stable_and_reaches_double_indirect() {
        let (_device, fs) = mount();
        let tx = fs.begin_op();
        let inum = fs.alloc_inode(InodeKind::File, ROOTINO).unwrap();
        let mut ip = load(&fs, inum);

        let lblock = (NDIRECT + NINDIRECT + 5) as u64;
        let first = fs.map_block(&mut ip, lblock, true).unwrap().unwrap();
        assert_eq!(fs.map_block(&mut ip, lblock, false).unwrap(), Some(first));
        assert_eq!(fs.map_block(&mut ip, lblock, true).unwrap(), Some(first));
        assert_eq!(fs.map_block(&mut ip, 0, false).unwrap(), None);
        assert_ne!(addrs_mut(&mut ip)[NDIRECT + 1], 0);
        assert!(matches!(
            fs.map_block(&mut ip, MAXFILE, true),
            Err(FsError::FileTooLarge)
        ));
        drop(tx);

        // the slots survived the commit
        let mut reloaded = load(&fs, inum);
        assert_eq!(fs.map_block(&mut reloaded, lblock, false).unwrap(), Some(first));
    }

    #[test]
    fn test_size_stays_within_the_dinode_field() {
        let (_device, fs) = mount();
        let _tx = fs.begin_op();
        let inum = fs.alloc_inode(InodeKind::File, ROOTINO).unwrap();
        let mut ip = load(&fs, inum);
        assert!(MAXSIZE <= u32::MAX as u64);

        // pretend the file already reaches the limit
        let end = MAXSIZE - 10;
        ip.size = end;
        assert!(matches!(fs.write(&mut ip, end, &[1u8; 20]), Err(FsError::FileTooLarge)));
        assert_eq!(ip.size, end);

        assert_eq!(fs.write(&mut ip, end, &[1u8; 10]).unwrap(), 10);
        assert_eq!(ip.size, MAXSIZE);
        assert_eq!(load(&fs, inum).size, MAXSIZE);
        assert!(matches!(fs.write(&mut ip, MAXSIZE, &[1u8]), Err(FsError::FileTooLarge)));
    }

    #[test]
    fn test_directory_round_trip() {
        let (_device, fs) = mount();
        let _tx = fs.begin_op();
        let mut root = load(&fs, ROOTINO);

        fs.link(&mut root, "notes", 9, InodeKind::File).unwrap();
        assert_eq!(fs.lookup(&mut root, "notes").unwrap(), Some(9));
        assert!(matches!(
            fs.link(&mut root, "notes", 10, InodeKind::File),
            Err(FsError::AlreadyExists)
        ));
        assert!(!fs.is_dir_empty(&mut root).unwrap());

        fs.unlink(&mut root, "notes").unwrap();
        assert_eq!(fs.lookup(&mut root, "notes").unwrap(), None);
        assert!(fs.is_dir_empty(&mut root).unwrap());

        // the freed slot is reused before the directory grows
        let size = root.size;
        fs.link(&mut root, "again", 11, InodeKind::File).unwrap();
        assert_eq!(root.size, size);
    }

    #[test]
    fn test_truncate_frees_every_block() {
        let (_device, fs) = mount();
        let free_before = fs.stats().unwrap().free_blocks;

        let inum = {
            let _tx = fs.begin_op();
            fs.alloc_inode(InodeKind::File, ROOTINO).unwrap()
        };
        let mut ip = load(&fs, inum);
        for lblock in [0u64, 20, (NDIRECT + NINDIRECT + 1) as u64] {
            let _tx = fs.begin_op();
            fs.map_block(&mut ip, lblock, true).unwrap();
        }
        // three data blocks, one indirect, a doubly-indirect and its child
        assert_eq!(fs.stats().unwrap().free_blocks, free_before - 6);

        {
            let _tx = fs.begin_op();
            fs.truncate(&mut ip).unwrap();
        }
        assert_eq!(fs.stats().unwrap().free_blocks, free_before);
        assert_eq!(load(&fs, inum).size, 0);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let device = Arc::new(MemBlockDevice::new(64));
        device.write_block(1, &[0xFF; BLOCK_SIZE]).unwrap();
        let devices = Arc::new(DeviceTable::new());
        devices.register(DEV, device).unwrap();
        let cache = Arc::new(BlockCache::new(devices, &CacheConfig::default()));

        assert!(matches!(
            SimpleFs::open(DEV, cache, &LogConfig::default()),
            Err(FsError::InvalidSuperblock(_))
        ));
    }
}
