//! Filesystem-independent layer: the inode table, the mount table, path
//! resolution, and the namespace operations built on them.
//!
//! Everything here reaches a backend only through the [`FsOps`] and
//! [`InodeOps`] tables. Namespace operations open one operation on every
//! logged filesystem before touching anything, so all their writes land in
//! the same transactions and every inode reference they take is released
//! before those transactions end.

mod inode;
mod mount;
mod ops;
mod path;

use serde::Serialize;
use std::sync::Arc;

use crate::blockdev::{BlockDevice, DeviceId, DeviceTable, BLOCK_SIZE};
use crate::cache::BlockCache;
use crate::clock::{Clock, SystemClock};
use crate::config::StorageConfig;
use crate::error::{FsError, Result};
use crate::ext2::Ext2Fs;
use crate::fatal;
use crate::modules::Transaction;
use crate::simplefs::SimpleFs;

pub use self::inode::{InodeCache, InodeGuard, InodeRef};
pub use self::mount::{MountEntry, MountInfo, MountTable};
pub use self::ops::{
    DirEntry, FileSystem, FsKind, FsOps, FsStats, InodeData, InodeKind, InodeOps, InodePrivate,
};
pub use self::path::skip_elem;

use self::path::Resolver;

/// Metadata of one inode
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub dev: DeviceId,
    pub inum: u32,
    pub kind: InodeKind,
    pub nlink: u16,
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub uid: u32,
    pub gid: u32,
}

/// One open operation on every logged filesystem, ended on drop
pub struct OpGuard {
    txs: Vec<Transaction>,
}

impl OpGuard {
    /// Number of logs this operation is part of
    pub fn logs(&self) -> usize {
        self.txs.len()
    }
}

/// The storage stack: devices, buffer cache, inode table and mounts
pub struct Vfs {
    config: StorageConfig,
    devices: Arc<DeviceTable>,
    cache: Arc<BlockCache>,
    inodes: Arc<InodeCache>,
    mounts: MountTable,
    clock: Arc<dyn Clock>,
}

impl Vfs {
    /// Build the stack with the wall clock
    pub fn new(config: StorageConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: StorageConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let devices = Arc::new(DeviceTable::new());
        let cache = Arc::new(BlockCache::new(devices.clone(), &config.cache));
        Ok(Self {
            inodes: Arc::new(InodeCache::new(config.inode_cache_size)),
            mounts: MountTable::new(config.max_mounts),
            config,
            devices,
            cache,
            clock,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn inodes(&self) -> &Arc<InodeCache> {
        &self.inodes
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    pub fn register_device(&self, dev: DeviceId, device: Arc<dyn BlockDevice>) -> Result<()> {
        Ok(self.devices.register(dev, device)?)
    }

    /// Read the superblock of `dev` as a `kind` filesystem.
    pub fn open_fs(&self, dev: DeviceId, kind: FsKind) -> Result<Arc<dyn FileSystem>> {
        Ok(match kind {
            FsKind::Simple => Arc::new(SimpleFs::open(dev, self.cache.clone(), &self.config.log)?),
            FsKind::Ext2 => Arc::new(Ext2Fs::mount(dev, self.cache.clone(), self.clock.clone())?),
        })
    }

    fn attach(&self, dev: DeviceId, kind: FsKind, mountpoint: Option<InodeRef>) -> Result<()> {
        if self.mounts.fs(dev).is_some() {
            return Err(FsError::Busy);
        }
        let fs = self.open_fs(dev, kind)?;
        let attached = self.inodes.iget(&fs, fs.root_inum()).and_then(|root| {
            if root.lock()?.kind != InodeKind::Dir {
                return Err(FsError::InvalidSuperblock(format!("{}: root inode is not a directory", dev)));
            }
            self.mounts.add(MountEntry {
                dev,
                mountpoint,
                root,
                fs: fs.clone(),
            })
        });
        if let Err(err) = attached {
            if let Err(unmount_err) = fs.unmount() {
                log::warn!("{}: releasing failed mount: {}", dev, unmount_err);
            }
            self.cache.purge_device(dev);
            return Err(err);
        }
        Ok(())
    }

    /// Mount `dev` as the root filesystem.
    pub fn mount_root(&self, dev: DeviceId, kind: FsKind) -> Result<()> {
        if self.mounts.root().is_some() {
            return Err(FsError::Busy);
        }
        self.attach(dev, kind, None)
    }

    /// Mount `dev` on the directory at `path`.
    pub fn mount(&self, dev: DeviceId, kind: FsKind, path: &str) -> Result<()> {
        let mountpoint = {
            let _op = self.begin_op();
            let mp = self.namei(path)?;
            if mp.lock()?.kind != InodeKind::Dir {
                return Err(FsError::NotADirectory);
            }
            // a filesystem root (including one already mounted here)
            if mp.inum() == mp.fs().root_inum() {
                return Err(FsError::Busy);
            }
            mp
        };
        self.attach(dev, kind, Some(mountpoint))
    }

    /// Unmount the filesystem whose root is at `path`. Fails with `Busy`
    /// while any inode of it is still referenced.
    pub fn unmount(&self, path: &str) -> Result<()> {
        let dev = {
            let _op = self.begin_op();
            let root = self.namei(path)?;
            if root.inum() != root.fs().root_inum() {
                return Err(FsError::InvalidArgument(format!("{} is not a mount point", path)));
            }
            if self.mounts.mount_point_of(root.dev()).is_none() {
                // the root mount stays
                return Err(FsError::Busy);
            }
            root.dev()
        };

        // the mount entry's own root reference is the only one allowed
        if self.inodes.refs_on(dev) > 1 {
            return Err(FsError::Busy);
        }
        let entry = match self.mounts.remove(dev) {
            Some(entry) => entry,
            None => return Err(FsError::NotFound),
        };
        let fs = entry.fs.clone();
        drop(entry);
        fs.unmount()?;
        self.cache.purge_device(dev);
        log::info!("unmounted {}", dev);
        Ok(())
    }

    /// Unmount everything, most recent mount first.
    pub fn shutdown(&self) -> Result<()> {
        for entry in self.mounts.drain() {
            let dev = entry.dev;
            let fs = entry.fs.clone();
            drop(entry);
            let leaked = self.inodes.refs_on(dev);
            if leaked > 0 {
                log::warn!("{}: {} inode references outlive the mount", dev, leaked);
            }
            fs.unmount()?;
            self.cache.purge_device(dev);
        }
        Ok(())
    }

    /// Open an operation on every logged filesystem, in device order.
    pub fn begin_op(&self) -> OpGuard {
        OpGuard {
            txs: self
                .mounts
                .filesystems()
                .iter()
                .filter_map(|fs| fs.begin_op())
                .collect(),
        }
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver {
            inodes: &self.inodes,
            mounts: &self.mounts,
        }
    }

    /// Inode at `path`. Call inside an operation. A reference kept past
    /// the operation goes back through [`Vfs::close`].
    pub fn namei(&self, path: &str) -> Result<InodeRef> {
        Ok(self.resolver().namex(path, false)?.0)
    }

    /// Directory holding the last element of `path`, and that element.
    pub fn nameiparent<'p>(&self, path: &'p str) -> Result<(InodeRef, &'p str)> {
        self.resolver().namex(path, true)
    }

    fn now(&self) -> u32 {
        self.clock.now()
    }

    /// Release a reference held outside an operation. Dropping the last
    /// reference to an unlinked inode frees it, which needs a transaction.
    pub fn close(&self, ip: InodeRef) {
        let _op = self.begin_op();
        drop(ip);
    }

    /// Create `path` as a `kind` inode. Creating a regular file that exists
    /// returns the existing file.
    pub fn create(&self, path: &str, kind: InodeKind) -> Result<Stat> {
        let _op = self.begin_op();
        let ip = self.create_in_op(path, kind)?;
        let inode = ip.lock()?;
        Ok(stat_of(&ip, &inode))
    }

    fn create_in_op(&self, path: &str, kind: InodeKind) -> Result<InodeRef> {
        if kind == InodeKind::Free {
            return Err(FsError::InvalidArgument("cannot create a free inode".into()));
        }
        let (dp, name) = self.nameiparent(path)?;
        if name == "." || name == ".." {
            return Err(FsError::AlreadyExists);
        }
        let mut dir = dp.lock()?;

        if let Some(inum) = dir.lookup(name)? {
            drop(dir);
            let ip = self.inodes.iget(dp.fs(), inum)?;
            let existing = ip.lock()?.kind;
            if kind == InodeKind::File && existing == InodeKind::File {
                return Ok(ip);
            }
            return Err(FsError::AlreadyExists);
        }

        let fs = dp.fs();
        if kind == InodeKind::Dir && dir.nlink >= fs.max_links() {
            return Err(FsError::TooManyLinks);
        }
        let inum = fs.alloc_inode(kind, dp.inum())?;
        let ip = self.inodes.iget(fs, inum)?;
        let now = self.now();
        {
            let mut inode = ip.lock()?;
            inode.nlink = 1;
            inode.major = 0;
            inode.minor = 0;
            inode.atime = now;
            inode.mtime = now;
            inode.ctime = now;
            inode.update()?;

            if kind == InodeKind::Dir {
                // the new ".." refers to the parent
                dir.nlink += 1;
                dir.update()?;
                inode.init_dir(dp.inum())?;
            }

            if let Err(err) = dir.link(name, inum, kind) {
                // the dropped reference frees the inode
                inode.nlink = 0;
                inode.update()?;
                if kind == InodeKind::Dir {
                    dir.nlink -= 1;
                    dir.update()?;
                }
                return Err(err);
            }
            dir.mtime = now;
            dir.ctime = now;
            dir.update()?;
        }
        log::debug!("created {} as {} inode {}", path, dp.dev(), inum);
        Ok(ip)
    }

    /// Create a directory
    pub fn mkdir(&self, path: &str) -> Result<()> {
        let _op = self.begin_op();
        self.create_in_op(path, InodeKind::Dir).map(drop)
    }

    /// Give the inode at `old` a second name `new` on the same filesystem.
    pub fn link(&self, old: &str, new: &str) -> Result<()> {
        let _op = self.begin_op();
        let ip = self.namei(old)?;
        let kind = {
            let mut inode = ip.lock()?;
            if inode.kind == InodeKind::Dir {
                return Err(FsError::IsADirectory);
            }
            if inode.nlink >= ip.fs().max_links() {
                return Err(FsError::TooManyLinks);
            }
            inode.nlink += 1;
            inode.ctime = self.now();
            inode.update()?;
            inode.kind
        };

        let linked = self.nameiparent(new).and_then(|(dp, name)| {
            if dp.dev() != ip.dev() {
                return Err(FsError::InvalidArgument(format!("{} and {} are on different devices", old, new)));
            }
            let mut dir = dp.lock()?;
            dir.link(name, ip.inum(), kind)?;
            let now = self.now();
            dir.mtime = now;
            dir.ctime = now;
            dir.update()
        });
        if let Err(err) = linked {
            let mut inode = ip.lock()?;
            inode.nlink -= 1;
            inode.update()?;
            return Err(err);
        }
        Ok(())
    }

    /// Remove the name `path`. The inode is freed once its last link and
    /// last reference are gone.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let _op = self.begin_op();
        let (dp, name) = self.nameiparent(path)?;
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument(format!("cannot unlink '{}'", name)));
        }
        let mut dir = dp.lock()?;
        let inum = dir.lookup(name)?.ok_or(FsError::NotFound)?;
        let ip = self.inodes.iget(dp.fs(), inum)?;
        if self.mounts.mounted_on(ip.dev(), ip.inum()).is_some() {
            return Err(FsError::Busy);
        }

        let mut inode = ip.lock()?;
        if inode.nlink < 1 {
            fatal!("{} inode {}: unlinking an inode with no links", ip.dev(), inum);
        }
        if inode.kind == InodeKind::Dir && !inode.is_dir_empty()? {
            return Err(FsError::DirectoryNotEmpty);
        }

        dir.unlink(name)?;
        let now = self.now();
        if inode.kind == InodeKind::Dir {
            // its ".." no longer refers to us
            dir.nlink -= 1;
        }
        dir.mtime = now;
        dir.ctime = now;
        dir.update()?;

        if inode.kind == InodeKind::Dir {
            inode.nlink = 0;
        } else {
            inode.nlink -= 1;
        }
        inode.ctime = now;
        inode.update()?;
        drop(inode);
        drop(dir);
        drop(ip);
        log::debug!("unlinked {}", path);
        Ok(())
    }

    /// Read up to `len` bytes at `off`.
    pub fn read_file(&self, path: &str, off: u64, len: usize) -> Result<Vec<u8>> {
        let _op = self.begin_op();
        let ip = self.namei(path)?;
        let mut inode = ip.lock()?;
        if inode.kind == InodeKind::Dir {
            return Err(FsError::IsADirectory);
        }
        let mut data = vec![0u8; len];
        let n = inode.read(off, &mut data)?;
        data.truncate(n);
        Ok(data)
    }

    /// Write `data` at `off`, one transaction per chunk so a large write
    /// never overflows the log. Returns the bytes written, which is short
    /// only when the filesystem fills up part way.
    pub fn write_file(&self, path: &str, off: u64, data: &[u8]) -> Result<usize> {
        // inode, bitmap and one indirect block per chunk, data blocks twice
        let per_op = self.config.log.max_op_blocks.saturating_sub(4) / 2;
        let chunk = per_op.max(1) * BLOCK_SIZE;

        let mut done = 0;
        loop {
            let n = chunk.min(data.len() - done);
            let _op = self.begin_op();
            let ip = self.namei(path)?;
            let mut inode = ip.lock()?;
            if inode.kind == InodeKind::Dir {
                return Err(FsError::IsADirectory);
            }
            let written = match inode.write(off + done as u64, &data[done..done + n]) {
                Ok(written) => written,
                Err(err) if done == 0 => return Err(err),
                Err(err) => {
                    log::warn!("{}: short write after {} bytes: {}", path, done, err);
                    0
                }
            };
            if written > 0 {
                let now = self.now();
                inode.mtime = now;
                inode.ctime = now;
                inode.update()?;
            }
            done += written;
            if written < n || done >= data.len() {
                return Ok(done);
            }
        }
    }

    /// Discard the contents of the file at `path`.
    pub fn truncate(&self, path: &str) -> Result<()> {
        let _op = self.begin_op();
        let ip = self.namei(path)?;
        let mut inode = ip.lock()?;
        if inode.kind == InodeKind::Dir {
            return Err(FsError::IsADirectory);
        }
        inode.truncate()?;
        let now = self.now();
        inode.mtime = now;
        inode.ctime = now;
        inode.update()
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let _op = self.begin_op();
        let ip = self.namei(path)?;
        let inode = ip.lock()?;
        Ok(stat_of(&ip, &inode))
    }

    /// Entries of the directory at `path`, "." and ".." included
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let _op = self.begin_op();
        let ip = self.namei(path)?;
        let mut inode = ip.lock()?;
        if inode.kind != InodeKind::Dir {
            return Err(FsError::NotADirectory);
        }
        inode.read_dir()
    }

    /// Superblock summary of the filesystem holding `path`
    pub fn statfs(&self, path: &str) -> Result<FsStats> {
        let _op = self.begin_op();
        let ip = self.namei(path)?;
        ip.fs().stats()
    }
}

fn stat_of(ip: &InodeRef, inode: &InodeData) -> Stat {
    Stat {
        dev: ip.dev(),
        inum: ip.inum(),
        kind: inode.kind,
        nlink: inode.nlink,
        size: inode.size,
        atime: inode.atime,
        mtime: inode.mtime,
        ctime: inode.ctime,
        uid: inode.uid,
        gid: inode.gid,
    }
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("mounts", &self.mounts.list())
            .field("inodes", &self.inodes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use crate::clock::FixedClock;
    use crate::format::{format_ext2, format_simple, Ext2Geometry, SimpleGeometry};

    const ROOT: DeviceId = DeviceId(1);
    const EXT: DeviceId = DeviceId(2);

    fn stack() -> (Vfs, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(1_000));
        let vfs = Vfs::with_clock(StorageConfig::default(), clock.clone()).unwrap();
        let device = Arc::new(MemBlockDevice::new(2048));
        format_simple(device.as_ref(), &SimpleGeometry::default()).unwrap();
        vfs.register_device(ROOT, device).unwrap();
        vfs.mount_root(ROOT, FsKind::Simple).unwrap();
        (vfs, clock)
    }

    fn with_ext2(vfs: &Vfs) {
        let device = Arc::new(MemBlockDevice::new(4096));
        let geometry = Ext2Geometry {
            blocks_per_group: 1024,
            inodes_per_group: 128,
            ..Default::default()
        };
        format_ext2(device.as_ref(), &geometry).unwrap();
        vfs.register_device(EXT, device).unwrap();
        vfs.mkdir("/mnt").unwrap();
        vfs.mount(EXT, FsKind::Ext2, "/mnt").unwrap();
    }

    fn names(vfs: &Vfs, path: &str) -> Vec<String> {
        let mut names: Vec<_> = vfs.read_dir(path).unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_read_and_times() {
        let (vfs, clock) = stack();
        vfs.create("/f", InodeKind::File).unwrap();
        clock.advance(5);

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(vfs.write_file("/f", 0, &data).unwrap(), data.len());
        assert_eq!(vfs.read_file("/f", 0, 10_000).unwrap(), data);
        assert_eq!(vfs.read_file("/f", 4096, 10).unwrap(), &data[4096..4106]);

        let st = vfs.stat("/f").unwrap();
        assert_eq!(st.kind, InodeKind::File);
        assert_eq!(st.size, 5000);
        assert_eq!(st.nlink, 1);
        // nothing but the root mount holds an inode afterwards
        assert_eq!(vfs.inodes().in_use(), 1);

        // ext2 keeps timestamps on disk
        with_ext2(&vfs);
        vfs.create("/mnt/t", InodeKind::File).unwrap();
        assert_eq!(vfs.stat("/mnt/t").unwrap().mtime, 1_005);
        clock.advance(5);
        vfs.write_file("/mnt/t", 0, b"tick").unwrap();
        let st = vfs.stat("/mnt/t").unwrap();
        assert_eq!(st.mtime, 1_010);
        assert_eq!(st.ctime, 1_010);
        assert_eq!(st.atime, 1_005);
    }

    #[test]
    fn test_large_write_spans_several_operations() {
        let (vfs, _) = stack();
        vfs.create("/big", InodeKind::File).unwrap();
        let data = vec![0x5au8; 11 * BLOCK_SIZE + 5000];
        assert_eq!(vfs.write_file("/big", 0, &data).unwrap(), data.len());
        assert_eq!(vfs.read_file("/big", 0, data.len()).unwrap(), data);
    }

    #[test]
    fn test_create_is_idempotent_for_files_only() {
        let (vfs, _) = stack();
        let first = vfs.create("/f", InodeKind::File).unwrap().inum;
        let again = vfs.create("/f", InodeKind::File).unwrap().inum;
        assert_eq!(first, again);

        vfs.mkdir("/d").unwrap();
        assert!(matches!(vfs.mkdir("/d"), Err(FsError::AlreadyExists)));
        assert!(matches!(vfs.create("/d", InodeKind::File), Err(FsError::AlreadyExists)));
        assert!(matches!(vfs.mkdir("/f"), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn test_path_errors() {
        let (vfs, _) = stack();
        vfs.create("/f", InodeKind::File).unwrap();
        assert!(matches!(vfs.stat("f"), Err(FsError::InvalidPath)));
        assert!(matches!(vfs.stat("/missing"), Err(FsError::NotFound)));
        assert!(matches!(vfs.stat("/f/x"), Err(FsError::NotADirectory)));
        assert!(matches!(vfs.mkdir("/"), Err(FsError::InvalidPath)));
        assert!(matches!(vfs.read_dir("/f"), Err(FsError::NotADirectory)));
        assert!(matches!(vfs.read_file("/", 0, 1), Err(FsError::IsADirectory)));
    }

    #[test]
    fn test_directories_and_unlink() {
        let (vfs, _) = stack();
        vfs.mkdir("/d").unwrap();
        vfs.create("/d/f", InodeKind::File).unwrap();
        assert_eq!(names(&vfs, "/d"), vec![".", "..", "f"]);
        assert_eq!(vfs.stat("/d/..").unwrap().inum, vfs.stat("/").unwrap().inum);

        assert!(matches!(vfs.unlink("/d"), Err(FsError::DirectoryNotEmpty)));
        assert!(matches!(vfs.unlink("/d/."), Err(FsError::InvalidArgument(_))));
        assert!(matches!(vfs.unlink("/d/nope"), Err(FsError::NotFound)));

        vfs.unlink("/d/f").unwrap();
        vfs.unlink("/d").unwrap();
        assert_eq!(names(&vfs, "/"), vec![".", ".."]);
        assert_eq!(vfs.inodes().in_use(), 1);
    }

    #[test]
    fn test_unlink_returns_space() {
        let (vfs, _) = stack();
        let before = vfs.statfs("/").unwrap();
        vfs.create("/f", InodeKind::File).unwrap();
        vfs.write_file("/f", 0, &vec![1u8; 20 * BLOCK_SIZE]).unwrap();
        assert!(vfs.statfs("/").unwrap().free_blocks < before.free_blocks);

        vfs.unlink("/f").unwrap();
        let after = vfs.statfs("/").unwrap();
        assert_eq!(after.free_blocks, before.free_blocks);
    }

    #[test]
    fn test_link_shares_the_inode() {
        let (vfs, _) = stack();
        vfs.create("/a", InodeKind::File).unwrap();
        vfs.write_file("/a", 0, b"shared").unwrap();
        vfs.link("/a", "/b").unwrap();
        assert_eq!(vfs.stat("/b").unwrap().nlink, 2);
        assert!(matches!(vfs.link("/a", "/b"), Err(FsError::AlreadyExists)));
        // the failed link left the count alone
        assert_eq!(vfs.stat("/a").unwrap().nlink, 2);

        vfs.unlink("/a").unwrap();
        assert_eq!(vfs.read_file("/b", 0, 64).unwrap(), b"shared");
        assert_eq!(vfs.stat("/b").unwrap().nlink, 1);

        vfs.mkdir("/d").unwrap();
        assert!(matches!(vfs.link("/d", "/e"), Err(FsError::IsADirectory)));
    }

    #[test]
    fn test_unlinked_file_is_freed_on_close() {
        let (vfs, _) = stack();
        let before = vfs.statfs("/").unwrap();

        // the handle-free create result outlives the unlink harmlessly
        let created = vfs.create("/f", InodeKind::File).unwrap();
        vfs.write_file("/f", 0, b"data").unwrap();
        let held = {
            let _op = vfs.begin_op();
            vfs.namei("/f").unwrap()
        };
        vfs.unlink("/f").unwrap();
        drop(created);

        // still referenced, so the blocks and the inode stay allocated
        let open = vfs.statfs("/").unwrap();
        assert_eq!(open.free_inodes, before.free_inodes - 1);
        assert_eq!(open.free_blocks, before.free_blocks - 1);
        assert_eq!(vfs.inodes().in_use(), 2);

        vfs.close(held);
        let after = vfs.statfs("/").unwrap();
        assert_eq!(after.free_inodes, before.free_inodes);
        assert_eq!(after.free_blocks, before.free_blocks);
        assert_eq!(vfs.inodes().in_use(), 1);
        assert!(matches!(vfs.stat("/f"), Err(FsError::NotFound)));
    }

    fn set_nlink(vfs: &Vfs, path: &str, nlink: u16) {
        let _op = vfs.begin_op();
        let ip = vfs.namei(path).unwrap();
        let mut inode = ip.lock().unwrap();
        inode.nlink = nlink;
        inode.update().unwrap();
    }

    #[test]
    fn test_link_count_is_bounded() {
        let (vfs, _) = stack();
        vfs.create("/f", InodeKind::File).unwrap();
        set_nlink(&vfs, "/f", i16::MAX as u16 - 1);
        vfs.link("/f", "/g").unwrap();
        assert_eq!(vfs.stat("/g").unwrap().nlink, i16::MAX as u16);
        assert!(matches!(vfs.link("/f", "/h"), Err(FsError::TooManyLinks)));
        assert!(matches!(vfs.stat("/h"), Err(FsError::NotFound)));
        assert_eq!(vfs.stat("/f").unwrap().nlink, i16::MAX as u16);

        // a new subdirectory's ".." counts against its parent
        vfs.mkdir("/d").unwrap();
        set_nlink(&vfs, "/d", i16::MAX as u16);
        assert!(matches!(vfs.mkdir("/d/sub"), Err(FsError::TooManyLinks)));
        assert_eq!(vfs.read_dir("/d").unwrap().len(), 2);

        with_ext2(&vfs);
        vfs.create("/mnt/f", InodeKind::File).unwrap();
        set_nlink(&vfs, "/mnt/f", crate::ext2::disk::LINK_MAX);
        assert!(matches!(vfs.link("/mnt/f", "/mnt/g"), Err(FsError::TooManyLinks)));
        assert_eq!(vfs.stat("/mnt/f").unwrap().nlink, crate::ext2::disk::LINK_MAX);
    }

    #[test]
    fn test_truncate() {
        let (vfs, _) = stack();
        vfs.create("/f", InodeKind::File).unwrap();
        vfs.write_file("/f", 0, &[7u8; 9000]).unwrap();
        vfs.truncate("/f").unwrap();
        assert_eq!(vfs.stat("/f").unwrap().size, 0);
        assert!(vfs.read_file("/f", 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_mount_crosses_both_ways() {
        let (vfs, _) = stack();
        with_ext2(&vfs);
        assert_eq!(vfs.mounts().len(), 2);

        let root = vfs.stat("/mnt").unwrap();
        assert_eq!(root.dev, EXT);
        assert_eq!(root.inum, crate::ext2::disk::ROOT_INO);

        vfs.create("/mnt/x", InodeKind::File).unwrap();
        vfs.write_file("/mnt/x", 0, b"on ext2").unwrap();
        assert_eq!(vfs.stat("/mnt/x").unwrap().dev, EXT);

        let up = vfs.stat("/mnt/..").unwrap();
        assert_eq!(up.dev, ROOT);
        assert_eq!(up.inum, vfs.stat("/").unwrap().inum);

        assert!(matches!(vfs.link("/mnt/x", "/y"), Err(FsError::InvalidArgument(_))));
        assert!(matches!(vfs.unlink("/mnt"), Err(FsError::Busy)));
        assert!(matches!(vfs.mount(EXT, FsKind::Ext2, "/"), Err(FsError::Busy)));
    }

    #[test]
    fn test_unmount_waits_for_references() {
        let (vfs, _) = stack();
        with_ext2(&vfs);
        vfs.create("/mnt/x", InodeKind::File).unwrap();
        vfs.write_file("/mnt/x", 0, b"kept").unwrap();

        let held = vfs.namei("/mnt/x").unwrap();
        assert!(matches!(vfs.unmount("/mnt"), Err(FsError::Busy)));
        vfs.close(held);

        assert!(matches!(vfs.unmount("/"), Err(FsError::Busy)));
        vfs.unmount("/mnt").unwrap();
        assert_eq!(vfs.mounts().len(), 1);
        assert_eq!(vfs.stat("/mnt").unwrap().dev, ROOT);
        assert!(matches!(vfs.stat("/mnt/x"), Err(FsError::NotFound)));

        vfs.mount(EXT, FsKind::Ext2, "/mnt").unwrap();
        assert_eq!(vfs.read_file("/mnt/x", 0, 16).unwrap(), b"kept");
        vfs.shutdown().unwrap();
        assert!(vfs.mounts().is_empty());
    }

    #[test]
    fn test_mount_rejects_bad_targets() {
        let (vfs, _) = stack();
        vfs.create("/f", InodeKind::File).unwrap();
        assert!(matches!(vfs.mount(EXT, FsKind::Ext2, "/f"), Err(FsError::NotADirectory)));
        assert!(matches!(vfs.mount_root(EXT, FsKind::Ext2), Err(FsError::Busy)));

        // a device holding the wrong format leaves no mount behind
        let device = Arc::new(MemBlockDevice::new(1024));
        format_simple(device.as_ref(), &SimpleGeometry::default()).unwrap();
        vfs.register_device(EXT, device).unwrap();
        vfs.mkdir("/mnt").unwrap();
        assert!(matches!(
            vfs.mount(EXT, FsKind::Ext2, "/mnt"),
            Err(FsError::InvalidSuperblock(_))
        ));
        assert_eq!(vfs.mounts().len(), 1);
        vfs.mount(EXT, FsKind::Simple, "/mnt").unwrap();
        assert!(matches!(vfs.mount(EXT, FsKind::Simple, "/f"), Err(FsError::NotADirectory)));
    }

    #[test]
    fn test_operation_spans_every_log() {
        let (vfs, _) = stack();
        assert_eq!(vfs.begin_op().logs(), 1);
        with_ext2(&vfs);
        // ext2 is not logged
        assert_eq!(vfs.begin_op().logs(), 1);
    }
}
