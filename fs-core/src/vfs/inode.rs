//! The in-memory inode table
//!
//! A fixed pool of slots shared by every mounted filesystem. Bookkeeping
//! (identity and reference count) sits behind one short-held lock; each
//! slot's contents sit behind their own sleep-lock, so a reference can be
//! taken without waiting for content access.
//!
//! [`InodeRef`] is a counted reference: cloning it is `idup`, dropping it
//! is `iput`. Dropping the last reference to an inode with no links left
//! truncates and frees it on disk, so on a logged filesystem the drop must
//! happen inside an operation.

use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::ops::{DirEntry, FileSystem, InodeData, InodeKind};
use crate::blockdev::DeviceId;
use crate::error::{FsError, Result};
use crate::fatal;

#[derive(Debug, Clone, Copy, Default)]
struct Meta {
    dev: Option<DeviceId>,
    inum: u32,
    refcnt: usize,
}

/// Fixed-size table of in-memory inodes
pub struct InodeCache {
    table: Mutex<Vec<Meta>>,
    slots: Box<[Mutex<InodeData>]>,
}

impl InodeCache {
    /// Create a table with `size` slots
    pub fn new(size: usize) -> Self {
        Self {
            table: Mutex::new(vec![Meta::default(); size]),
            slots: (0..size).map(|_| Mutex::new(InodeData::default())).collect(),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Find the in-memory copy of inode `inum` on `fs`, or claim a free slot
    /// for it. The inode is returned unlocked and is not read from disk.
    pub fn iget(self: &Arc<Self>, fs: &Arc<dyn FileSystem>, inum: u32) -> Result<InodeRef> {
        let dev = fs.dev();
        let mut table = self.table.lock();

        let mut empty = None;
        for (slot, meta) in table.iter_mut().enumerate() {
            if meta.refcnt > 0 && meta.dev == Some(dev) && meta.inum == inum {
                meta.refcnt += 1;
                return Ok(self.make_ref(slot, fs, inum));
            }
            if empty.is_none() && meta.refcnt == 0 {
                empty = Some(slot);
            }
        }

        let slot = match empty {
            Some(slot) => slot,
            None => {
                log::warn!("inode table full ({} slots)", self.slots.len());
                return Err(FsError::NoResources("inode table"));
            }
        };
        table[slot] = Meta {
            dev: Some(dev),
            inum,
            refcnt: 1,
        };
        // an unreferenced slot has no content-lock holder
        match self.slots[slot].try_lock() {
            Some(mut data) => {
                *data = InodeData {
                    inum,
                    ..Default::default()
                }
            }
            None => fatal!("inode slot {} is locked with no references", slot),
        }
        Ok(self.make_ref(slot, fs, inum))
    }

    fn make_ref(self: &Arc<Self>, slot: usize, fs: &Arc<dyn FileSystem>, inum: u32) -> InodeRef {
        InodeRef {
            cache: self.clone(),
            fs: fs.clone(),
            slot,
            inum,
        }
    }

    /// References held on inodes of `dev`
    pub fn refs_on(&self, dev: DeviceId) -> usize {
        self.table
            .lock()
            .iter()
            .filter(|m| m.dev == Some(dev))
            .map(|m| m.refcnt)
            .sum()
    }

    /// Slots with at least one reference
    pub fn in_use(&self) -> usize {
        self.table.lock().iter().filter(|m| m.refcnt > 0).count()
    }
}

impl std::fmt::Debug for InodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeCache")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A counted reference to an in-memory inode
pub struct InodeRef {
    cache: Arc<InodeCache>,
    fs: Arc<dyn FileSystem>,
    slot: usize,
    inum: u32,
}

impl InodeRef {
    /// Device of the filesystem the inode belongs to
    pub fn dev(&self) -> DeviceId {
        self.fs.dev()
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    /// The filesystem serving this inode
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Take the inode's sleep-lock, reading it from disk on first use.
    pub fn lock(&self) -> Result<InodeGuard<'_>> {
        let mut data = self.cache.slots[self.slot].lock();
        if !data.valid {
            self.fs.read_inode(&mut data)?;
            if data.kind == InodeKind::Free {
                fatal!("{} inode {}: locked inode has no type", self.dev(), self.inum);
            }
            data.valid = true;
        }
        Ok(InodeGuard { data, fs: &self.fs })
    }
}

impl Clone for InodeRef {
    fn clone(&self) -> Self {
        self.cache.table.lock()[self.slot].refcnt += 1;
        Self {
            cache: self.cache.clone(),
            fs: self.fs.clone(),
            slot: self.slot,
            inum: self.inum,
        }
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        let mut table = self.cache.table.lock();
        if table[self.slot].refcnt == 1 {
            // nobody else can reach the content lock of a last reference
            let mut data = match self.cache.slots[self.slot].try_lock() {
                Some(data) => data,
                None => fatal!("{} inode {}: last reference dropped while locked", self.dev(), self.inum),
            };
            if data.valid && data.nlink == 0 {
                drop(table);
                let kind = data.kind;
                if let Err(err) = self.fs.truncate(&mut data) {
                    fatal!("{} inode {}: truncate on release failed: {}", self.dev(), self.inum, err);
                }
                data.kind = InodeKind::Free;
                if let Err(err) = self.fs.update(&mut data) {
                    fatal!("{} inode {}: update on release failed: {}", self.dev(), self.inum, err);
                }
                self.fs.free_inode(self.inum, kind);
                data.valid = false;
                log::debug!("{} inode {}: released", self.dev(), self.inum);
                drop(data);
                table = self.cache.table.lock();
            }
        }
        let meta = &mut table[self.slot];
        meta.refcnt -= 1;
        if meta.refcnt == 0 {
            meta.dev = None;
        }
    }
}

impl std::fmt::Debug for InodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InodeRef({} inode {})", self.dev(), self.inum)
    }
}

/// A locked inode. Dereferences to its cached fields; the operations below
/// go through the owning filesystem's inode table.
pub struct InodeGuard<'a> {
    data: MutexGuard<'a, InodeData>,
    fs: &'a Arc<dyn FileSystem>,
}

impl InodeGuard<'_> {
    /// Write the cached fields back to disk
    pub fn update(&mut self) -> Result<()> {
        self.fs.update(&mut self.data)
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.fs.truncate(&mut self.data)
    }

    pub fn map_block(&mut self, lblock: u64, alloc: bool) -> Result<Option<u32>> {
        self.fs.map_block(&mut self.data, lblock, alloc)
    }

    pub fn read(&mut self, off: u64, dst: &mut [u8]) -> Result<usize> {
        self.fs.read(&mut self.data, off, dst)
    }

    pub fn write(&mut self, off: u64, src: &[u8]) -> Result<usize> {
        self.fs.write(&mut self.data, off, src)
    }

    pub fn lookup(&mut self, name: &str) -> Result<Option<u32>> {
        self.fs.lookup(&mut self.data, name)
    }

    pub fn link(&mut self, name: &str, inum: u32, kind: InodeKind) -> Result<()> {
        self.fs.link(&mut self.data, name, inum, kind)
    }

    pub fn unlink(&mut self, name: &str) -> Result<()> {
        self.fs.unlink(&mut self.data, name)
    }

    pub fn init_dir(&mut self, parent: u32) -> Result<()> {
        self.fs.init_dir(&mut self.data, parent)
    }

    pub fn is_dir_empty(&mut self) -> Result<bool> {
        self.fs.is_dir_empty(&mut self.data)
    }

    pub fn read_dir(&mut self) -> Result<Vec<DirEntry>> {
        self.fs.read_dir(&mut self.data)
    }
}

impl Deref for InodeGuard<'_> {
    type Target = InodeData;

    fn deref(&self) -> &InodeData {
        &self.data
    }
}

impl DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut InodeData {
        &mut self.data
    }
}
