//! Operation tables every filesystem backend implements
//!
//! The layers above this module never branch on the on-disk format. They
//! hold an `Arc<dyn FileSystem>` (in a mount entry or an inode-cache slot)
//! and call through it.

use serde::Serialize;
use std::fmt;

use crate::blockdev::DeviceId;
use crate::error::Result;
use crate::modules::Transaction;

/// On-disk formats the stack can mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FsKind {
    /// Fixed-layout, logged filesystem
    Simple,
    /// ext2 revision 0/1 with 4 KiB blocks, not logged
    Ext2,
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsKind::Simple => write!(f, "simple"),
            FsKind::Ext2 => write!(f, "ext2"),
        }
    }
}

impl std::str::FromStr for FsKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "simple" => Ok(FsKind::Simple),
            "ext2" => Ok(FsKind::Ext2),
            other => Err(format!("unknown filesystem type '{}'", other)),
        }
    }
}

/// File type of an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum InodeKind {
    /// Slot not in use
    #[default]
    Free,
    /// Directory
    Dir,
    /// Regular file
    File,
    /// Character or block device node
    Device,
    /// Symbolic link (ext2 only; never created here)
    Symlink,
}

/// Format-specific part of an in-memory inode
#[derive(Debug, Clone, Default)]
pub enum InodePrivate {
    /// Not loaded yet
    #[default]
    None,
    /// Simple backend: the 13 block address slots
    Simple {
        /// 11 direct, one indirect, one doubly-indirect
        addrs: [u32; crate::layout::NADDRS],
    },
    /// Ext2 backend: the raw on-disk inode image
    Ext2(crate::ext2::Ext2Private),
}

/// Contents of an in-memory inode, protected by its sleep-lock.
///
/// Everything except `inum` is meaningful only once `valid` is set, which
/// happens the first time the inode is locked after being claimed.
#[derive(Debug, Clone, Default)]
pub struct InodeData {
    /// Inode number; fixed while the slot is referenced
    pub inum: u32,
    /// Fields have been read from disk
    pub valid: bool,
    pub kind: InodeKind,
    pub nlink: u16,
    pub size: u64,
    pub major: u16,
    pub minor: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub private: InodePrivate,
}

/// One name in a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub inum: u32,
    pub name: String,
    /// Type tag stored in the entry, when the format keeps one
    pub kind: Option<InodeKind>,
}

/// Superblock summary
#[derive(Debug, Clone, Serialize)]
pub struct FsStats {
    pub kind: FsKind,
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    /// Blocks in the log region, for logged formats
    pub log_blocks: Option<u32>,
}

/// Filesystem-level operations
pub trait FsOps: Send + Sync {
    /// Format of this filesystem
    fn kind(&self) -> FsKind;

    /// Device the filesystem lives on
    fn dev(&self) -> DeviceId;

    /// Inode number of the root directory
    fn root_inum(&self) -> u32;

    /// Read the superblock summary
    fn stats(&self) -> Result<FsStats>;

    /// Allocate a zeroed data block, preferably near `goal` (0 for none).
    fn alloc_block(&self, goal: u32) -> Result<u32>;

    /// Return a data block to the free pool.
    fn free_block(&self, block: u32);

    /// Allocate an on-disk inode of the given type. `parent` is the
    /// directory it will be linked into, used for placement.
    fn alloc_inode(&self, kind: InodeKind, parent: u32) -> Result<u32>;

    /// Mark an on-disk inode free. Content must already be truncated.
    fn free_inode(&self, inum: u32, kind: InodeKind);

    /// Largest link count an inode may reach
    fn max_links(&self) -> u16;

    /// Open an operation on this filesystem's log; `None` if unlogged.
    fn begin_op(&self) -> Option<Transaction>;

    /// Write back mount-lifetime state and release pinned buffers.
    fn unmount(&self) -> Result<()>;
}

/// Inode-level operations. Every method expects the caller to hold the
/// inode's sleep-lock, which is what `&mut InodeData` stands for.
pub trait InodeOps: Send + Sync {
    /// Fill `ip` from the on-disk inode `ip.inum`.
    fn read_inode(&self, ip: &mut InodeData) -> Result<()>;

    /// Copy the cached metadata back to disk.
    fn update(&self, ip: &mut InodeData) -> Result<()>;

    /// Free every block the inode owns and set its size to zero.
    fn truncate(&self, ip: &mut InodeData) -> Result<()>;

    /// Physical block holding logical block `lblock`, allocating the data
    /// block and any missing indirect blocks when `alloc` is set.
    fn map_block(&self, ip: &mut InodeData, lblock: u64, alloc: bool) -> Result<Option<u32>>;

    /// Read up to `dst.len()` bytes at `off`; returns the count read.
    fn read(&self, ip: &mut InodeData, off: u64, dst: &mut [u8]) -> Result<usize>;

    /// Write `src` at `off`, growing the file as needed.
    fn write(&self, ip: &mut InodeData, off: u64, src: &[u8]) -> Result<usize>;

    /// Find `name` in directory `dp`.
    fn lookup(&self, dp: &mut InodeData, name: &str) -> Result<Option<u32>>;

    /// Add the entry `name -> inum` to directory `dp`.
    fn link(&self, dp: &mut InodeData, name: &str, inum: u32, kind: InodeKind) -> Result<()>;

    /// Remove the entry `name` from directory `dp`.
    fn unlink(&self, dp: &mut InodeData, name: &str) -> Result<()>;

    /// Write "." and ".." into the freshly allocated directory `ip`.
    fn init_dir(&self, ip: &mut InodeData, parent: u32) -> Result<()>;

    /// Whether directory `dp` holds nothing but "." and "..".
    fn is_dir_empty(&self, dp: &mut InodeData) -> Result<bool>;

    /// All live entries of directory `dp`.
    fn read_dir(&self, dp: &mut InodeData) -> Result<Vec<DirEntry>>;
}

/// A mountable filesystem: both operation tables behind one trait object.
pub trait FileSystem: FsOps + InodeOps {}

impl<T: FsOps + InodeOps> FileSystem for T {}
