//! keelfs core - a small kernel-style storage stack
//!
//! The layers, bottom up:
//!
//! - [`blockdev`]: block devices and the device table the cache transfers through
//! - [`cache`]: the shared buffer cache with per-buffer sleep-locks
//! - [`modules::journaling`]: the write-ahead log with group commit and recovery
//! - [`simplefs`] and [`ext2`]: the two on-disk backends
//! - [`vfs`]: the inode table, the mount table, path resolution and the
//!   namespace operations, which reach a backend only through its
//!   operation tables
//!
//! [`format`] writes empty images for either backend.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod error;

pub mod block_bitmap;
pub mod blockdev;
pub mod cache;
pub mod clock;
pub mod config;
pub mod ext2;
pub mod format;
pub mod layout;
pub mod modules;
pub mod simplefs;
pub mod vfs;

// Re-export the error types
pub use error::{FsError, Result};

pub use blockdev::{BlockDevice, DeviceId, FileBackedBlockDevice, MemBlockDevice, BLOCK_SIZE};
pub use config::StorageConfig;
pub use vfs::{FsKind, InodeKind, Stat, Vfs};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::{BlockDevice, DeviceId, MemBlockDevice};
    pub use crate::clock::{Clock, FixedClock, SystemClock};
    pub use crate::config::StorageConfig;
    pub use crate::error::{FsError, Result};
    pub use crate::format::{format_ext2, format_simple, Ext2Geometry, SimpleGeometry};
    pub use crate::vfs::{FileSystem, FsKind, FsOps, InodeKind, InodeOps, Vfs};
}
