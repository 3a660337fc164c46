//! The mount table

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

use super::inode::InodeRef;
use super::ops::{FileSystem, FsKind};
use crate::blockdev::DeviceId;
use crate::error::{FsError, Result};

/// One mounted filesystem
pub struct MountEntry {
    pub dev: DeviceId,
    /// Directory the filesystem is mounted on; `None` for the root mount
    pub mountpoint: Option<InodeRef>,
    /// Root directory of the mounted filesystem
    pub root: InodeRef,
    pub fs: Arc<dyn FileSystem>,
}

/// Summary of a mount, for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInfo {
    pub dev: DeviceId,
    pub kind: FsKind,
    /// Device and inode of the covered directory
    pub covers: Option<(DeviceId, u32)>,
}

/// Mounted filesystems, keyed by device
pub struct MountTable {
    entries: RwLock<Vec<MountEntry>>,
    max_mounts: usize,
}

impl MountTable {
    pub fn new(max_mounts: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_mounts,
        }
    }

    /// Record a mount. Fails when the device or the mount point is already
    /// in use, or the table is full.
    pub fn add(&self, entry: MountEntry) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.dev == entry.dev) {
            return Err(FsError::Busy);
        }
        if let Some(mp) = &entry.mountpoint {
            let covered = entries.iter().any(|e| {
                e.mountpoint
                    .as_ref()
                    .map_or(false, |m| m.dev() == mp.dev() && m.inum() == mp.inum())
            });
            if covered {
                return Err(FsError::Busy);
            }
        } else if entries.iter().any(|e| e.mountpoint.is_none()) {
            return Err(FsError::Busy);
        }
        if entries.len() >= self.max_mounts {
            log::warn!("mount table full ({} entries)", self.max_mounts);
            return Err(FsError::NoResources("mount table"));
        }
        log::info!(
            "mounted {} ({}) on {}",
            entry.dev,
            entry.fs.kind(),
            entry
                .mountpoint
                .as_ref()
                .map_or_else(|| "/".to_string(), |m| format!("{} inode {}", m.dev(), m.inum()))
        );
        entries.push(entry);
        Ok(())
    }

    /// Root of the filesystem mounted on directory `inum` of `dev`, if any
    pub fn mounted_on(&self, dev: DeviceId, inum: u32) -> Option<InodeRef> {
        self.entries
            .read()
            .iter()
            .find(|e| {
                e.mountpoint
                    .as_ref()
                    .map_or(false, |m| m.dev() == dev && m.inum() == inum)
            })
            .map(|e| e.root.clone())
    }

    /// The directory filesystem `dev` is mounted on; `None` for the root
    /// mount or an unknown device
    pub fn mount_point_of(&self, dev: DeviceId) -> Option<InodeRef> {
        self.entries
            .read()
            .iter()
            .find(|e| e.dev == dev)
            .and_then(|e| e.mountpoint.clone())
    }

    /// Take the entry for `dev` out of the table.
    pub fn remove(&self, dev: DeviceId) -> Option<MountEntry> {
        let mut entries = self.entries.write();
        let pos = entries.iter().position(|e| e.dev == dev)?;
        Some(entries.remove(pos))
    }

    /// Take every entry out, most recent mount first.
    pub fn drain(&self) -> Vec<MountEntry> {
        let mut entries = self.entries.write();
        entries.drain(..).rev().collect()
    }

    pub fn fs(&self, dev: DeviceId) -> Option<Arc<dyn FileSystem>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.dev == dev)
            .map(|e| e.fs.clone())
    }

    /// Root directory of the root mount
    pub fn root(&self) -> Option<InodeRef> {
        self.entries
            .read()
            .iter()
            .find(|e| e.mountpoint.is_none())
            .map(|e| e.root.clone())
    }

    /// Every mounted filesystem in device order
    pub fn filesystems(&self) -> Vec<Arc<dyn FileSystem>> {
        let entries = self.entries.read();
        let mut all: Vec<_> = entries.iter().map(|e| (e.dev, e.fs.clone())).collect();
        all.sort_by_key(|(dev, _)| *dev);
        all.into_iter().map(|(_, fs)| fs).collect()
    }

    pub fn list(&self) -> Vec<MountInfo> {
        self.entries
            .read()
            .iter()
            .map(|e| MountInfo {
                dev: e.dev,
                kind: e.fs.kind(),
                covers: e.mountpoint.as_ref().map(|m| (m.dev(), m.inum())),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
