//! Path resolution across mounts
//!
//! Paths are absolute and resolved from the root mount. A directory that
//! has a filesystem mounted on it is replaced by that filesystem's root as
//! soon as the walk reaches it; ".." at a mounted root continues from the
//! directory it covers.

use std::sync::Arc;

use super::inode::{InodeCache, InodeRef};
use super::mount::MountTable;
use super::ops::InodeKind;
use crate::error::{FsError, Result};

/// Split the next element off `path`, skipping leading and trailing
/// slashes. Returns `None` once nothing but slashes remain.
///
/// ```
/// use keelfs::vfs::skip_elem;
///
/// assert_eq!(skip_elem("a/bb/c"), Some(("a", "bb/c")));
/// assert_eq!(skip_elem("///a//bb"), Some(("a", "bb")));
/// assert_eq!(skip_elem("a"), Some(("a", "")));
/// assert_eq!(skip_elem("//"), None);
/// ```
pub fn skip_elem(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    let (elem, rest) = match path.find('/') {
        Some(i) => (&path[..i], &path[i..]),
        None => (path, ""),
    };
    Some((elem, rest.trim_start_matches('/')))
}

/// Resolves paths against the mount table
pub(super) struct Resolver<'a> {
    pub inodes: &'a Arc<InodeCache>,
    pub mounts: &'a MountTable,
}

impl<'a> Resolver<'a> {
    /// Follow a mount on `ip`, if there is one
    fn cross_down(&self, ip: InodeRef) -> InodeRef {
        match self.mounts.mounted_on(ip.dev(), ip.inum()) {
            Some(root) => root,
            None => ip,
        }
    }

    /// Inode for ".." of `ip`, leaving its filesystem when `ip` is a
    /// mounted root
    fn parent_of(&self, ip: &InodeRef) -> Result<InodeRef> {
        if ip.inum() == ip.fs().root_inum() {
            if let Some(mp) = self.mounts.mount_point_of(ip.dev()) {
                let inum = mp.lock()?.lookup("..")?.ok_or(FsError::NotFound)?;
                return self.inodes.iget(mp.fs(), inum);
            }
        }
        let inum = ip.lock()?.lookup("..")?.ok_or(FsError::NotFound)?;
        self.inodes.iget(ip.fs(), inum)
    }

    /// Walk `path`. With `parent` set, stop one element early and return
    /// the directory together with the final name.
    pub fn namex<'p>(&self, path: &'p str, parent: bool) -> Result<(InodeRef, &'p str)> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidPath);
        }
        let mut ip = self.mounts.root().ok_or(FsError::NotFound)?;
        let mut path = path;

        while let Some((name, rest)) = skip_elem(path) {
            let next = {
                let mut guard = ip.lock()?;
                if guard.kind != InodeKind::Dir {
                    return Err(FsError::NotADirectory);
                }
                if parent && rest.is_empty() {
                    drop(guard);
                    return Ok((ip, name));
                }
                if name == ".." {
                    drop(guard);
                    self.parent_of(&ip)?
                } else {
                    let inum = guard.lookup(name)?.ok_or(FsError::NotFound)?;
                    drop(guard);
                    self.inodes.iget(ip.fs(), inum)?
                }
            };
            ip = self.cross_down(next);
            path = rest;
        }

        if parent {
            // "/" has no parent
            return Err(FsError::InvalidPath);
        }
        Ok((ip, ""))
    }
}
