//! Directories: variable-length entries packed into whole blocks

use super::disk::dirent::{self, Header, HEADER_LEN, MAX_NAME_LEN};
use super::Ext2Fs;
use crate::blockdev::BLOCK_SIZE;
use crate::error::{FsError, Result};
use crate::fatal;
use crate::vfs::{DirEntry, InodeData, InodeKind};

/// Where a live entry sits
#[derive(Debug, Clone, Copy)]
pub(super) struct DirSlot {
    pub inode: u32,
    block: u32,
    pos: usize,
    rec_len: usize,
    /// Entry before this one in the same block
    prev: Option<usize>,
}

struct EntryView<'a> {
    slot: DirSlot,
    header: Header,
    name: &'a [u8],
}

impl Ext2Fs {
    fn check_entry(&self, dir: u32, block: u32, pos: usize, header: &Header) {
        let rec_len = header.rec_len;
        if rec_len < HEADER_LEN
            || rec_len % 4 != 0
            || pos + rec_len > BLOCK_SIZE
            || header.name_len + HEADER_LEN > rec_len
        {
            fatal!(
                "{}: directory {} block {}: bad entry at {} (rec_len {}, name_len {})",
                self.dev,
                dir,
                block,
                pos,
                rec_len,
                header.name_len
            );
        }
    }

    fn dir_block(&self, dp: &mut InodeData, lblock: u64) -> Result<u32> {
        match self.get_block(dp, lblock, false)? {
            Some(block) => Ok(block),
            None => fatal!("{}: directory {} has a hole at block {}", self.dev, dp.inum, lblock),
        }
    }

    /// Visit live entries in order until `visit` returns a value.
    fn scan_dir<T>(
        &self,
        dp: &mut InodeData,
        mut visit: impl FnMut(&EntryView<'_>) -> Option<T>,
    ) -> Result<Option<T>> {
        if dp.kind != InodeKind::Dir {
            return Err(FsError::NotADirectory);
        }
        for lblock in 0..dp.size / BLOCK_SIZE as u64 {
            let block = self.dir_block(dp, lblock)?;
            let buf = self.cache.acquire(self.dev, block);
            let mut pos = 0;
            let mut prev = None;
            while pos < BLOCK_SIZE {
                let header = dirent::header(&buf, pos);
                self.check_entry(dp.inum, block, pos, &header);
                if header.inode != 0 {
                    let view = EntryView {
                        slot: DirSlot {
                            inode: header.inode,
                            block,
                            pos,
                            rec_len: header.rec_len,
                            prev,
                        },
                        header,
                        name: dirent::name(&buf, pos, header.name_len),
                    };
                    if let Some(found) = visit(&view) {
                        return Ok(Some(found));
                    }
                }
                prev = Some(pos);
                pos += header.rec_len;
            }
        }
        Ok(None)
    }

    pub(super) fn find_entry(&self, dp: &mut InodeData, name: &str) -> Result<Option<DirSlot>> {
        let name = name.as_bytes();
        self.scan_dir(dp, |entry| if entry.name == name { Some(entry.slot) } else { None })
    }

    fn entry_file_type(&self, kind: InodeKind) -> u8 {
        if self.geometry().filetype {
            dirent::file_type(kind)
        } else {
            0
        }
    }

    fn touch_dir(&self, dp: &mut InodeData) -> Result<()> {
        let now = self.now();
        dp.mtime = now;
        dp.ctime = now;
        self.store_inode(dp)
    }

    /// Insert `name -> inum`, reusing a free entry or the slack of a live
    /// one before growing the directory by a block.
    pub(super) fn add_entry(&self, dp: &mut InodeData, name: &str, inum: u32, kind: InodeKind) -> Result<()> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument("empty name".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        if self.find_entry(dp, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let bytes = name.as_bytes();
        let needed = dirent::rec_len(bytes.len());
        let file_type = self.entry_file_type(kind);

        let nblocks = dp.size / BLOCK_SIZE as u64;
        for lblock in 0..nblocks {
            let block = self.dir_block(dp, lblock)?;
            let mut buf = self.cache.acquire(self.dev, block);
            let mut pos = 0;
            while pos < BLOCK_SIZE {
                let header = dirent::header(&buf, pos);
                self.check_entry(dp.inum, block, pos, &header);
                let used = dirent::rec_len(header.name_len);

                if header.inode == 0 && header.rec_len >= needed {
                    dirent::write(&mut buf, pos, inum, header.rec_len, bytes, file_type);
                } else if header.inode != 0 && header.rec_len >= used + needed {
                    dirent::set_rec_len(&mut buf, pos, used);
                    dirent::write(&mut buf, pos + used, inum, header.rec_len - used, bytes, file_type);
                } else {
                    pos += header.rec_len;
                    continue;
                }
                buf.flush();
                drop(buf);
                return self.touch_dir(dp);
            }
        }

        let block = match self.get_block(dp, nblocks, true)? {
            Some(block) => block,
            None => fatal!("{}: directory {} did not grow", self.dev, dp.inum),
        };
        let mut buf = self.cache.acquire(self.dev, block);
        buf.fill(0);
        dirent::write(&mut buf, 0, inum, BLOCK_SIZE, bytes, file_type);
        buf.flush();
        drop(buf);
        dp.size += BLOCK_SIZE as u64;
        self.touch_dir(dp)
    }

    /// Clear the entry and fold its space into the entry before it.
    pub(super) fn delete_entry(&self, dp: &mut InodeData, name: &str) -> Result<()> {
        let slot = self.find_entry(dp, name)?.ok_or(FsError::NotFound)?;
        let mut buf = self.cache.acquire(self.dev, slot.block);
        dirent::set_inode(&mut buf, slot.pos, 0);
        if let Some(prev) = slot.prev {
            let prev_len = dirent::header(&buf, prev).rec_len;
            dirent::set_rec_len(&mut buf, prev, prev_len + slot.rec_len);
        }
        buf.flush();
        drop(buf);
        self.touch_dir(dp)
    }

    pub(super) fn make_empty_dir(&self, ip: &mut InodeData, parent: u32) -> Result<()> {
        let block = match self.get_block(ip, 0, true)? {
            Some(block) => block,
            None => fatal!("{}: directory {} has no first block", self.dev, ip.inum),
        };
        let file_type = self.entry_file_type(InodeKind::Dir);
        let dot_len = dirent::rec_len(1);

        let mut buf = self.cache.acquire(self.dev, block);
        buf.fill(0);
        dirent::write(&mut buf, 0, ip.inum, dot_len, b".", file_type);
        dirent::write(&mut buf, dot_len, parent, BLOCK_SIZE - dot_len, b"..", file_type);
        buf.flush();
        drop(buf);

        ip.size = BLOCK_SIZE as u64;
        // "." refers back to the directory itself
        ip.nlink += 1;
        self.touch_dir(ip)
    }

    pub(super) fn dir_is_empty(&self, dp: &mut InodeData) -> Result<bool> {
        let other = self.scan_dir(dp, |entry| match entry.name {
            b"." | b".." => None,
            _ => Some(()),
        })?;
        Ok(other.is_none())
    }

    pub(super) fn list_entries(&self, dp: &mut InodeData) -> Result<Vec<DirEntry>> {
        let filetype = self.geometry().filetype;
        let mut entries = Vec::new();
        self.scan_dir(dp, |entry| {
            entries.push(DirEntry {
                inum: entry.slot.inode,
                name: String::from_utf8_lossy(entry.name).into_owned(),
                kind: if filetype {
                    dirent::kind_from_file_type(entry.header.file_type)
                } else {
                    None
                },
            });
            None::<()>
        })?;
        Ok(entries)
    }
}
