//! ext2 on-disk structures
//!
//! Fields are decoded at their fixed little-endian offsets so that bytes
//! this crate does not interpret survive a read-modify-write untouched.

use byteorder::{ByteOrder, LittleEndian};

use crate::blockdev::BLOCK_SIZE;
use crate::vfs::InodeKind;

pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;
/// Byte offset of the primary superblock
pub const SUPERBLOCK_OFFSET: usize = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;

pub const GOOD_OLD_REV: u32 = 0;
pub const DYNAMIC_REV: u32 = 1;
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
pub const GOOD_OLD_FIRST_INO: u32 = 11;
pub const ROOT_INO: u32 = 2;

pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;
pub const SUPPORTED_INCOMPAT: u32 = FEATURE_INCOMPAT_FILETYPE;
pub const SUPPORTED_RO_COMPAT: u32 = FEATURE_RO_COMPAT_SPARSE_SUPER | FEATURE_RO_COMPAT_LARGE_FILE;

/// `s_state` bits
pub const VALID_FS: u16 = 0x0001;

/// Most links an inode may carry
pub const LINK_MAX: u16 = 32000;

/// Direct slots in `i_block`
pub const NDIR_BLOCKS: usize = 12;
pub const IND_BLOCK: usize = 12;
pub const DIND_BLOCK: usize = 13;
pub const TIND_BLOCK: usize = 14;
pub const N_BLOCKS: usize = 15;
/// Block numbers per indirect block
pub const ADDR_PER_BLOCK: usize = BLOCK_SIZE / 4;

pub const GROUP_DESC_SIZE: usize = 32;
pub const DESC_PER_BLOCK: usize = BLOCK_SIZE / GROUP_DESC_SIZE;

pub const S_IFMT: u16 = 0xF000;
pub const S_IFSOCK: u16 = 0xC000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

/// Directory entry file-type tags
pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_CHRDEV: u8 = 3;
pub const FT_SYMLINK: u8 = 7;

/// Superblock fields this crate uses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ext2Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub lastcheck: u32,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
}

impl Ext2Superblock {
    /// Decode the 1024-byte superblock image
    pub fn from_bytes(raw: &[u8]) -> Self {
        let u32_at = |off: usize| LittleEndian::read_u32(&raw[off..off + 4]);
        let u16_at = |off: usize| LittleEndian::read_u16(&raw[off..off + 2]);

        let rev_level = u32_at(76);
        let (first_ino, inode_size) = if rev_level == GOOD_OLD_REV {
            (GOOD_OLD_FIRST_INO, GOOD_OLD_INODE_SIZE)
        } else {
            (u32_at(84), u16_at(88))
        };

        Self {
            inodes_count: u32_at(0),
            blocks_count: u32_at(4),
            r_blocks_count: u32_at(8),
            free_blocks_count: u32_at(12),
            free_inodes_count: u32_at(16),
            first_data_block: u32_at(20),
            log_block_size: u32_at(24),
            blocks_per_group: u32_at(32),
            inodes_per_group: u32_at(40),
            mtime: u32_at(44),
            wtime: u32_at(48),
            mnt_count: u16_at(52),
            magic: u16_at(56),
            state: u16_at(58),
            lastcheck: u32_at(64),
            rev_level,
            first_ino,
            inode_size,
            block_group_nr: u16_at(90),
            feature_compat: u32_at(92),
            feature_incompat: u32_at(96),
            feature_ro_compat: u32_at(100),
            uuid: *arrayref::array_ref![raw, 104, 16],
            volume_name: *arrayref::array_ref![raw, 120, 16],
        }
    }

    /// Encode into a superblock image, leaving unknown fields as they are.
    pub fn write_to(&self, raw: &mut [u8]) {
        fn put32(off: usize, v: u32, raw: &mut [u8]) {
            LittleEndian::write_u32(&mut raw[off..off + 4], v)
        }
        put32(0, self.inodes_count, raw);
        put32(4, self.blocks_count, raw);
        put32(8, self.r_blocks_count, raw);
        put32(12, self.free_blocks_count, raw);
        put32(16, self.free_inodes_count, raw);
        put32(20, self.first_data_block, raw);
        put32(24, self.log_block_size, raw);
        put32(28, self.log_block_size, raw);
        put32(32, self.blocks_per_group, raw);
        put32(36, self.blocks_per_group, raw);
        put32(40, self.inodes_per_group, raw);
        put32(44, self.mtime, raw);
        put32(48, self.wtime, raw);
        put32(64, self.lastcheck, raw);
        put32(76, self.rev_level, raw);
        LittleEndian::write_u16(&mut raw[52..54], self.mnt_count);
        LittleEndian::write_u16(&mut raw[56..58], self.magic);
        LittleEndian::write_u16(&mut raw[58..60], self.state);
        if self.rev_level >= DYNAMIC_REV {
            put32(84, self.first_ino, raw);
            LittleEndian::write_u16(&mut raw[88..90], self.inode_size);
            LittleEndian::write_u16(&mut raw[90..92], self.block_group_nr);
            put32(92, self.feature_compat, raw);
            put32(96, self.feature_incompat, raw);
            put32(100, self.feature_ro_compat, raw);
            raw[104..120].copy_from_slice(&self.uuid);
            raw[120..136].copy_from_slice(&self.volume_name);
        }
    }

    /// Block size in bytes
    pub fn block_size(&self) -> u64 {
        1024u64 << self.log_block_size.min(16)
    }

    /// Number of block groups
    pub fn group_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data = self.blocks_count.saturating_sub(self.first_data_block) as u64;
        ((data + self.blocks_per_group as u64 - 1) / self.blocks_per_group as u64) as u32
    }

    pub fn has_filetype(&self) -> bool {
        self.feature_incompat & FEATURE_INCOMPAT_FILETYPE != 0
    }

    pub fn has_large_file(&self) -> bool {
        self.feature_ro_compat & FEATURE_RO_COMPAT_LARGE_FILE != 0
    }

    /// Whether group `group` carries a superblock backup
    pub fn group_has_super(&self, group: u32) -> bool {
        if self.feature_ro_compat & FEATURE_RO_COMPAT_SPARSE_SUPER == 0 {
            return true;
        }
        group <= 1 || is_power_of(group, 3) || is_power_of(group, 5) || is_power_of(group, 7)
    }
}

fn is_power_of(mut n: u32, base: u32) -> bool {
    while n > 1 && n % base == 0 {
        n /= base;
    }
    n == 1
}

/// One 32-byte block group descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub fn from_bytes(raw: &[u8]) -> Self {
        Self {
            block_bitmap: LittleEndian::read_u32(&raw[0..4]),
            inode_bitmap: LittleEndian::read_u32(&raw[4..8]),
            inode_table: LittleEndian::read_u32(&raw[8..12]),
            free_blocks_count: LittleEndian::read_u16(&raw[12..14]),
            free_inodes_count: LittleEndian::read_u16(&raw[14..16]),
            used_dirs_count: LittleEndian::read_u16(&raw[16..18]),
        }
    }

    pub fn write_to(&self, raw: &mut [u8]) {
        LittleEndian::write_u32(&mut raw[0..4], self.block_bitmap);
        LittleEndian::write_u32(&mut raw[4..8], self.inode_bitmap);
        LittleEndian::write_u32(&mut raw[8..12], self.inode_table);
        LittleEndian::write_u16(&mut raw[12..14], self.free_blocks_count);
        LittleEndian::write_u16(&mut raw[14..16], self.free_inodes_count);
        LittleEndian::write_u16(&mut raw[16..18], self.used_dirs_count);
        raw[18..GROUP_DESC_SIZE].fill(0);
    }
}

/// Field accessors over a raw inode image (linux flavour of the unions)
pub mod inode {
    use super::*;

    pub fn mode(raw: &[u8]) -> u16 {
        LittleEndian::read_u16(&raw[0..2])
    }

    pub fn set_mode(raw: &mut [u8], mode: u16) {
        LittleEndian::write_u16(&mut raw[0..2], mode)
    }

    pub fn uid(raw: &[u8]) -> u32 {
        LittleEndian::read_u16(&raw[2..4]) as u32 | (LittleEndian::read_u16(&raw[120..122]) as u32) << 16
    }

    pub fn set_uid(raw: &mut [u8], uid: u32) {
        LittleEndian::write_u16(&mut raw[2..4], uid as u16);
        LittleEndian::write_u16(&mut raw[120..122], (uid >> 16) as u16);
    }

    pub fn gid(raw: &[u8]) -> u32 {
        LittleEndian::read_u16(&raw[24..26]) as u32 | (LittleEndian::read_u16(&raw[122..124]) as u32) << 16
    }

    pub fn set_gid(raw: &mut [u8], gid: u32) {
        LittleEndian::write_u16(&mut raw[24..26], gid as u16);
        LittleEndian::write_u16(&mut raw[122..124], (gid >> 16) as u16);
    }

    /// Low 32 bits of the size
    pub fn size_lo(raw: &[u8]) -> u32 {
        LittleEndian::read_u32(&raw[4..8])
    }

    /// `i_dir_acl`, the high 32 bits of a regular file's size
    pub fn size_hi(raw: &[u8]) -> u32 {
        LittleEndian::read_u32(&raw[108..112])
    }

    pub fn set_size(raw: &mut [u8], lo: u32, hi: u32) {
        LittleEndian::write_u32(&mut raw[4..8], lo);
        LittleEndian::write_u32(&mut raw[108..112], hi);
    }

    pub fn atime(raw: &[u8]) -> u32 {
        LittleEndian::read_u32(&raw[8..12])
    }

    pub fn ctime(raw: &[u8]) -> u32 {
        LittleEndian::read_u32(&raw[12..16])
    }

    pub fn mtime(raw: &[u8]) -> u32 {
        LittleEndian::read_u32(&raw[16..20])
    }

    pub fn set_times(raw: &mut [u8], atime: u32, ctime: u32, mtime: u32) {
        LittleEndian::write_u32(&mut raw[8..12], atime);
        LittleEndian::write_u32(&mut raw[12..16], ctime);
        LittleEndian::write_u32(&mut raw[16..20], mtime);
    }

    pub fn set_dtime(raw: &mut [u8], dtime: u32) {
        LittleEndian::write_u32(&mut raw[20..24], dtime);
    }

    pub fn links(raw: &[u8]) -> u16 {
        LittleEndian::read_u16(&raw[26..28])
    }

    pub fn set_links(raw: &mut [u8], links: u16) {
        LittleEndian::write_u16(&mut raw[26..28], links);
    }

    /// Allocated space in 512-byte units
    pub fn sectors(raw: &[u8]) -> u32 {
        LittleEndian::read_u32(&raw[28..32])
    }

    pub fn set_sectors(raw: &mut [u8], sectors: u32) {
        LittleEndian::write_u32(&mut raw[28..32], sectors);
    }

    /// `i_block[i]`
    pub fn block(raw: &[u8], i: usize) -> u32 {
        LittleEndian::read_u32(&raw[40 + i * 4..44 + i * 4])
    }

    pub fn set_block(raw: &mut [u8], i: usize, b: u32) {
        LittleEndian::write_u32(&mut raw[40 + i * 4..44 + i * 4], b);
    }

    /// Map the type bits of `i_mode`
    pub fn kind_from_mode(mode: u16) -> InodeKind {
        match mode & S_IFMT {
            S_IFDIR => InodeKind::Dir,
            S_IFREG => InodeKind::File,
            S_IFLNK => InodeKind::Symlink,
            S_IFCHR | S_IFBLK | S_IFIFO | S_IFSOCK => InodeKind::Device,
            _ => InodeKind::Free,
        }
    }

    /// Initial `i_mode` for a new inode of `kind`
    pub fn mode_for(kind: InodeKind) -> u16 {
        match kind {
            InodeKind::Dir => S_IFDIR | 0o755,
            InodeKind::File => S_IFREG | 0o644,
            InodeKind::Device => S_IFCHR | 0o600,
            InodeKind::Symlink => S_IFLNK | 0o777,
            InodeKind::Free => 0,
        }
    }
}

/// Variable-length directory entries
pub mod dirent {
    use super::*;

    /// Fixed part: inode, rec_len, name_len, file_type
    pub const HEADER_LEN: usize = 8;
    pub const MAX_NAME_LEN: usize = 255;

    /// Space an entry with a name of `name_len` bytes needs
    pub fn rec_len(name_len: usize) -> usize {
        (name_len + HEADER_LEN + 3) & !3
    }

    /// Decoded header of the entry at `pos`
    #[derive(Debug, Clone, Copy)]
    pub struct Header {
        pub inode: u32,
        pub rec_len: usize,
        pub name_len: usize,
        pub file_type: u8,
    }

    pub fn header(block: &[u8], pos: usize) -> Header {
        Header {
            inode: LittleEndian::read_u32(&block[pos..pos + 4]),
            rec_len: LittleEndian::read_u16(&block[pos + 4..pos + 6]) as usize,
            name_len: block[pos + 6] as usize,
            file_type: block[pos + 7],
        }
    }

    pub fn name(block: &[u8], pos: usize, name_len: usize) -> &[u8] {
        &block[pos + HEADER_LEN..pos + HEADER_LEN + name_len]
    }

    /// Write a complete entry at `pos`
    pub fn write(block: &mut [u8], pos: usize, inode: u32, rec_len: usize, name: &[u8], file_type: u8) {
        LittleEndian::write_u32(&mut block[pos..pos + 4], inode);
        LittleEndian::write_u16(&mut block[pos + 4..pos + 6], rec_len as u16);
        block[pos + 6] = name.len() as u8;
        block[pos + 7] = file_type;
        block[pos + HEADER_LEN..pos + HEADER_LEN + name.len()].copy_from_slice(name);
    }

    pub fn set_inode(block: &mut [u8], pos: usize, inode: u32) {
        LittleEndian::write_u32(&mut block[pos..pos + 4], inode);
    }

    pub fn set_rec_len(block: &mut [u8], pos: usize, rec_len: usize) {
        LittleEndian::write_u16(&mut block[pos + 4..pos + 6], rec_len as u16);
    }

    /// Entry file-type tag for an inode kind
    pub fn file_type(kind: InodeKind) -> u8 {
        match kind {
            InodeKind::File => FT_REG_FILE,
            InodeKind::Dir => FT_DIR,
            InodeKind::Device => FT_CHRDEV,
            InodeKind::Symlink => FT_SYMLINK,
            InodeKind::Free => FT_UNKNOWN,
        }
    }

    pub fn kind_from_file_type(tag: u8) -> Option<InodeKind> {
        match tag {
            FT_REG_FILE => Some(InodeKind::File),
            FT_DIR => Some(InodeKind::Dir),
            FT_SYMLINK => Some(InodeKind::Symlink),
            3..=6 => Some(InodeKind::Device),
            _ => None,
        }
    }
}
