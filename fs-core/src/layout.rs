//! On-disk layout of the Simple filesystem
//!
//! ```text
//! [ boot | super | log header, log bodies | inode table | bitmap | data ]
//!   0      1       logstart                 inodestart    bmapstart
//! ```
//!
//! All integers are little endian.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::blockdev::BLOCK_SIZE;
use crate::error::{FsError, Result};

/// Block holding the superblock
pub const SUPERBLOCK_NO: u32 = 1;
/// Inode number of the root directory
pub const ROOTINO: u32 = 1;

/// Direct block slots in an inode
pub const NDIRECT: usize = 11;
/// Block numbers per indirect block
pub const NINDIRECT: usize = BLOCK_SIZE / 4;
/// Address slots in an inode: direct, indirect, doubly-indirect
pub const NADDRS: usize = NDIRECT + 2;
/// Largest file, in blocks
pub const MAXFILE: u64 = (NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT) as u64;
/// Largest file, in bytes. The dinode keeps a 32-bit size, which is
/// smaller than what the address slots can map.
pub const MAXSIZE: u64 = if MAXFILE * BLOCK_SIZE as u64 > u32::MAX as u64 {
    u32::MAX as u64
} else {
    MAXFILE * BLOCK_SIZE as u64
};
/// Most links an inode can carry; the dinode stores the count as `i16`
pub const MAXLINK: u16 = i16::MAX as u16;

/// Size of an on-disk inode
pub const DINODE_SIZE: usize = 64;
/// Inodes per block
pub const IPB: u32 = (BLOCK_SIZE / DINODE_SIZE) as u32;
/// Bitmap bits per block
pub const BPB: u32 = (BLOCK_SIZE * 8) as u32;

/// Longest name a directory entry holds
pub const DIRSIZ: usize = 14;
/// Size of a directory entry
pub const DIRENT_SIZE: usize = 2 + DIRSIZ;

/// On-disk inode type tags
pub const T_DIR: i16 = 1;
pub const T_FILE: i16 = 2;
pub const T_DEVICE: i16 = 3;

/// Superblock: seven 32-bit fields describing the disk layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Superblock {
    /// Size of the image in blocks
    pub size: u32,
    /// Number of data blocks
    pub nblocks: u32,
    /// Number of inodes
    pub ninodes: u32,
    /// Number of log blocks, header included
    pub nlog: u32,
    /// First log block (the header)
    pub logstart: u32,
    /// First inode-table block
    pub inodestart: u32,
    /// First bitmap block
    pub bmapstart: u32,
}

impl Superblock {
    /// Serialized size in bytes
    pub const SIZE: usize = 7 * 4;

    /// Read a superblock from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            size: reader.read_u32::<LittleEndian>()?,
            nblocks: reader.read_u32::<LittleEndian>()?,
            ninodes: reader.read_u32::<LittleEndian>()?,
            nlog: reader.read_u32::<LittleEndian>()?,
            logstart: reader.read_u32::<LittleEndian>()?,
            inodestart: reader.read_u32::<LittleEndian>()?,
            bmapstart: reader.read_u32::<LittleEndian>()?,
        })
    }

    /// Write the superblock to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.size)?;
        writer.write_u32::<LittleEndian>(self.nblocks)?;
        writer.write_u32::<LittleEndian>(self.ninodes)?;
        writer.write_u32::<LittleEndian>(self.nlog)?;
        writer.write_u32::<LittleEndian>(self.logstart)?;
        writer.write_u32::<LittleEndian>(self.inodestart)?;
        writer.write_u32::<LittleEndian>(self.bmapstart)?;
        Ok(())
    }

    /// Block holding inode `inum`
    pub fn inode_block(&self, inum: u32) -> u32 {
        inum / IPB + self.inodestart
    }

    /// Bitmap block holding the bit for block `b`
    pub fn bitmap_block(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }

    /// First data block
    pub fn data_start(&self) -> u32 {
        self.size - self.nblocks
    }

    /// Check the geometry against itself and the device it was read from.
    pub fn validate(&self, device_blocks: u64) -> Result<()> {
        let bad = |msg: String| Err(FsError::InvalidSuperblock(msg));

        if self.size == 0 || self.size as u64 > device_blocks {
            return bad(format!("size {} on a device of {} blocks", self.size, device_blocks));
        }
        if self.logstart <= SUPERBLOCK_NO || self.nlog < 2 {
            return bad(format!("log at {} with {} blocks", self.logstart, self.nlog));
        }
        if self.inodestart < self.logstart + self.nlog {
            return bad(format!("inode table at {} overlaps the log", self.inodestart));
        }
        let inode_blocks = self.ninodes / IPB + 1;
        if self.ninodes <= ROOTINO || self.bmapstart < self.inodestart + inode_blocks {
            return bad(format!(
                "{} inodes from block {} overlap the bitmap at {}",
                self.ninodes, self.inodestart, self.bmapstart
            ));
        }
        let bitmap_blocks = self.size / BPB + 1;
        if self.bmapstart + bitmap_blocks + self.nblocks != self.size {
            return bad(format!(
                "{} data blocks after the bitmap at {} do not fill {} blocks",
                self.nblocks, self.bmapstart, self.size
            ));
        }
        Ok(())
    }
}

/// Block numbers for every region, computed from a requested geometry
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub nlog: u32,
    pub ninodeblocks: u32,
    pub nbitmap: u32,
    /// Boot block, superblock, log, inodes, bitmap
    pub nmeta: u32,
}

impl Layout {
    /// Calculate the layout for an image of `size` blocks
    pub fn new(size: u32, ninodes: u32, nlog: u32) -> Self {
        let ninodeblocks = ninodes / IPB + 1;
        let nbitmap = size / BPB + 1;
        Self {
            nlog,
            ninodeblocks,
            nbitmap,
            nmeta: 2 + nlog + ninodeblocks + nbitmap,
        }
    }

    /// The superblock describing this layout
    pub fn superblock(&self, size: u32, ninodes: u32) -> Superblock {
        Superblock {
            size,
            nblocks: size.saturating_sub(self.nmeta),
            ninodes,
            nlog: self.nlog,
            logstart: 2,
            inodestart: 2 + self.nlog,
            bmapstart: 2 + self.nlog + self.ninodeblocks,
        }
    }
}

/// On-disk inode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dinode {
    /// File type; zero marks a free inode
    pub kind: i16,
    pub major: i16,
    pub minor: i16,
    /// Directory entries referring to this inode
    pub nlink: i16,
    /// Size in bytes
    pub size: u32,
    pub addrs: [u32; NADDRS],
}

impl Dinode {
    /// Byte offset of inode `inum` within its block
    pub fn offset(inum: u32) -> usize {
        (inum % IPB) as usize * DINODE_SIZE
    }

    /// Read an inode from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let kind = reader.read_i16::<LittleEndian>()?;
        let major = reader.read_i16::<LittleEndian>()?;
        let minor = reader.read_i16::<LittleEndian>()?;
        let nlink = reader.read_i16::<LittleEndian>()?;
        let size = reader.read_u32::<LittleEndian>()?;
        let mut addrs = [0u32; NADDRS];
        reader.read_u32_into::<LittleEndian>(&mut addrs)?;
        Ok(Self {
            kind,
            major,
            minor,
            nlink,
            size,
            addrs,
        })
    }

    /// Write the inode to a writer (exactly 64 bytes)
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_i16::<LittleEndian>(self.kind)?;
        writer.write_i16::<LittleEndian>(self.major)?;
        writer.write_i16::<LittleEndian>(self.minor)?;
        writer.write_i16::<LittleEndian>(self.nlink)?;
        writer.write_u32::<LittleEndian>(self.size)?;
        for addr in self.addrs {
            writer.write_u32::<LittleEndian>(addr)?;
        }
        Ok(())
    }
}

/// Fixed-length directory entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dirent {
    /// Zero marks a free entry
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

impl Dirent {
    /// Build an entry; names longer than [`DIRSIZ`] are rejected.
    pub fn new(inum: u16, name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.len() > DIRSIZ {
            return Err(FsError::NameTooLong);
        }
        let mut entry = Self {
            inum,
            name: [0; DIRSIZ],
        };
        entry.name[..bytes.len()].copy_from_slice(bytes);
        Ok(entry)
    }

    /// Parse a 16-byte entry
    pub fn from_bytes(data: &[u8; DIRENT_SIZE]) -> Self {
        let mut name = [0u8; DIRSIZ];
        name.copy_from_slice(&data[2..]);
        Self {
            inum: u16::from_le_bytes([data[0], data[1]]),
            name,
        }
    }

    /// Serialize into 16 bytes
    pub fn to_bytes(&self) -> [u8; DIRENT_SIZE] {
        let mut out = [0u8; DIRENT_SIZE];
        out[..2].copy_from_slice(&self.inum.to_le_bytes());
        out[2..].copy_from_slice(&self.name);
        out
    }

    /// Name bytes up to the first NUL
    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }

    /// Whether the entry is named `name`
    pub fn is_named(&self, name: &str) -> bool {
        self.name_bytes() == name.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_superblock_layout() {
        let layout = Layout::new(1000, 200, 31);
        let sb = layout.superblock(1000, 200);

        assert_eq!(sb.logstart, 2);
        assert_eq!(sb.inodestart, 33);
        assert_eq!(sb.bmapstart, 33 + 200 / IPB + 1);
        assert_eq!(sb.data_start(), sb.bmapstart + 1);
        sb.validate(1000).unwrap();
        assert!(sb.validate(999).is_err());

        let mut bytes = Vec::new();
        sb.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), Superblock::SIZE);
        assert_eq!(&bytes[16..20], &2u32.to_le_bytes());
        assert_eq!(Superblock::read_from(&mut Cursor::new(&bytes)).unwrap(), sb);
    }

    #[test]
    fn test_dinode_is_64_bytes() {
        let mut inode = Dinode {
            kind: T_FILE,
            nlink: 1,
            size: 5000,
            ..Default::default()
        };
        inode.addrs[NDIRECT] = 77;

        let mut bytes = Vec::new();
        inode.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), DINODE_SIZE);
        assert_eq!(&bytes[8..12], &5000u32.to_le_bytes());
        assert_eq!(&bytes[12 + NDIRECT * 4..16 + NDIRECT * 4], &77u32.to_le_bytes());
        assert_eq!(Dinode::read_from(&mut Cursor::new(&bytes)).unwrap(), inode);
    }

    #[test]
    fn test_dirent_names() {
        let entry = Dirent::new(7, "hello").unwrap();
        let parsed = Dirent::from_bytes(&entry.to_bytes());
        assert!(parsed.is_named("hello"));
        assert!(!parsed.is_named("hell"));
        assert_eq!(parsed.inum, 7);

        assert!(Dirent::new(1, "exactly14chars").is_ok());
        assert!(matches!(
            Dirent::new(1, "fifteen-chars-x"),
            Err(FsError::NameTooLong)
        ));
    }
}
