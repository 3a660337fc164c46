//! Image formatting for both on-disk formats
//!
//! Formatting writes straight to the device, below the buffer cache; the
//! device must not be registered with a running stack while it is
//! formatted.

mod ext2;

use serde::{Deserialize, Serialize};

use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::config::LogConfig;
use crate::error::{FsError, Result};
use crate::layout::{Dinode, Dirent, Layout, Superblock, BPB, DIRENT_SIZE, ROOTINO, SUPERBLOCK_NO, T_DIR};

pub use self::ext2::{format_ext2, Ext2Geometry};

/// Geometry of a Simple image
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpleGeometry {
    /// Image size in blocks; the whole device when unset
    pub size: Option<u32>,
    /// Number of on-disk inodes
    pub ninodes: u32,
    /// Log region length, header included
    pub nlog: u32,
}

impl Default for SimpleGeometry {
    fn default() -> Self {
        Self {
            size: None,
            ninodes: 200,
            nlog: LogConfig::default().region_blocks() as u32,
        }
    }
}

/// Write an empty Simple filesystem: boot block, superblock, zeroed log,
/// inode table and bitmap, and a root directory holding "." and "..".
pub fn format_simple(device: &dyn BlockDevice, geometry: &SimpleGeometry) -> Result<Superblock> {
    let device_blocks = device.block_count().min(u32::MAX as u64) as u32;
    let size = geometry.size.unwrap_or(device_blocks);
    if size > device_blocks {
        return Err(FsError::InvalidArgument(format!(
            "image of {} blocks on a device of {}",
            size, device_blocks
        )));
    }
    if geometry.ninodes <= ROOTINO || geometry.ninodes > u16::MAX as u32 + 1 {
        return Err(FsError::InvalidArgument(format!(
            "inode count {} out of range",
            geometry.ninodes
        )));
    }

    let layout = Layout::new(size, geometry.ninodes, geometry.nlog);
    if layout.nmeta + 1 >= size || geometry.nlog < 2 {
        return Err(FsError::InvalidArgument(format!(
            "{} blocks cannot hold {} metadata blocks and a root directory",
            size, layout.nmeta
        )));
    }
    let sb = layout.superblock(size, geometry.ninodes);

    let zero = vec![0u8; BLOCK_SIZE];
    for b in 0..layout.nmeta {
        device.write_block(b as u64, &zero)?;
    }

    let mut block = vec![0u8; BLOCK_SIZE];
    sb.write_to(&mut &mut block[..])?;
    device.write_block(SUPERBLOCK_NO as u64, &block)?;

    // root directory: one data block right after the metadata
    let root_block = layout.nmeta;
    let mut dir = vec![0u8; BLOCK_SIZE];
    dir[..DIRENT_SIZE].copy_from_slice(&Dirent::new(ROOTINO as u16, ".")?.to_bytes());
    dir[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(&Dirent::new(ROOTINO as u16, "..")?.to_bytes());
    device.write_block(root_block as u64, &dir)?;

    let mut root = Dinode {
        kind: T_DIR,
        nlink: 1,
        size: BLOCK_SIZE as u32,
        ..Default::default()
    };
    root.addrs[0] = root_block;
    let mut inodes = vec![0u8; BLOCK_SIZE];
    let off = Dinode::offset(ROOTINO);
    root.write_to(&mut &mut inodes[off..])?;
    device.write_block(sb.inode_block(ROOTINO) as u64, &inodes)?;

    // every block up to and including the root directory is in use
    let used = root_block + 1;
    for base in (0..used).step_by(BPB as usize) {
        let mut bitmap = vec![0u8; BLOCK_SIZE];
        for bit in 0..(used - base).min(BPB) as usize {
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
        device.write_block(sb.bitmap_block(base) as u64, &bitmap)?;
    }

    device.sync()?;
    log::info!(
        "formatted simple image: {} blocks ({} meta, {} data), {} inodes, log {}",
        sb.size,
        layout.nmeta,
        sb.nblocks,
        sb.ninodes,
        sb.nlog
    );
    Ok(sb)
}
