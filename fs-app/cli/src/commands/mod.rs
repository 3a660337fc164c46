//! Subcommands and the image plumbing they share

pub mod files;
pub mod format;
pub mod inspect;

use anyhow::{Context, Result};
use clap::Args;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keelfs::ext2::disk::{EXT2_SUPER_MAGIC, SUPERBLOCK_OFFSET};
use keelfs::vfs::{FsKind, Vfs};
use keelfs::{BlockDevice, DeviceId, FileBackedBlockDevice, StorageConfig};

/// Device number the image is registered under
const IMAGE_DEV: DeviceId = DeviceId(1);

/// Offset of `s_magic` inside the ext2 superblock
const MAGIC_OFFSET: usize = SUPERBLOCK_OFFSET + 56;

/// The image a subcommand works on
#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Device or image file
    pub image: PathBuf,

    /// Filesystem type (simple or ext2); detected when omitted
    #[arg(short = 't', long = "type")]
    pub kind: Option<FsKind>,
}

pub fn load_config(path: Option<&Path>) -> Result<StorageConfig> {
    match path {
        Some(path) => StorageConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(StorageConfig::default()),
    }
}

/// ext2 carries a magic number; anything else is taken to be Simple.
fn detect_kind(device: &dyn BlockDevice) -> Result<FsKind> {
    let mut block = vec![0u8; keelfs::BLOCK_SIZE];
    device.read_block(0, &mut block).context("Failed to read block 0")?;
    let magic = u16::from_le_bytes([block[MAGIC_OFFSET], block[MAGIC_OFFSET + 1]]);
    Ok(if magic == EXT2_SUPER_MAGIC { FsKind::Ext2 } else { FsKind::Simple })
}

/// Open the image and mount it as the root filesystem.
pub fn open_image(args: &ImageArgs, config: StorageConfig) -> Result<Vfs> {
    let device = FileBackedBlockDevice::open(&args.image, false)
        .with_context(|| format!("Failed to open {}", args.image.display()))?;
    let kind = match args.kind {
        Some(kind) => kind,
        None => detect_kind(&device)?,
    };
    info!("Opening {} as {}", args.image.display(), kind);

    let vfs = Vfs::new(config).context("Invalid storage configuration")?;
    vfs.register_device(IMAGE_DEV, Arc::new(device))?;
    vfs.mount_root(IMAGE_DEV, kind)
        .with_context(|| format!("Failed to mount {} as {}", args.image.display(), kind))?;
    Ok(vfs)
}

/// Run `f` against the mounted image, unmounting afterwards either way.
pub fn with_image<T>(args: &ImageArgs, config: StorageConfig, f: impl FnOnce(&Vfs) -> Result<T>) -> Result<T> {
    let vfs = open_image(args, config)?;
    let result = f(&vfs);
    vfs.shutdown().context("Failed to unmount image")?;
    result
}
