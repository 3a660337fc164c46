//! Format command for creating keelfs images

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::io::Write;
use std::path::PathBuf;

use keelfs::format::{format_ext2, format_simple, Ext2Geometry, SimpleGeometry};
use keelfs::vfs::FsKind;
use keelfs::{BlockDevice, FileBackedBlockDevice, BLOCK_SIZE};

/// Format a device or image file
#[derive(Parser, Debug)]
#[command(about = "Write an empty filesystem to a device or image file")]
pub struct FormatArgs {
    /// Device or image file to format
    pub device: PathBuf,

    /// Filesystem type: simple or ext2
    #[arg(short = 't', long = "type", default_value = "simple")]
    pub kind: FsKind,

    /// Create (or recreate) the image file with this size in MiB
    #[arg(short, long)]
    pub size: Option<u64>,

    /// Number of inodes (simple)
    #[arg(long)]
    pub ninodes: Option<u32>,

    /// Blocks per group (ext2)
    #[arg(long)]
    pub blocks_per_group: Option<u32>,

    /// Inodes per group (ext2)
    #[arg(long)]
    pub inodes_per_group: Option<u32>,

    /// Volume label (ext2)
    #[arg(short = 'L', long)]
    pub label: Option<String>,

    /// Force formatting without confirmation
    #[arg(short, long)]
    pub force: bool,
}

fn confirm(args: &FormatArgs) -> Result<bool> {
    println!(
        "WARNING: This will format {} as a {} filesystem.",
        args.device.display(),
        args.kind
    );
    println!("This operation will DESTROY ALL DATA on the device!");
    print!("Are you sure you want to continue? [y/N] ");
    std::io::stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .context("Failed to read confirmation")?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn open_device(args: &FormatArgs) -> Result<FileBackedBlockDevice> {
    match args.size {
        Some(mib) => {
            let bytes = mib
                .checked_mul(1024 * 1024)
                .ok_or_else(|| anyhow!("Requested size is too large"))?;
            info!("Creating {} ({} MiB)", args.device.display(), mib);
            FileBackedBlockDevice::create(&args.device, bytes)
                .with_context(|| format!("Failed to create image {}", args.device.display()))
        }
        None => {
            if !args.device.exists() {
                return Err(anyhow!(
                    "Device {:?} does not exist; pass --size to create an image",
                    args.device
                ));
            }
            FileBackedBlockDevice::open(&args.device, false)
                .with_context(|| format!("Failed to open device {}", args.device.display()))
        }
    }
}

pub fn run(args: FormatArgs) -> Result<()> {
    info!("keelfs format v{}", env!("CARGO_PKG_VERSION"));

    // Confirm before touching an existing device
    if args.device.exists() && !args.force && !confirm(&args)? {
        println!("Operation cancelled.");
        return Ok(());
    }

    let device = open_device(&args)?;
    let blocks = device.block_count();
    info!(
        "Formatting {} as {} ({} blocks of {} bytes)",
        args.device.display(),
        args.kind,
        blocks,
        BLOCK_SIZE
    );

    match args.kind {
        FsKind::Simple => {
            let mut geometry = SimpleGeometry::default();
            if let Some(ninodes) = args.ninodes {
                geometry.ninodes = ninodes;
            }
            let sb = format_simple(&device, &geometry)
                .with_context(|| format!("Failed to format device: {}", args.device.display()))?;
            println!(
                "{}: simple filesystem, {} blocks, {} data blocks, {} inodes, {} log blocks",
                args.device.display(),
                sb.size,
                sb.nblocks,
                sb.ninodes,
                sb.nlog
            );
        }
        FsKind::Ext2 => {
            let mut geometry = Ext2Geometry::default();
            if let Some(bpg) = args.blocks_per_group {
                geometry.blocks_per_group = bpg;
            }
            if let Some(ipg) = args.inodes_per_group {
                geometry.inodes_per_group = ipg;
            }
            if let Some(label) = &args.label {
                geometry.volume_name = label.clone();
            }
            let sb = format_ext2(&device, &geometry)
                .with_context(|| format!("Failed to format device: {}", args.device.display()))?;
            println!(
                "{}: ext2 filesystem, {} blocks in {} groups, {} inodes, {} free blocks",
                args.device.display(),
                sb.blocks_count,
                sb.group_count(),
                sb.inodes_count,
                sb.free_blocks_count
            );
        }
    }
    device.sync().context("Failed to sync device")?;

    info!("Successfully formatted {}", args.device.display());
    Ok(())
}
