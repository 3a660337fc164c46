//! File and directory commands run through the mounted image

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;

use keelfs::vfs::InodeKind;
use keelfs::StorageConfig;

use super::{with_image, ImageArgs};

#[derive(Parser, Debug)]
pub struct LsArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Directory inside the image
    #[arg(default_value = "/")]
    pub path: String,

    /// Show inode number, type, links and size
    #[arg(short, long)]
    pub long: bool,
}

#[derive(Parser, Debug)]
pub struct CatArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// File inside the image
    pub path: String,
}

#[derive(Parser, Debug)]
pub struct PutArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Host file to copy
    pub source: PathBuf,

    /// Destination inside the image
    pub dest: String,
}

#[derive(Parser, Debug)]
pub struct MkdirArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Directory to create
    pub path: String,
}

#[derive(Parser, Debug)]
pub struct RmArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// File or empty directory to remove
    pub path: String,
}

fn kind_char(kind: InodeKind) -> char {
    match kind {
        InodeKind::Dir => 'd',
        InodeKind::File => '-',
        InodeKind::Device => 'c',
        InodeKind::Symlink => 'l',
        InodeKind::Free => '?',
    }
}

fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

pub fn ls(args: LsArgs, config: StorageConfig) -> Result<()> {
    with_image(&args.image, config, |vfs| {
        let mut entries = vfs
            .read_dir(&args.path)
            .with_context(|| format!("Failed to list {}", args.path))?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in entries {
            if !args.long {
                println!("{}", entry.name);
                continue;
            }
            let st = vfs.stat(&join(&args.path, &entry.name))?;
            println!(
                "{}{:>8} {:>3} {:>10}  {}",
                kind_char(st.kind),
                st.inum,
                st.nlink,
                st.size,
                entry.name
            );
        }
        Ok(())
    })
}

pub fn cat(args: CatArgs, config: StorageConfig) -> Result<()> {
    let data = with_image(&args.image, config, |vfs| {
        let size = vfs.stat(&args.path)?.size;
        let len = usize::try_from(size).map_err(|_| anyhow!("{} is too large to read", args.path))?;
        Ok(vfs.read_file(&args.path, 0, len)?)
    })?;
    std::io::stdout()
        .write_all(&data)
        .context("Failed to write to stdout")?;
    Ok(())
}

pub fn put(args: PutArgs, config: StorageConfig) -> Result<()> {
    let data = std::fs::read(&args.source)
        .with_context(|| format!("Failed to read {}", args.source.display()))?;
    with_image(&args.image, config, |vfs| {
        vfs.create(&args.dest, InodeKind::File)
            .with_context(|| format!("Failed to create {}", args.dest))?;
        vfs.truncate(&args.dest)?;
        let written = vfs.write_file(&args.dest, 0, &data)?;
        if written < data.len() {
            return Err(anyhow!(
                "image full: wrote {} of {} bytes to {}",
                written,
                data.len(),
                args.dest
            ));
        }
        log::info!("Copied {} bytes to {}", written, args.dest);
        Ok(())
    })
}

pub fn mkdir(args: MkdirArgs, config: StorageConfig) -> Result<()> {
    with_image(&args.image, config, |vfs| {
        vfs.mkdir(&args.path)
            .with_context(|| format!("Failed to create directory {}", args.path))
    })
}

pub fn rm(args: RmArgs, config: StorageConfig) -> Result<()> {
    with_image(&args.image, config, |vfs| {
        vfs.unlink(&args.path)
            .with_context(|| format!("Failed to remove {}", args.path))
    })
}
