//! Superblock summary of an image

use anyhow::{Context, Result};
use clap::Parser;

use keelfs::StorageConfig;

use super::{with_image, ImageArgs};

#[derive(Parser, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: InspectArgs, config: StorageConfig) -> Result<()> {
    let stats = with_image(&args.image, config, |vfs| Ok(vfs.statfs("/")?))?;

    if args.json {
        let text = serde_json::to_string_pretty(&stats).context("Failed to encode stats")?;
        println!("{}", text);
        return Ok(());
    }

    println!("type:          {}", stats.kind);
    println!("block size:    {}", stats.block_size);
    println!("blocks:        {} ({} free)", stats.total_blocks, stats.free_blocks);
    println!("inodes:        {} ({} free)", stats.total_inodes, stats.free_inodes);
    if let Some(log) = stats.log_blocks {
        println!("log blocks:    {}", log);
    }
    Ok(())
}
