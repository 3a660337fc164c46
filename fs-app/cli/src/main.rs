//! keelfs command line interface
//!
//! Image tool for Simple and ext2 filesystems: format an image, inspect it,
//! and move files in and out through the storage stack.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use std::path::PathBuf;

mod commands;

/// keelfs - kernel storage stack image tool
#[derive(Parser)]
#[command(
    name = "keelfs",
    about = "keelfs command-line interface",
    version = env!("CARGO_PKG_VERSION"),
    author = "keelfs contributors"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Storage stack sizing (JSON); defaults apply to missing fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an empty filesystem to a device or image file
    Format(commands::format::FormatArgs),

    /// Show superblock counters of an image
    Inspect(commands::inspect::InspectArgs),

    /// List a directory
    Ls(commands::files::LsArgs),

    /// Print a file to stdout
    Cat(commands::files::CatArgs),

    /// Copy a host file into an image
    Put(commands::files::PutArgs),

    /// Create a directory
    Mkdir(commands::files::MkdirArgs),

    /// Remove a file or an empty directory
    Rm(commands::files::RmArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .init();

    info!("keelfs CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = commands::load_config(cli.config.as_deref())?;

    // Execute the appropriate command
    match cli.command {
        Commands::Format(args) => commands::format::run(args),
        Commands::Inspect(args) => commands::inspect::run(args, config),
        Commands::Ls(args) => commands::files::ls(args, config),
        Commands::Cat(args) => commands::files::cat(args, config),
        Commands::Put(args) => commands::files::put(args, config),
        Commands::Mkdir(args) => commands::files::mkdir(args, config),
        Commands::Rm(args) => commands::files::rm(args, config),
    }
}
