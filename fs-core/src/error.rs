//! Error types shared by every layer of the storage stack.
//!
//! Only conditions the caller can act on are represented here: allocation
//! failure, lookups that miss, and argument problems. Anything that means an
//! on-disk or in-memory structure is inconsistent goes through [`fatal!`]
//! instead, because continuing would spread the corruption.

use thiserror::Error;

use crate::blockdev::BlockDeviceError;

/// Filesystem error type
#[derive(Error, Debug)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] BlockDeviceError),
    #[error("Invalid superblock: {0}")]
    InvalidSuperblock(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("No free blocks")]
    NoSpace,
    #[error("No free inodes")]
    NoInodes,
    #[error("No free slots in the {0}")]
    NoResources(&'static str),
    #[error("File or directory not found")]
    NotFound,
    #[error("File or directory already exists")]
    AlreadyExists,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Is a directory")]
    IsADirectory,
    #[error("Directory not empty")]
    DirectoryNotEmpty,
    #[error("File name too long")]
    NameTooLong,
    #[error("Invalid path")]
    InvalidPath,
    #[error("File too large")]
    FileTooLarge,
    #[error("Too many links")]
    TooManyLinks,
    #[error("Device or mount point busy")]
    Busy,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(BlockDeviceError::Io(err))
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, FsError>;

/// Halt on a broken invariant.
///
/// The stack has no repair path, so corruption and caller misuse stop the
/// system after recording what was seen.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::log::error!("fatal: {}", format_args!($($arg)+));
        panic!($($arg)+)
    }};
}
