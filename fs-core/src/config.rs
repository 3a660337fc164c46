//! Sizing of the process-wide storage services.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::blockdev::BLOCK_SIZE;
use crate::error::{FsError, Result};

/// Buffer cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of block buffers in the pool
    pub nbuf: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { nbuf: 64 }
    }
}

/// Write-ahead log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Most distinct blocks a single operation may write
    pub max_op_blocks: usize,
    /// Most distinct blocks one committed transaction may carry
    pub log_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_op_blocks: 10,
            log_size: 30,
        }
    }
}

impl LogConfig {
    /// Header entries that fit behind the 4-byte count
    pub const HEADER_CAPACITY: usize = (BLOCK_SIZE - 4) / 4;

    /// Blocks the on-disk log region must span: header plus bodies
    pub fn region_blocks(&self) -> usize {
        self.log_size + 1
    }
}

/// Top-level storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Buffer cache sizing
    pub cache: CacheConfig,
    /// Log sizing, shared by every logged device
    pub log: LogConfig,
    /// Slots in the shared in-memory inode table
    pub inode_cache_size: usize,
    /// Filesystems that may be mounted at once, root included
    pub max_mounts: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            log: LogConfig::default(),
            inode_cache_size: 50,
            max_mounts: 8,
        }
    }
}

impl StorageConfig {
    /// Load a configuration from a JSON file; missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| FsError::InvalidArgument(format!("config {}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject sizings under which a full transaction could not be served.
    pub fn validate(&self) -> Result<()> {
        let log = &self.log;
        if log.max_op_blocks == 0 || log.log_size < log.max_op_blocks {
            return Err(FsError::InvalidArgument(format!(
                "log_size {} must hold at least one operation of {} blocks",
                log.log_size, log.max_op_blocks
            )));
        }
        if log.log_size > LogConfig::HEADER_CAPACITY {
            return Err(FsError::InvalidArgument(format!(
                "log_size {} exceeds header capacity {}",
                log.log_size,
                LogConfig::HEADER_CAPACITY
            )));
        }
        // pinned transaction blocks plus the working set of one operation
        if self.cache.nbuf < log.log_size + log.max_op_blocks {
            return Err(FsError::InvalidArgument(format!(
                "nbuf {} cannot hold a full log ({}) plus one operation ({})",
                self.cache.nbuf, log.log_size, log.max_op_blocks
            )));
        }
        if self.inode_cache_size == 0 || self.max_mounts == 0 {
            return Err(FsError::InvalidArgument(
                "inode_cache_size and max_mounts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
