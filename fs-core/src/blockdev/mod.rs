//! Block device I/O for the storage stack

mod blockdev_trait;
mod memory;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// Re-export the block device trait and related types
pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};
pub use self::memory::MemBlockDevice;

/// Identifier of a registered device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// A block device that is backed by a file on the filesystem
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<File>,
    path: PathBuf,
    size: u64,
    block_count: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create a new file-backed block device
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.set_len(size)?;

        Ok(Self {
            file: Mutex::new(file),
            path,
            size,
            block_count: size / BLOCK_SIZE as u64,
            read_only: false,
        })
    }

    /// Open an existing file-backed block device
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;

        // Handles both image files and raw block devices
        let size = Self::device_size(&path)?;

        Ok(Self {
            file: Mutex::new(file),
            path,
            size,
            block_count: size / BLOCK_SIZE as u64,
            read_only,
        })
    }

    #[cfg(unix)]
    fn device_size(path: &Path) -> Result<u64> {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = File::open(path)?;

        // BLKGETSIZE64 = 0x80081272 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size as *mut u64) };
        if result == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }

        Ok(size)
    }

    #[cfg(not(unix))]
    fn device_size(path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    /// Get the total size of the device in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path the device was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileBackedBlockDevice {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        blockdev_trait::check_request(block_num, self.block_count, buf.len())?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block_num * BLOCK_SIZE as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        blockdev_trait::check_request(block_num, self.block_count, data.len())?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block_num * BLOCK_SIZE as u64))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Registry of the devices the cache may transfer to.
#[derive(Default)]
pub struct DeviceTable {
    devices: RwLock<BTreeMap<DeviceId, Arc<dyn BlockDevice>>>,
}

impl DeviceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device under the given identifier
    pub fn register(&self, dev: DeviceId, device: Arc<dyn BlockDevice>) -> Result<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(&dev) {
            return Err(BlockDeviceError::AlreadyRegistered(dev.0));
        }
        log::info!("registered {} ({} blocks)", dev, device.block_count());
        devices.insert(dev, device);
        Ok(())
    }

    /// Look up a registered device
    pub fn get(&self, dev: DeviceId) -> Result<Arc<dyn BlockDevice>> {
        self.devices
            .read()
            .get(&dev)
            .cloned()
            .ok_or(BlockDeviceError::UnknownDevice(dev.0))
    }

    /// Synchronously move one block between memory and the device.
    pub fn transfer(&self, dev: DeviceId, block_num: u64, buf: &mut [u8], is_write: bool) -> Result<()> {
        let device = self.get(dev)?;
        if is_write {
            device.write_block(block_num, buf)
        } else {
            device.read_block(block_num, buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_block_device_operations() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_device.bin");

        let device = FileBackedBlockDevice::create(&file_path, 4096 * 8).unwrap();

        let test_data = [0xAAu8; 4096];
        device.write_block(0, &test_data).unwrap();

        let mut read_buf = [0u8; 4096];
        device.read_block(0, &mut read_buf).unwrap();
        assert_eq!(test_data, read_buf);

        for i in 1..8 {
            let data = [i as u8; 4096];
            device.write_block(i, &data).unwrap();

            let mut read_data = [0u8; 4096];
            device.read_block(i, &mut read_data).unwrap();
            assert_eq!(data, read_data);
        }

        assert!(matches!(
            device.read_block(8, &mut read_buf),
            Err(BlockDeviceError::InvalidBlockNumber(8))
        ));
    }

    #[test]
    fn test_read_only() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_read_only.bin");

        let device = FileBackedBlockDevice::create(&file_path, 4096).unwrap();
        let test_data = [0x55u8; 4096];
        device.write_block(0, &test_data).unwrap();

        let read_only_device = FileBackedBlockDevice::open(&file_path, true).unwrap();

        let mut read_buf = [0u8; 4096];
        read_only_device.read_block(0, &mut read_buf).unwrap();
        assert_eq!(test_data, read_buf);

        let write_result = read_only_device.write_block(0, &[0u8; 4096]);
        assert!(matches!(write_result, Err(BlockDeviceError::ReadOnly)));
    }

    #[test]
    fn test_device_table_transfer() {
        let table = DeviceTable::new();
        table
            .register(DeviceId(1), Arc::new(MemBlockDevice::new(4)))
            .unwrap();
        assert!(table
            .register(DeviceId(1), Arc::new(MemBlockDevice::new(4)))
            .is_err());

        let mut buf = vec![7u8; BLOCK_SIZE];
        table.transfer(DeviceId(1), 2, &mut buf, true).unwrap();
        let mut back = vec![0u8; BLOCK_SIZE];
        table.transfer(DeviceId(1), 2, &mut back, false).unwrap();
        assert_eq!(buf, back);

        assert!(matches!(
            table.transfer(DeviceId(9), 0, &mut back, false),
            Err(BlockDeviceError::UnknownDevice(9))
        ));
    }
}
