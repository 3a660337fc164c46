//! RAM-backed block device with power-loss simulation.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use super::blockdev_trait::{check_request, BlockDevice, Result, BLOCK_SIZE};

/// A block device held entirely in memory.
///
/// Writes can be cut off after a chosen count to model power failing in
/// the middle of a multi-block update; [`MemBlockDevice::snapshot`] then
/// hands back the image a rebooted machine would find.
pub struct MemBlockDevice {
    data: RwLock<Vec<u8>>,
    block_count: u64,
    writes: AtomicU64,
    /// Writes still allowed to land, when a power cut is armed
    budget: Mutex<Option<u64>>,
}

impl MemBlockDevice {
    /// Create a zero-filled device
    pub fn new(block_count: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; block_count as usize * BLOCK_SIZE]),
            block_count,
            writes: AtomicU64::new(0),
            budget: Mutex::new(None),
        }
    }

    /// Let `n` more writes through, then silently drop every later one.
    pub fn power_loss_after(&self, n: u64) {
        *self.budget.lock() = Some(n);
    }

    /// Whether an armed power cut has used up its write budget
    pub fn has_lost_power(&self) -> bool {
        matches!(*self.budget.lock(), Some(0))
    }

    /// Number of writes that reached the medium
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Copy of the current medium contents as a fresh, healthy device.
    pub fn snapshot(&self) -> Self {
        Self {
            data: RwLock::new(self.data.read().clone()),
            block_count: self.block_count,
            writes: AtomicU64::new(0),
            budget: Mutex::new(None),
        }
    }

    /// Raw view of one block, bypassing every cache
    pub fn block(&self, block_num: u64) -> Vec<u8> {
        let start = block_num as usize * BLOCK_SIZE;
        self.data.read()[start..start + BLOCK_SIZE].to_vec()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        check_request(block_num, self.block_count, buf.len())?;
        let start = block_num as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.data.read()[start..start + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        check_request(block_num, self.block_count, data.len())?;

        {
            let mut budget = self.budget.lock();
            match budget.as_mut() {
                Some(0) => {
                    log::debug!("power lost, dropping write of block {}", block_num);
                    return Ok(());
                }
                Some(left) => *left -= 1,
                None => {}
            }
        }

        let start = block_num as usize * BLOCK_SIZE;
        self.data.write()[start..start + BLOCK_SIZE].copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MemBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlockDevice")
            .field("block_count", &self.block_count)
            .field("writes", &self.writes.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_loss_drops_later_writes() {
        let device = MemBlockDevice::new(4);
        device.power_loss_after(1);

        device.write_block(0, &[1u8; BLOCK_SIZE]).unwrap();
        device.write_block(1, &[2u8; BLOCK_SIZE]).unwrap();

        assert!(device.has_lost_power());
        assert_eq!(device.write_count(), 1);

        let image = device.snapshot();
        assert_eq!(image.block(0), vec![1u8; BLOCK_SIZE]);
        assert_eq!(image.block(1), vec![0u8; BLOCK_SIZE]);
    }
}
