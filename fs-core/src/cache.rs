//! Disk buffer cache
//!
//! A fixed pool of block-sized buffers keyed by (device, block number). It
//! is the only path to the devices: every backend and the log read and write
//! through [`BufGuard`]s handed out here.
//!
//! Two lock levels protect the pool. The state mutex guards bookkeeping only
//! (identity, reference counts, valid/dirty bits, recency order) and is never
//! held across a wait. Each slot also has a content lock that is held for as
//! long as a caller owns the buffer, including across device transfers.

use lru::LruCache;
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::blockdev::{DeviceId, DeviceTable, BLOCK_SIZE};
use crate::config::CacheConfig;
use crate::fatal;

type BlockKey = (DeviceId, u32);

#[derive(Debug, Default)]
struct BufMeta {
    key: Option<BlockKey>,
    /// Holders, waiters and log pins
    refcnt: u32,
    /// Payload has been filled from the device
    valid: bool,
    /// Payload differs from the device and is owed to a commit
    dirty: bool,
}

struct CacheState {
    meta: Vec<BufMeta>,
    /// Identity to slot, most recently used first
    index: LruCache<BlockKey, usize>,
    /// Slots that have never held a block
    never_used: Vec<usize>,
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Acquires served from memory
    pub hits: u64,
    /// Acquires that read the device
    pub misses: u64,
    /// Write-throughs to home locations
    pub writes: u64,
}

/// Fixed pool of block buffers shared by every mounted device
pub struct BlockCache {
    devices: Arc<DeviceTable>,
    state: Mutex<CacheState>,
    slots: Box<[Mutex<Box<[u8]>>]>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

/// Exclusive access to one cached block.
///
/// Dropping the guard releases the buffer back to the recency list without
/// writing it anywhere.
pub struct BufGuard<'a> {
    cache: &'a BlockCache,
    slot: usize,
    dev: DeviceId,
    blockno: u32,
    data: MutexGuard<'a, Box<[u8]>>,
}

impl BlockCache {
    /// Create a cache with `config.nbuf` buffers over the given devices
    pub fn new(devices: Arc<DeviceTable>, config: &CacheConfig) -> Self {
        let nbuf = config.nbuf.max(1);
        let slots = (0..nbuf)
            .map(|_| Mutex::new(vec![0u8; BLOCK_SIZE].into_boxed_slice()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            devices,
            state: Mutex::new(CacheState {
                meta: (0..nbuf).map(|_| BufMeta::default()).collect(),
                index: LruCache::unbounded(),
                never_used: (0..nbuf).rev().collect(),
            }),
            slots,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Device registry the cache transfers through
    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    /// Number of buffers in the pool
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Return a locked buffer holding the current contents of the block,
    /// sleeping while another holder owns it.
    pub fn acquire(&self, dev: DeviceId, blockno: u32) -> BufGuard<'_> {
        let slot = self.claim_slot((dev, blockno));

        let data = self.slots[slot].lock();
        let mut guard = BufGuard {
            cache: self,
            slot,
            dev,
            blockno,
            data,
        };

        let valid = self.state.lock().meta[slot].valid;
        if valid {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self
                .devices
                .transfer(dev, blockno as u64, &mut guard.data, false)
            {
                fatal!("read of {} block {} failed: {}", dev, blockno, e);
            }
            self.state.lock().meta[slot].valid = true;
        }

        guard
    }

    /// Find the slot for `key`, recycling the least recently used
    /// unreferenced buffer on a miss. Takes a reference on the slot.
    fn claim_slot(&self, key: BlockKey) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(&slot) = state.index.get(&key) {
            state.meta[slot].refcnt += 1;
            return slot;
        }

        let slot = match state.never_used.pop() {
            Some(slot) => slot,
            None => {
                let victim = state
                    .index
                    .iter()
                    .rev()
                    .find(|(_, slot)| state.meta[**slot].refcnt == 0)
                    .map(|(old_key, slot)| (*old_key, *slot));

                let (old_key, slot) = match victim {
                    Some(v) => v,
                    None => fatal!("buffer cache: all {} buffers are in use", self.slots.len()),
                };
                if state.meta[slot].dirty {
                    fatal!(
                        "buffer cache: evicting uncommitted {} block {}",
                        old_key.0,
                        old_key.1
                    );
                }
                state.index.pop(&old_key);
                slot
            }
        };

        state.meta[slot] = BufMeta {
            key: Some(key),
            refcnt: 1,
            valid: false,
            dirty: false,
        };
        state.index.put(key, slot);
        slot
    }

    /// Write the buffer to its home location before returning.
    fn write_through(&self, buf: &mut BufGuard<'_>) {
        self.state.lock().meta[buf.slot].dirty = true;
        if let Err(e) = self
            .devices
            .transfer(buf.dev, buf.blockno as u64, &mut buf.data, true)
        {
            fatal!("write of {} block {} failed: {}", buf.dev, buf.blockno, e);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.state.lock().meta[buf.slot].dirty = false;
    }

    /// Record that the buffer carries writes the device has not seen yet.
    pub fn mark_dirty(&self, buf: &BufGuard<'_>) {
        self.state.lock().meta[buf.slot].dirty = true;
    }

    /// Keep the buffer resident until a matching [`BlockCache::unpin`].
    pub fn pin(&self, buf: &BufGuard<'_>) {
        self.state.lock().meta[buf.slot].refcnt += 1;
    }

    /// Load a block and keep it resident.
    pub fn pin_block(&self, dev: DeviceId, blockno: u32) {
        let buf = self.acquire(dev, blockno);
        self.pin(&buf);
    }

    /// Drop a pin taken with [`BlockCache::pin`] or [`BlockCache::pin_block`].
    pub fn unpin(&self, dev: DeviceId, blockno: u32) {
        let mut state = self.state.lock();
        let slot = match state.index.peek(&(dev, blockno)) {
            Some(&slot) => slot,
            None => fatal!("unpin of {} block {} which is not cached", dev, blockno),
        };
        let meta = &mut state.meta[slot];
        if meta.refcnt == 0 {
            fatal!("unpin of {} block {} which is not pinned", dev, blockno);
        }
        meta.refcnt -= 1;
    }

    /// Whether the block currently occupies a buffer
    pub fn is_resident(&self, dev: DeviceId, blockno: u32) -> bool {
        self.state.lock().index.contains(&(dev, blockno))
    }

    /// Whether the block is cached with writes owed to a commit
    pub fn is_dirty(&self, dev: DeviceId, blockno: u32) -> bool {
        let state = self.state.lock();
        state
            .index
            .peek(&(dev, blockno))
            .map(|&slot| state.meta[slot].dirty)
            .unwrap_or(false)
    }

    /// Forget every unreferenced buffer of `dev`. Returns how many were dropped.
    pub fn purge_device(&self, dev: DeviceId) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let doomed: Vec<(BlockKey, usize)> = state
            .index
            .iter()
            .filter(|(key, _)| key.0 == dev)
            .map(|(key, slot)| (*key, *slot))
            .collect();

        let mut dropped = 0;
        for (key, slot) in doomed {
            let meta = &mut state.meta[slot];
            if meta.refcnt != 0 {
                continue;
            }
            if meta.dirty {
                fatal!("purging uncommitted {} block {}", key.0, key.1);
            }
            *meta = BufMeta::default();
            state.index.pop(&key);
            state.never_used.push(slot);
            dropped += 1;
        }
        log::debug!("purged {} cached blocks of {}", dropped, dev);
        dropped
    }

    /// Snapshot of the hit/miss counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    fn release(&self, slot: usize) {
        let mut state = self.state.lock();
        let key = {
            let meta = &mut state.meta[slot];
            if meta.refcnt == 0 {
                fatal!("release of an unreferenced buffer");
            }
            meta.refcnt -= 1;
            meta.key
        };
        if let Some(key) = key {
            // a lookup moves the entry to the most recently used end
            state.index.get(&key);
        }
    }
}

impl<'a> BufGuard<'a> {
    /// Device the block lives on
    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    /// Block number on the device
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// Durably write the payload to its home location, bypassing the log.
    pub fn flush(&mut self) {
        let cache = self.cache;
        cache.write_through(self);
    }
}

impl Deref for BufGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for BufGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        // The content lock is still held here; a slot recycled in between
        // starts invalid, so the next owner rereads the device.
        self.cache.release(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::{BlockDevice, MemBlockDevice};
    use std::thread;

    const DEV: DeviceId = DeviceId(1);

    fn setup(nbuf: usize, blocks: u64) -> (Arc<MemBlockDevice>, BlockCache) {
        let device = Arc::new(MemBlockDevice::new(blocks));
        let devices = Arc::new(DeviceTable::new());
        devices.register(DEV, device.clone()).unwrap();
        (device, BlockCache::new(devices, &CacheConfig { nbuf }))
    }

    #[test]
    fn test_cache_read_write() {
        let (device, cache) = setup(4, 8);

        device.write_block(3, &[0x55; BLOCK_SIZE]).unwrap();
        {
            let buf = cache.acquire(DEV, 3);
            assert_eq!(&buf[..], &[0x55; BLOCK_SIZE][..]);
        }

        {
            let mut buf = cache.acquire(DEV, 2);
            buf.fill(0xAA);
            buf.flush();
        }
        assert_eq!(device.block(2), vec![0xAA; BLOCK_SIZE]);

        // second acquire is served from memory
        let before = cache.stats();
        drop(cache.acquire(DEV, 2));
        assert_eq!(cache.stats().hits, before.hits + 1);
    }

    #[test]
    fn test_release_does_not_write_back() {
        let (device, cache) = setup(4, 8);
        {
            let mut buf = cache.acquire(DEV, 1);
            buf[0] = 9;
        }
        assert_eq!(device.block(1)[0], 0);
        assert_eq!(cache.acquire(DEV, 1)[0], 9);
    }

    #[test]
    fn test_cache_eviction_is_lru() {
        let (_device, cache) = setup(2, 8);

        drop(cache.acquire(DEV, 0));
        drop(cache.acquire(DEV, 1));
        drop(cache.acquire(DEV, 0));
        drop(cache.acquire(DEV, 2));

        assert!(cache.is_resident(DEV, 0));
        assert!(!cache.is_resident(DEV, 1));
        assert!(cache.is_resident(DEV, 2));
    }

    #[test]
    fn test_pinned_buffer_survives_eviction() {
        let (_device, cache) = setup(2, 8);
        cache.pin_block(DEV, 5);

        for b in 0..4 {
            drop(cache.acquire(DEV, b));
        }
        assert!(cache.is_resident(DEV, 5));

        cache.unpin(DEV, 5);
        drop(cache.acquire(DEV, 6));
        drop(cache.acquire(DEV, 7));
        assert!(!cache.is_resident(DEV, 5));
    }

    #[test]
    #[should_panic(expected = "evicting uncommitted")]
    fn test_evicting_dirty_buffer_is_fatal() {
        let (_device, cache) = setup(1, 8);
        {
            let buf = cache.acquire(DEV, 0);
            cache.mark_dirty(&buf);
        }
        drop(cache.acquire(DEV, 1));
    }

    #[test]
    #[should_panic(expected = "buffers are in use")]
    fn test_exhausted_pool_is_fatal() {
        let (_device, cache) = setup(1, 8);
        let _held = cache.acquire(DEV, 0);
        drop(cache.acquire(DEV, 1));
    }

    #[test]
    fn test_concurrent_acquire_shares_one_buffer() {
        let (_device, cache) = setup(4, 8);
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let mut buf = cache.acquire(DEV, 4);
                        let n = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) + 1;
                        buf[..4].copy_from_slice(&n.to_le_bytes());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let buf = cache.acquire(DEV, 4);
        assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 8 * 200);
    }
}
