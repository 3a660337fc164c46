//! Write-ahead logging for crash consistency
//!
//! Every block an operation modifies is registered with the log instead of
//! being written home. Operations running at the same time share one
//! transaction; when the last of them ends, the whole set is committed:
//!
//! 1. copy each block into its body slot in the log region,
//! 2. write the header listing the blocks (the commit point),
//! 3. copy each block to its home location,
//! 4. write an empty header.
//!
//! On mount, a non-empty header means step 2 happened but step 4 did not, so
//! the bodies are installed again. Installing twice is harmless.
//!
//! On-disk region: block `start` is the header (`n: u32` followed by `n`
//! block numbers, little endian); bodies follow at `start + 1 + i`.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

use crate::blockdev::DeviceId;
use crate::cache::{BlockCache, BufGuard};
use crate::config::LogConfig;
use crate::fatal;

/// Header block contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogHeader {
    /// Home block numbers of the committed transaction, in log order
    pub blocks: Vec<u32>,
}

impl LogHeader {
    /// Parse a header block
    pub fn from_bytes(data: &[u8]) -> Self {
        let n = LittleEndian::read_u32(&data[0..4]) as usize;
        if n > LogConfig::HEADER_CAPACITY {
            fatal!("log header lists {} blocks, capacity is {}", n, LogConfig::HEADER_CAPACITY);
        }
        let blocks = (0..n)
            .map(|i| LittleEndian::read_u32(&data[4 + i * 4..8 + i * 4]))
            .collect();
        Self { blocks }
    }

    /// Serialize into a header block; the rest of the block is zeroed.
    pub fn write_to(&self, data: &mut [u8]) {
        data.fill(0);
        LittleEndian::write_u32(&mut data[0..4], self.blocks.len() as u32);
        for (i, &b) in self.blocks.iter().enumerate() {
            LittleEndian::write_u32(&mut data[4 + i * 4..8 + i * 4], b);
        }
    }
}

#[derive(Debug, Default)]
struct LogState {
    /// Operations between begin_op and end_op
    outstanding: usize,
    committing: bool,
    /// Blocks of the open transaction, de-duplicated
    blocks: Vec<u32>,
    commits: u64,
    committed_blocks: u64,
}

/// Counters for one device's log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStats {
    /// Operations currently admitted
    pub outstanding: usize,
    /// Blocks registered in the open transaction
    pub pending: usize,
    /// Transactions that reached the commit point
    pub commits: u64,
    /// Blocks written by those transactions
    pub committed_blocks: u64,
    /// Blocks installed by recovery when the log was opened
    pub recovered: usize,
}

/// Write-ahead log of one device
pub struct Log {
    dev: DeviceId,
    cache: Arc<BlockCache>,
    /// Header block
    start: u32,
    /// Body slots usable by one transaction
    size: usize,
    max_op_blocks: usize,
    recovered: usize,
    state: Mutex<LogState>,
    /// Signalled when a commit finishes or an operation ends
    cond: Condvar,
}

/// An admitted operation.
///
/// Dropping it ends the operation; the last one to end commits the shared
/// transaction before the drop returns.
#[must_use = "dropping a transaction ends the operation immediately"]
pub struct Transaction {
    log: Arc<Log>,
}

impl Log {
    /// Attach to the log region `[start, start + nblocks)` of `dev` and
    /// replay any transaction a crash left committed but not installed.
    pub fn open(
        dev: DeviceId,
        cache: Arc<BlockCache>,
        start: u32,
        nblocks: u32,
        config: &LogConfig,
    ) -> Self {
        if nblocks < 2 {
            fatal!("log region of {} has {} blocks, need at least 2", dev, nblocks);
        }
        let size = config
            .log_size
            .min(nblocks as usize - 1)
            .min(LogConfig::HEADER_CAPACITY);
        if size < config.max_op_blocks {
            fatal!(
                "log of {} holds {} blocks, one operation may write {}",
                dev,
                size,
                config.max_op_blocks
            );
        }

        let mut log = Self {
            dev,
            cache,
            start,
            size,
            max_op_blocks: config.max_op_blocks,
            recovered: 0,
            state: Mutex::new(LogState::default()),
            cond: Condvar::new(),
        };
        log.recovered = log.recover();
        log
    }

    /// Device the log belongs to
    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    /// Blocks one transaction may carry
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Install a committed transaction left behind by a crash, then clear
    /// the header. Returns the number of blocks installed.
    fn recover(&self) -> usize {
        let header = self.read_head();
        let n = header.blocks.len();
        if n > self.size {
            fatal!("log header of {} lists {} blocks, log holds {}", self.dev, n, self.size);
        }
        if n > 0 {
            log::info!("{}: replaying {} logged blocks", self.dev, n);
            self.install_trans(&header.blocks, true);
            self.write_head(&[]);
        }
        n
    }

    /// Admit one operation, sleeping while a commit runs or while the open
    /// transaction might not have room for it.
    pub fn begin_op(self: &Arc<Self>) -> Transaction {
        let mut state = self.state.lock();
        loop {
            let reserved = state.blocks.len() + (state.outstanding + 1) * self.max_op_blocks;
            if state.committing || reserved > self.size {
                self.cond.wait(&mut state);
            } else {
                state.outstanding += 1;
                break;
            }
        }
        Transaction { log: self.clone() }
    }

    /// Register a modified buffer with the open transaction.
    ///
    /// The buffer is pinned and marked dirty so the cache keeps it until the
    /// commit installs it.
    pub fn log_write(&self, buf: &BufGuard<'_>) {
        if buf.dev() != self.dev {
            fatal!("log_write of {} block {} to the log of {}", buf.dev(), buf.blockno(), self.dev);
        }

        let mut state = self.state.lock();
        if state.outstanding < 1 {
            fatal!("log_write of {} block {} outside a transaction", self.dev, buf.blockno());
        }
        if !state.blocks.contains(&buf.blockno()) {
            if state.blocks.len() >= self.size {
                fatal!("transaction on {} is too big", self.dev);
            }
            state.blocks.push(buf.blockno());
            self.cache.pin(buf);
        }
        self.cache.mark_dirty(buf);
    }

    fn end_op(&self) {
        let do_commit = {
            let mut state = self.state.lock();
            if state.committing {
                fatal!("end_op on {} while committing", self.dev);
            }
            state.outstanding -= 1;
            if state.outstanding == 0 {
                state.committing = true;
                true
            } else {
                // begin_op may be waiting for the space this operation reserved
                self.cond.notify_all();
                false
            }
        };

        if do_commit {
            let blocks = std::mem::take(&mut self.state.lock().blocks);
            self.commit(&blocks);

            let mut state = self.state.lock();
            state.committing = false;
            if !blocks.is_empty() {
                state.commits += 1;
                state.committed_blocks += blocks.len() as u64;
            }
            self.cond.notify_all();
        }
    }

    fn commit(&self, blocks: &[u32]) {
        if blocks.is_empty() {
            return;
        }
        self.write_log(blocks);
        self.write_head(blocks);
        self.install_trans(blocks, false);
        self.write_head(&[]);
        log::debug!("{}: committed {} blocks", self.dev, blocks.len());
    }

    /// Copy the transaction's blocks from the cache into the body slots.
    fn write_log(&self, blocks: &[u32]) {
        for (i, &b) in blocks.iter().enumerate() {
            let mut to = self.cache.acquire(self.dev, self.start + 1 + i as u32);
            let from = self.cache.acquire(self.dev, b);
            to.copy_from_slice(&from);
            to.flush();
        }
    }

    /// Copy logged blocks to their home locations.
    fn install_trans(&self, blocks: &[u32], recovering: bool) {
        for (i, &b) in blocks.iter().enumerate() {
            let from = self.cache.acquire(self.dev, self.start + 1 + i as u32);
            let mut to = self.cache.acquire(self.dev, b);
            to.copy_from_slice(&from);
            to.flush();
            drop(to);
            if !recovering {
                self.cache.unpin(self.dev, b);
            }
        }
    }

    fn read_head(&self) -> LogHeader {
        let buf = self.cache.acquire(self.dev, self.start);
        LogHeader::from_bytes(&buf)
    }

    /// Write the header block. With a non-empty list this is the point at
    /// which the transaction becomes durable.
    fn write_head(&self, blocks: &[u32]) {
        let mut buf = self.cache.acquire(self.dev, self.start);
        LogHeader {
            blocks: blocks.to_vec(),
        }
        .write_to(&mut buf);
        buf.flush();
    }

    /// Snapshot of the log counters
    pub fn stats(&self) -> LogStats {
        let state = self.state.lock();
        LogStats {
            outstanding: state.outstanding,
            pending: state.blocks.len(),
            commits: state.commits,
            committed_blocks: state.committed_blocks,
            recovered: self.recovered,
        }
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("dev", &self.dev)
            .field("start", &self.start)
            .field("size", &self.size)
            .field("max_op_blocks", &self.max_op_blocks)
            .finish()
    }
}

impl Transaction {
    /// Log the transaction belongs to
    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    /// Register a modified buffer; see [`Log::log_write`].
    pub fn write(&self, buf: &BufGuard<'_>) {
        self.log.log_write(buf);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.log.end_op();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::{BlockDevice, DeviceTable, MemBlockDevice, BLOCK_SIZE};
    use crate::config::CacheConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    const DEV: DeviceId = DeviceId(1);
    const LOG_START: u32 = 2;
    const LOG_BLOCKS: u32 = 31;

    fn open_log(device: Arc<MemBlockDevice>) -> (Arc<BlockCache>, Arc<Log>) {
        let devices = Arc::new(DeviceTable::new());
        devices.register(DEV, device).unwrap();
        let cache = Arc::new(BlockCache::new(devices, &CacheConfig { nbuf: 64 }));
        let log = Log::open(DEV, cache.clone(), LOG_START, LOG_BLOCKS, &LogConfig::default());
        (cache, Arc::new(log))
    }

    fn write_block(cache: &BlockCache, tx: &Transaction, blockno: u32, fill: u8) {
        let mut buf = cache.acquire(DEV, blockno);
        buf.fill(fill);
        tx.write(&buf);
    }

    #[test]
    fn test_header_layout() {
        let mut block = vec![0xFFu8; BLOCK_SIZE];
        let header = LogHeader {
            blocks: vec![40, 7, 41],
        };
        header.write_to(&mut block);

        assert_eq!(&block[0..4], &3u32.to_le_bytes());
        assert_eq!(&block[4..8], &40u32.to_le_bytes());
        assert_eq!(&block[12..16], &41u32.to_le_bytes());
        assert!(block[16..].iter().all(|&b| b == 0));
        assert_eq!(LogHeader::from_bytes(&block), header);
    }

    #[test]
    fn test_commit_installs_and_clears_header() {
        let device = Arc::new(MemBlockDevice::new(64));
        let (cache, log) = open_log(device.clone());

        {
            let tx = log.begin_op();
            write_block(&cache, &tx, 40, 0xA1);
            write_block(&cache, &tx, 41, 0xB2);
            // nothing reaches the home location before the commit
            assert_eq!(device.block(40)[0], 0);
            assert!(cache.is_dirty(DEV, 40));
        }

        assert_eq!(device.block(40), vec![0xA1; BLOCK_SIZE]);
        assert_eq!(device.block(41), vec![0xB2; BLOCK_SIZE]);
        assert!(LogHeader::from_bytes(&device.block(LOG_START as u64)).blocks.is_empty());
        assert!(!cache.is_dirty(DEV, 40));
        assert_eq!(log.stats().commits, 1);
    }

    #[test]
    fn test_repeated_writes_are_logged_once() {
        let device = Arc::new(MemBlockDevice::new(64));
        let (cache, log) = open_log(device.clone());

        {
            let tx = log.begin_op();
            write_block(&cache, &tx, 40, 1);
            write_block(&cache, &tx, 40, 2);
            write_block(&cache, &tx, 40, 3);
            assert_eq!(log.stats().pending, 1);
        }

        assert_eq!(log.stats().committed_blocks, 1);
        assert_eq!(device.block(40), vec![3; BLOCK_SIZE]);
    }

    #[test]
    fn test_concurrent_operations_share_one_commit() {
        let device = Arc::new(MemBlockDevice::new(64));
        let (cache, log) = open_log(device.clone());

        let first = log.begin_op();
        let second = log.begin_op();
        write_block(&cache, &first, 40, 1);
        write_block(&cache, &second, 41, 2);

        drop(first);
        assert_eq!(log.stats().commits, 0);
        assert_eq!(device.block(40)[0], 0);

        drop(second);
        assert_eq!(log.stats().commits, 1);
        assert_eq!(device.block(40)[0], 1);
        assert_eq!(device.block(41)[0], 2);
    }

    #[test]
    fn test_begin_op_waits_for_log_space() {
        let device = Arc::new(MemBlockDevice::new(64));
        let (_cache, log) = open_log(device);

        // default sizing admits three operations of ten blocks into thirty
        let held: Vec<Transaction> = (0..3).map(|_| log.begin_op()).collect();
        assert_eq!(log.stats().outstanding, 3);

        let admitted = Arc::new(AtomicBool::new(false));
        let waiter = {
            let log = log.clone();
            let admitted = admitted.clone();
            thread::spawn(move || {
                let _tx = log.begin_op();
                admitted.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!admitted.load(Ordering::SeqCst));

        drop(held);
        waiter.join().unwrap();
        assert!(admitted.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "outside a transaction")]
    fn test_log_write_outside_transaction_is_fatal() {
        let device = Arc::new(MemBlockDevice::new(64));
        let (cache, log) = open_log(device);
        let buf = cache.acquire(DEV, 40);
        log.log_write(&buf);
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let device = MemBlockDevice::new(64);
        let header = LogHeader {
            blocks: vec![50, 51],
        };
        let mut block = vec![0u8; BLOCK_SIZE];
        header.write_to(&mut block);
        device.write_block(LOG_START as u64, &block).unwrap();
        device.write_block(LOG_START as u64 + 1, &[0x11; BLOCK_SIZE]).unwrap();
        device.write_block(LOG_START as u64 + 2, &[0x22; BLOCK_SIZE]).unwrap();

        // a crash during the first replay leaves the header in place
        let once = device.snapshot();
        once.power_loss_after(1);
        let once = Arc::new(once);
        let (_cache, log) = open_log(once.clone());
        assert_eq!(log.stats().recovered, 2);

        let again = Arc::new(once.snapshot());
        assert_eq!(again.block(50), vec![0x11; BLOCK_SIZE]);
        let (_cache, log) = open_log(again.clone());
        assert_eq!(log.stats().recovered, 2);

        assert_eq!(again.block(50), vec![0x11; BLOCK_SIZE]);
        assert_eq!(again.block(51), vec![0x22; BLOCK_SIZE]);
        assert!(LogHeader::from_bytes(&again.block(LOG_START as u64)).blocks.is_empty());

        let (_cache, log) = open_log(Arc::new(again.snapshot()));
        assert_eq!(log.stats().recovered, 0);
    }

    #[test]
    fn test_crash_window() {
        // writes during a two-block commit: 2 bodies, header, 2 installs, clear
        const HEADER_WRITE: u64 = 3;

        for budget in 0..=6 {
            let device = Arc::new(MemBlockDevice::new(64));
            let (cache, log) = open_log(device.clone());

            let tx = log.begin_op();
            write_block(&cache, &tx, 40, 0xC3);
            write_block(&cache, &tx, 41, 0xD4);
            device.power_loss_after(budget);
            drop(tx);

            let rebooted = Arc::new(device.snapshot());
            let (_cache, _log) = open_log(rebooted.clone());

            let visible = budget >= HEADER_WRITE;
            let expect = |fill: u8| if visible { vec![fill; BLOCK_SIZE] } else { vec![0; BLOCK_SIZE] };
            assert_eq!(rebooted.block(40), expect(0xC3), "budget {}", budget);
            assert_eq!(rebooted.block(41), expect(0xD4), "budget {}", budget);
        }
    }
}
