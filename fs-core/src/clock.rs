//! Time source for inode timestamps.

use std::sync::atomic::{AtomicU32, Ordering};

/// Seconds-resolution clock consumed by the backends.
pub trait Clock: Send + Sync {
    /// Current time in seconds since the Unix epoch
    fn now(&self) -> u32;
}

/// Wall clock backed by `chrono`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u32 {
        chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicU32);

impl FixedClock {
    /// Start the clock at `secs`
    pub fn new(secs: u32) -> Self {
        Self(AtomicU32::new(secs))
    }

    /// Move the clock forward
    pub fn advance(&self, secs: u32) {
        self.0.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}
