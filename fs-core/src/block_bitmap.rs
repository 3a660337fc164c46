//! Allocation bitmaps
//!
//! Both on-disk formats track free blocks (and ext2 also free inodes) with
//! one bit per object, least significant bit first within each byte. This
//! module works on one bitmap block already loaded into a cache buffer; the
//! callers hold that buffer's content lock, which is what makes the
//! test-and-set sequences below atomic with respect to other allocators.

/// A bitmap block viewed as `limit` allocation bits.
pub struct Bitmap<'a> {
    bits: &'a mut [u8],
    limit: usize,
}

impl<'a> Bitmap<'a> {
    /// View the first `limit` bits of `bits`
    pub fn new(bits: &'a mut [u8], limit: usize) -> Self {
        let limit = limit.min(bits.len() * 8);
        Self { bits, limit }
    }

    /// Number of usable bits
    pub fn len(&self) -> usize {
        self.limit
    }

    /// Whether the view covers no bits
    pub fn is_empty(&self) -> bool {
        self.limit == 0
    }

    /// Whether bit `i` is set
    pub fn is_set(&self, i: usize) -> bool {
        i < self.limit && self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    /// Set bit `i`, returning its previous state.
    pub fn test_and_set(&mut self, i: usize) -> bool {
        let mask = 1u8 << (i % 8);
        let old = self.bits[i / 8] & mask != 0;
        self.bits[i / 8] |= mask;
        old
    }

    /// Clear bit `i`, returning its previous state.
    pub fn test_and_clear(&mut self, i: usize) -> bool {
        let mask = 1u8 << (i % 8);
        let old = self.bits[i / 8] & mask != 0;
        self.bits[i / 8] &= !mask;
        old
    }

    /// First clear bit at or after `start`.
    pub fn find_zero_from(&self, start: usize) -> Option<usize> {
        let mut i = start;
        while i < self.limit {
            let byte = self.bits[i / 8];
            if byte == 0xFF && i % 8 == 0 {
                i += 8;
                continue;
            }
            if byte & (1 << (i % 8)) == 0 {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Claim the first clear bit at or after `start`, then keep claiming the
    /// bits directly after it while they are clear, up to `max` in total.
    ///
    /// Returns the first claimed bit and the run length.
    pub fn claim_run(&mut self, start: usize, max: usize) -> Option<(usize, usize)> {
        let first = self.find_zero_from(start)?;
        self.test_and_set(first);

        let mut len = 1;
        while len < max && first + len < self.limit && !self.is_set(first + len) {
            self.test_and_set(first + len);
            len += 1;
        }
        Some((first, len))
    }

    /// Clear `len` bits starting at `start`; returns how many were set.
    pub fn clear_range(&mut self, start: usize, len: usize) -> usize {
        (start..start + len)
            .filter(|&i| i < self.limit && self.test_and_clear(i))
            .count()
    }

    /// Number of clear bits
    pub fn count_free(&self) -> usize {
        (0..self.limit).filter(|&i| !self.is_set(i)).count()
    }
}

impl std::fmt::Debug for Bitmap<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("limit", &self.limit)
            .field("free", &self.count_free())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_allocation() {
        let mut bytes = vec![0u8; 16];
        let mut bitmap = Bitmap::new(&mut bytes, 100);

        assert_eq!(bitmap.claim_run(0, 1), Some((0, 1)));
        assert_eq!(bitmap.claim_run(0, 1), Some((1, 1)));
        assert!(bitmap.is_set(0));
        assert!(bitmap.is_set(1));
        assert!(!bitmap.is_set(2));
        assert_eq!(bitmap.count_free(), 98);
    }

    #[test]
    fn test_block_reuse() {
        let mut bytes = vec![0u8; 16];
        let mut bitmap = Bitmap::new(&mut bytes, 100);

        let (first, _) = bitmap.claim_run(0, 1).unwrap();
        assert!(bitmap.test_and_clear(first));
        let (again, _) = bitmap.claim_run(0, 1).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_run_stops_at_used_bit() {
        let mut bytes = vec![0u8; 4];
        let mut bitmap = Bitmap::new(&mut bytes, 32);
        bitmap.test_and_set(13);

        assert_eq!(bitmap.claim_run(10, 8), Some((10, 3)));
        // the next search skips the set bit
        assert_eq!(bitmap.claim_run(10, 2), Some((14, 2)));
    }

    #[test]
    fn test_full_bytes_are_skipped_and_limit_respected() {
        let mut bytes = vec![0xFFu8, 0xFF, 0x7F, 0x00];
        let mut bitmap = Bitmap::new(&mut bytes, 24);

        assert_eq!(bitmap.find_zero_from(0), Some(23));
        assert_eq!(bitmap.claim_run(0, 4), Some((23, 1)));
        assert_eq!(bitmap.claim_run(0, 1), None);
    }

    #[test]
    fn test_clear_range_counts_only_set_bits() {
        let mut bytes = vec![0u8; 2];
        let mut bitmap = Bitmap::new(&mut bytes, 16);
        bitmap.claim_run(0, 4);

        assert_eq!(bitmap.clear_range(2, 4), 2);
        assert_eq!(bitmap.count_free(), 14);
    }
}
