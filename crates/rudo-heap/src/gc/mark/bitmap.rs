//! Mark bitmap covering the whole heap reservation.
//!
//! One bit per 8-byte slot, least-significant bit first: bit `b` of word `w`
//! describes the slot at `(w * 64 + b) * 8`. A word therefore covers 512 bytes
//! of heap, and a compaction page (1024 bytes) maps to exactly two words.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::heap::{Address, SLOT_SIZE};

/// Heap bytes described by one bitmap word.
pub const HEAP_BYTES_PER_MAP_WORD: usize = 64 * SLOT_SIZE;

/// A bitmap recording which objects are live.
///
/// Bits are set for the first slot of every marked object. The bitmap is
/// shared by all collector workers and all accesses are atomic.
///
/// # Example
///
/// ```
/// use rudo_heap::gc::mark::MarkBitmap;
///
/// let bitmap = MarkBitmap::new(4096);
/// assert!(bitmap.mark(64));
/// assert!(!bitmap.mark(64));
/// assert!(bitmap.is_marked(64));
/// assert_eq!(bitmap.find_next_marked(0, 4096), Some(64));
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    words: Vec<AtomicU64>,
}

impl MarkBitmap {
    /// Create a cleared bitmap covering `heap_size` bytes.
    #[must_use]
    pub fn new(heap_size: usize) -> Self {
        let count = heap_size.div_ceil(HEAP_BYTES_PER_MAP_WORD);
        Self {
            words: (0..count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Index of the word holding the bit for `addr`.
    #[inline]
    #[must_use]
    pub const fn word_index(addr: Address) -> usize {
        addr / HEAP_BYTES_PER_MAP_WORD
    }

    #[inline]
    const fn bit_mask(addr: Address) -> u64 {
        1 << ((addr / SLOT_SIZE) % 64)
    }

    /// Number of words.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Heap bytes covered by the bitmap.
    #[must_use]
    pub fn covered_size(&self) -> usize {
        self.words.len() * HEAP_BYTES_PER_MAP_WORD
    }

    /// Set the bit for `addr`. Returns `true` if this call set it.
    pub fn mark(&self, addr: Address) -> bool {
        let mask = Self::bit_mask(addr);
        let prev = self.words[Self::word_index(addr)].fetch_or(mask, Ordering::Relaxed);
        prev & mask == 0
    }

    /// Whether the bit for `addr` is set.
    #[must_use]
    pub fn is_marked(&self, addr: Address) -> bool {
        self.words[Self::word_index(addr)].load(Ordering::Relaxed) & Self::bit_mask(addr) != 0
    }

    /// Raw word at `index`.
    #[inline]
    #[must_use]
    pub fn word(&self, index: usize) -> u64 {
        self.words[index].load(Ordering::Relaxed)
    }

    /// Overwrite the raw word at `index`.
    #[inline]
    pub fn set_word(&self, index: usize, value: u64) {
        self.words[index].store(value, Ordering::Relaxed);
    }

    /// Clear every bit.
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Clear the bits for `[low, high)`. Both bounds are slot aligned.
    pub fn clear_range(&self, low: Address, high: Address) {
        if low >= high {
            return;
        }
        let first = Self::word_index(low);
        let last = Self::word_index(high - SLOT_SIZE);
        let low_bit = (low / SLOT_SIZE) % 64;
        let high_bit = ((high - SLOT_SIZE) / SLOT_SIZE) % 64;
        let keep_below = (1u64 << low_bit) - 1;
        let keep_above = if high_bit == 63 {
            0
        } else {
            u64::MAX << (high_bit + 1)
        };
        if first == last {
            self.words[first].fetch_and(keep_below | keep_above, Ordering::Relaxed);
            return;
        }
        self.words[first].fetch_and(keep_below, Ordering::Relaxed);
        for word in &self.words[first + 1..last] {
            word.store(0, Ordering::Relaxed);
        }
        self.words[last].fetch_and(keep_above, Ordering::Relaxed);
    }

    /// First marked address in `[from, limit)`.
    #[must_use]
    pub fn find_next_marked(&self, from: Address, limit: Address) -> Option<Address> {
        let from = crate::heap::align_up(from, SLOT_SIZE);
        if from >= limit {
            return None;
        }
        let mut index = Self::word_index(from);
        let last = Self::word_index(limit - 1).min(self.words.len().saturating_sub(1));
        let mut word = self.word(index) & (u64::MAX << ((from / SLOT_SIZE) % 64));
        loop {
            if word != 0 {
                let addr = index * HEAP_BYTES_PER_MAP_WORD + word.trailing_zeros() as usize * SLOT_SIZE;
                return (addr < limit).then_some(addr);
            }
            index += 1;
            if index > last {
                return None;
            }
            word = self.word(index);
        }
    }

    /// Iterate marked addresses in `[low, high)` in ascending order.
    ///
    /// Words are read lazily, so bits past the iterator's position may be
    /// changed while it is live.
    #[must_use]
    pub const fn marked_in(&self, low: Address, high: Address) -> MarkedObjects<'_> {
        MarkedObjects {
            bitmap: self,
            next: low,
            limit: high,
        }
    }

    /// Total number of set bits.
    #[must_use]
    pub fn count_marked(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

/// Iterator over marked addresses, see [`MarkBitmap::marked_in`].
#[derive(Debug)]
pub struct MarkedObjects<'a> {
    bitmap: &'a MarkBitmap,
    next: Address,
    limit: Address,
}

impl Iterator for MarkedObjects<'_> {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        let found = self.bitmap.find_next_marked(self.next, self.limit)?;
        self.next = found + SLOT_SIZE;
        Some(found)
    }
}
