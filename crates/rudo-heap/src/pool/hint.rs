//! Allocation hints: shortcuts into the middle of a long free list.
//!
//! A hint `(entry, size)` records that every free entry before `entry` is
//! smaller than `size`, so a request of more than `size` bytes can start its
//! first-fit walk at `entry`. Hints are only an accelerator; a lookup through
//! them finds exactly what a walk from the head would.

use crate::heap::Address;

/// Number of hints kept per pool.
pub const HINT_CAPACITY: usize = 8;

/// Walk length that always records a new hint.
pub const HINT_MAX_WALK: usize = 20;

/// A single hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationHint {
    /// Entries before `entry` are all smaller than this.
    pub size: usize,
    /// Free entry to start walking from.
    pub entry: Address,
    /// Last-use stamp; the smallest is evicted first.
    pub lru: u64,
}

/// Fixed-capacity hint table.
#[derive(Debug)]
pub struct HintCache {
    active: Vec<AllocationHint>,
    lru: u64,
}

impl Default for HintCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HintCache {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: Vec::with_capacity(HINT_CAPACITY),
            lru: 1,
        }
    }

    /// Drop every hint.
    pub fn clear(&mut self) {
        self.active.clear();
        self.lru = 1;
    }

    /// Number of active hints.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no hint is active.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Active hints in table order.
    #[must_use]
    pub fn as_slice(&self) -> &[AllocationHint] {
        &self.active
    }

    /// Record that entries before `entry` are all smaller than `lookup_size`.
    ///
    /// Hints made redundant by the new one are dropped first; if an existing
    /// hint already says at least as much, nothing is added.
    pub fn add(&mut self, entry: Address, lookup_size: usize) {
        let mut index = 0;
        while index < self.active.len() {
            let hint = self.active[index];
            let redundant = match entry.cmp(&hint.entry) {
                std::cmp::Ordering::Less => lookup_size >= hint.size,
                std::cmp::Ordering::Equal => {
                    if lookup_size < hint.size {
                        true
                    } else {
                        return;
                    }
                }
                std::cmp::Ordering::Greater => lookup_size <= hint.size,
            };
            if redundant {
                self.active.remove(index);
            } else {
                index += 1;
            }
        }

        let hint = AllocationHint {
            size: lookup_size,
            entry,
            lru: self.lru,
        };
        self.lru += 1;
        if self.active.len() < HINT_CAPACITY {
            self.active.push(hint);
        } else if let Some(victim) = self.active.iter_mut().min_by_key(|hint| hint.lru) {
            *victim = hint;
        }
    }

    /// Best hint for a request of `lookup_size` bytes: the one with the largest
    /// size still below the request. Hints behind `head` are stale and are
    /// dropped on the way.
    pub fn find(&mut self, lookup_size: usize, head: Option<Address>) -> Option<AllocationHint> {
        match head {
            None => self.active.clear(),
            Some(head) => self.active.retain(|hint| hint.entry >= head),
        }
        let mut best: Option<usize> = None;
        for (index, hint) in self.active.iter().enumerate() {
            if hint.size < lookup_size && best.map_or(true, |b| hint.size > self.active[b].size) {
                best = Some(index);
            }
        }
        let index = best?;
        self.active[index].lru = self.lru;
        self.lru += 1;
        Some(self.active[index])
    }

    /// Drop every hint pointing at `entry`.
    pub fn remove(&mut self, entry: Address) {
        self.active.retain(|hint| hint.entry != entry);
    }

    /// Retarget hints from `old_entry` to `new_entry`.
    pub fn update(&mut self, old_entry: Address, new_entry: Address) {
        for hint in &mut self.active {
            if hint.entry == old_entry {
                hint.entry = new_entry;
            }
        }
    }

    /// Pull hints pointing past `entry` back to it, after free memory was
    /// added at `entry`.
    pub fn update_beyond(&mut self, entry: Address) {
        for hint in &mut self.active {
            if hint.entry > entry {
                hint.entry = entry;
            }
        }
    }
}
