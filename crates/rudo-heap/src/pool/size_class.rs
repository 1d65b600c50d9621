//! Free-entry histogram by power-of-two size class.
//!
//! Class `k` counts entries of `2^k..2^(k+1)` bytes. The pool keeps the
//! histogram in step with its list on every path that links, unlinks, grows
//! or shrinks an entry.

/// Number of size classes, one per bit of a `usize`.
pub const SIZE_CLASS_COUNT: usize = usize::BITS as usize;

/// Count of linked free entries per size class.
#[derive(Clone, PartialEq, Eq)]
pub struct FreeEntrySizeClasses {
    counts: [usize; SIZE_CLASS_COUNT],
}

impl Default for FreeEntrySizeClasses {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeEntrySizeClasses {
    /// An empty histogram.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counts: [0; SIZE_CLASS_COUNT],
        }
    }

    /// Class holding entries of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub const fn class_of(size: usize) -> usize {
        assert!(size != 0, "free entries are never empty");
        (usize::BITS - 1 - size.leading_zeros()) as usize
    }

    /// Smallest entry size in `class`.
    #[must_use]
    pub const fn lower_bound(class: usize) -> usize {
        1 << class
    }

    /// Count an entry of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        self.counts[Self::class_of(size)] += 1;
    }

    /// Forget an entry of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if no entry of that class is counted.
    pub fn decrement(&mut self, size: usize) {
        let class = Self::class_of(size);
        self.counts[class] = match self.counts[class].checked_sub(1) {
            Some(count) => count,
            None => panic!("size class {class} underflow removing a {size} byte entry"),
        };
    }

    /// Replace an entry of `old_size` bytes with one of `new_size` bytes.
    pub fn resize(&mut self, old_size: usize, new_size: usize) {
        self.decrement(old_size);
        self.increment(new_size);
    }

    /// Entries counted in `class`.
    #[must_use]
    pub const fn count(&self, class: usize) -> usize {
        self.counts[class]
    }

    /// Entries across every class.
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Add every count of `other`.
    pub fn merge(&mut self, other: &Self) {
        for (count, added) in self.counts.iter_mut().zip(other.counts) {
            *count += added;
        }
    }

    /// Drop every count.
    pub fn clear(&mut self) {
        self.counts = [0; SIZE_CLASS_COUNT];
    }

    /// Non-empty classes as `(lower bound, count)`, smallest first.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.counts
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, count)| count != 0)
            .map(|(class, count)| (Self::lower_bound(class), count))
    }
}

impl std::fmt::Debug for FreeEntrySizeClasses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl FromIterator<usize> for FreeEntrySizeClasses {
    fn from_iter<I: IntoIterator<Item = usize>>(sizes: I) -> Self {
        let mut classes = Self::new();
        for size in sizes {
            classes.increment(size);
        }
        classes
    }
}
