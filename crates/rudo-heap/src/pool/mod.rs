//! Address-ordered free-list memory pool.
//!
//! A [`MemoryPool`] owns a singly linked list of [`FreeChunk`]s kept in strictly
//! increasing address order, plus a small [`HintCache`] that lets long
//! first-fit walks start part way down the list. The list lives in the heap
//! itself; the pool only stores the head and running statistics behind a
//! `parking_lot` mutex.
//!
//! Mutator paths (`allocate_object`, `allocate_tlh`) always take the lock.
//! Collector paths may pass `locking_required = false` when the collector
//! already excludes every other user of the pool.
//!
//! Sweep and compaction build whole sub-lists without the lock using
//! [`MemoryPool::connect_inner`], then splice them in through a
//! [`PoolGuard`] with [`PoolGuard::connect_outer`] and
//! [`PoolGuard::connect_final`].

mod hint;
mod size_class;

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

pub use hint::{AllocationHint, HintCache, HINT_CAPACITY, HINT_MAX_WALK};
pub use size_class::{FreeEntrySizeClasses, SIZE_CLASS_COUNT};

use crate::free_chunk::{FreeChunk, FREE_CHUNK_HEADER_SIZE};
use crate::heap::{Address, HeapMemory};

/// A linked free entry, as reported by [`MemoryPool::free_entries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntry {
    /// Start of the entry.
    pub address: Address,
    /// Size in bytes.
    pub size: usize,
}

impl FreeEntry {
    /// First address past the entry.
    #[must_use]
    pub const fn end(&self) -> Address {
        self.address + self.size
    }
}

/// A thread-local heap: a contiguous `[base, top)` range handed out whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlh {
    /// First usable address.
    pub base: Address,
    /// One past the last usable address.
    pub top: Address,
}

impl Tlh {
    /// Size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.top - self.base
    }
}

/// Address-ordered list of free chunks detached from a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntryList {
    /// First chunk.
    pub head: Address,
    /// Last chunk.
    pub tail: Address,
    /// Number of chunks.
    pub count: usize,
    /// Total bytes in the chunks.
    pub bytes: usize,
}

/// Allocation counters since the last [`MemoryPool::reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    /// Successful allocations, objects and TLHs.
    pub count: usize,
    /// Bytes handed out.
    pub bytes: usize,
    /// Remainders too small to keep that were abandoned.
    pub discarded_bytes: usize,
    /// Free entries stepped over while searching.
    pub search_count: usize,
}

#[derive(Debug)]
struct FreeList {
    head: Option<Address>,
    free_memory_size: usize,
    free_entry_count: usize,
    largest_free_entry: usize,
    last_free_entry: Option<Address>,
    hints: HintCache,
    size_classes: FreeEntrySizeClasses,
    stats: AllocationStats,
    dark_matter_bytes: usize,
    dark_matter_samples: usize,
}

impl FreeList {
    fn new() -> Self {
        Self {
            head: None,
            free_memory_size: 0,
            free_entry_count: 0,
            largest_free_entry: 0,
            last_free_entry: None,
            hints: HintCache::new(),
            size_classes: FreeEntrySizeClasses::new(),
            stats: AllocationStats::default(),
            dark_matter_bytes: 0,
            dark_matter_samples: 0,
        }
    }
}

/// An address-ordered free-list allocator over part of the heap.
#[derive(Debug)]
pub struct MemoryPool {
    memory: Arc<HeapMemory>,
    minimum_free_entry_size: usize,
    free_list: Mutex<FreeList>,
}

/// Exclusive access to a pool's free list.
pub struct PoolGuard<'a> {
    pool: &'a MemoryPool,
    list: MutexGuard<'a, FreeList>,
}

impl MemoryPool {
    /// Create an empty pool over `memory`.
    ///
    /// # Panics
    ///
    /// Panics if `minimum_free_entry_size` cannot hold a free chunk header.
    #[must_use]
    pub fn new(memory: Arc<HeapMemory>, minimum_free_entry_size: usize) -> Self {
        assert!(
            minimum_free_entry_size >= FREE_CHUNK_HEADER_SIZE,
            "minimum free entry size must hold a free chunk header"
        );
        Self {
            memory,
            minimum_free_entry_size,
            free_list: Mutex::new(FreeList::new()),
        }
    }

    /// Smallest size of a linked free entry.
    #[must_use]
    pub const fn minimum_free_entry_size(&self) -> usize {
        self.minimum_free_entry_size
    }

    /// The heap memory the pool manages.
    #[must_use]
    pub fn memory(&self) -> &HeapMemory {
        &self.memory
    }

    /// Lock the free list.
    pub fn lock(&self) -> PoolGuard<'_> {
        PoolGuard {
            pool: self,
            list: self.free_list.lock(),
        }
    }

    /// Lock the free list if it is not already held.
    pub fn try_lock(&self) -> Option<PoolGuard<'_>> {
        self.free_list.try_lock().map(|list| PoolGuard { pool: self, list })
    }

    fn exclusive(&self, locking_required: bool) -> PoolGuard<'_> {
        if locking_required {
            return self.lock();
        }
        match self.try_lock() {
            Some(guard) => guard,
            None => panic!("memory pool used concurrently while the collector claimed exclusive access"),
        }
    }

    /// Allocate `size` bytes for a mutator object.
    pub fn allocate_object(&self, size: usize) -> Option<Address> {
        self.lock().allocate(size)
    }

    /// Carve a TLH of at most `max_size` bytes off the head of the list.
    pub fn allocate_tlh(&self, max_size: usize) -> Option<Tlh> {
        self.lock().allocate_tlh(max_size)
    }

    /// Allocate on behalf of the collector.
    ///
    /// # Panics
    ///
    /// With `locking_required == false`, panics if another thread holds the pool.
    pub fn collector_allocate(&self, size: usize, locking_required: bool) -> Option<Address> {
        self.exclusive(locking_required).allocate(size)
    }

    /// Allocate a TLH on behalf of the collector.
    ///
    /// # Panics
    ///
    /// With `locking_required == false`, panics if another thread holds the pool.
    pub fn collector_allocate_tlh(&self, max_size: usize, locking_required: bool) -> Option<Tlh> {
        self.exclusive(locking_required).allocate_tlh(max_size)
    }

    /// See [`PoolGuard::expand_with_range`].
    pub fn expand_with_range(&self, low: Address, high: Address, can_coalesce: bool) {
        self.lock().expand_with_range(low, high, can_coalesce);
    }

    /// See [`PoolGuard::contract_with_range`].
    pub fn contract_with_range(&self, low: Address, high: Address) -> Option<Address> {
        self.lock().contract_with_range(low, high)
    }

    /// See [`PoolGuard::recycle_heap_chunk`].
    pub fn recycle_heap_chunk(&self, base: Address, top: Address) -> bool {
        self.lock().recycle_heap_chunk(base, top)
    }

    /// See [`PoolGuard::rebuild_free_list_in_region`].
    pub fn rebuild_free_list_in_region(
        &self,
        low: Address,
        high: Address,
        previous: Option<Address>,
    ) -> Option<Address> {
        self.lock().rebuild_free_list_in_region(low, high, previous)
    }

    /// See [`PoolGuard::add_free_entries`].
    pub fn add_free_entries(&self, entries: FreeEntryList) {
        self.lock().add_free_entries(entries);
    }

    /// See [`PoolGuard::remove_free_entries_within_range`].
    pub fn remove_free_entries_within_range(
        &self,
        low: Address,
        high: Address,
        minimum_size: usize,
    ) -> Option<FreeEntryList> {
        self.lock().remove_free_entries_within_range(low, high, minimum_size)
    }

    /// See [`PoolGuard::find_address_after_free_size`].
    #[must_use]
    pub fn find_address_after_free_size(&self, size_required: usize, minimum_size: usize) -> Option<Address> {
        self.lock().find_address_after_free_size(size_required, minimum_size)
    }

    /// See [`PoolGuard::find_free_entry_ending_at`].
    #[must_use]
    pub fn find_free_entry_ending_at(&self, addr: Address) -> Option<Address> {
        self.lock().find_free_entry_ending_at(addr)
    }

    /// See [`PoolGuard::find_free_entry_top_starting_at`].
    #[must_use]
    pub fn find_free_entry_top_starting_at(&self, addr: Address) -> Option<Address> {
        self.lock().find_free_entry_top_starting_at(addr)
    }

    /// See [`PoolGuard::available_contraction_size_ending_at`].
    #[must_use]
    pub fn available_contraction_size_ending_at(&self, alloc_size: usize, low: Address, high: Address) -> usize {
        self.lock().available_contraction_size_ending_at(alloc_size, low, high)
    }

    /// See [`PoolGuard::move_heap`].
    pub fn move_heap(&self, src_base: Address, src_top: Address, dst_base: Address) {
        self.lock().move_heap(src_base, src_top, dst_base);
    }

    /// Forget every free entry and reset all statistics.
    pub fn reset(&self) {
        self.lock().reset();
    }

    /// Check the list against its invariants.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lock().is_valid()
    }

    /// Recompute size, count and largest entry from the list.
    pub fn recalculate_statistics(&self) {
        self.lock().recalculate_statistics();
    }

    /// Snapshot of the free list.
    #[must_use]
    pub fn free_entries(&self) -> Vec<FreeEntry> {
        self.lock().free_entries()
    }

    /// First entry of at least `size` bytes, found by a plain walk from the
    /// head. Nothing is modified.
    #[must_use]
    pub fn lookup(&self, size: usize) -> Option<FreeEntry> {
        self.lock().lookup(size)
    }

    /// Linked free bytes.
    #[must_use]
    pub fn free_memory_size(&self) -> usize {
        self.free_list.lock().free_memory_size
    }

    /// Number of linked free entries.
    #[must_use]
    pub fn free_entry_count(&self) -> usize {
        self.free_list.lock().free_entry_count
    }

    /// Largest entry as of the last rebuild or failed allocation.
    #[must_use]
    pub fn largest_free_entry(&self) -> usize {
        self.free_list.lock().largest_free_entry
    }

    /// First entry of the list.
    #[must_use]
    pub fn first_free_entry(&self) -> Option<Address> {
        self.free_list.lock().head
    }

    /// Last entry connected by the most recent sweep or rebuild.
    #[must_use]
    pub fn last_free_entry(&self) -> Option<Address> {
        self.free_list.lock().last_free_entry
    }

    /// Allocation counters.
    #[must_use]
    pub fn allocation_stats(&self) -> AllocationStats {
        self.free_list.lock().stats
    }

    /// Dark matter recorded by the last sweep.
    #[must_use]
    pub fn dark_matter_bytes(&self) -> usize {
        self.free_list.lock().dark_matter_bytes
    }

    /// Number of dark-matter samples taken by the last sweep.
    #[must_use]
    pub fn dark_matter_samples(&self) -> usize {
        self.free_list.lock().dark_matter_samples
    }

    /// Linked free entries per size class.
    #[must_use]
    pub fn free_entry_size_classes(&self) -> FreeEntrySizeClasses {
        self.free_list.lock().size_classes.clone()
    }

    /// Active allocation hints.
    #[must_use]
    pub fn hints(&self) -> Vec<AllocationHint> {
        self.free_list.lock().hints.as_slice().to_vec()
    }

    /// Write a chunk for `[addr, addr + size)` and link it after `previous`,
    /// without touching the pool's head or statistics.
    ///
    /// Returns `false` and abandons the range when it is below the minimum
    /// entry size.
    pub fn connect_inner(&self, addr: Address, size: usize, previous: Option<Address>) -> bool {
        if !self.can_be_connected(size) {
            self.abandon(addr, size);
            return false;
        }
        FreeChunk::write(&self.memory, addr, size, None);
        if let Some(previous) = previous {
            debug_assert!(previous < addr);
            FreeChunk::at(previous).set_next(&self.memory, Some(addr));
        }
        true
    }

    /// Make `[addr, addr + size)` walkable without linking it.
    pub fn abandon(&self, addr: Address, size: usize) {
        FreeChunk::fill_with_holes(&self.memory, addr, size);
    }

    /// Whether a range of `size` bytes is large enough to link.
    #[must_use]
    pub const fn can_be_connected(&self, size: usize) -> bool {
        size >= self.minimum_free_entry_size
    }
}

impl<'a> PoolGuard<'a> {
    fn memory(&self) -> &'a HeapMemory {
        &self.pool.memory
    }

    const fn minimum(&self) -> usize {
        self.pool.minimum_free_entry_size
    }

    fn entries(&self) -> FreeEntries<'a> {
        FreeEntries {
            memory: self.memory(),
            next: self.list.head,
        }
    }

    fn predecessor_of(&self, addr: Address) -> Option<Address> {
        let mut previous = None;
        for entry in self.entries() {
            if entry.address >= addr {
                break;
            }
            previous = Some(entry.address);
        }
        previous
    }

    fn remove_entry_count(&mut self, removed: isize) {
        self.list.free_entry_count = match self.list.free_entry_count.checked_add_signed(-removed) {
            Some(count) => count,
            None => panic!("free entry count underflow"),
        };
    }

    fn link_after(&mut self, previous: Option<Address>, target: Option<Address>) {
        match previous {
            Some(previous) => FreeChunk::at(previous).set_next(self.memory(), target),
            None => self.list.head = target,
        }
    }

    /// First-fit allocation of `size` bytes, consulting the hint cache.
    ///
    /// The remainder of the chosen entry stays linked if it is at least the
    /// minimum entry size; otherwise it is abandoned and counted as discarded.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        let memory = self.memory();
        let head = self.list.head;
        let hint = self.list.hints.find(size, head);
        let (mut current, mut candidate_hint_size) = match hint {
            Some(hint) => (Some(hint.entry), hint.size),
            None => (head, 0),
        };
        let mut previous = None;
        let mut walk_count = 0;
        let mut largest = 0;

        let found = loop {
            let Some(addr) = current else {
                break None;
            };
            let chunk = FreeChunk::at(addr);
            let entry_size = chunk.size(memory);
            largest = largest.max(entry_size);
            if size <= entry_size {
                break Some((addr, entry_size));
            }
            candidate_hint_size = candidate_hint_size.max(entry_size);
            walk_count += 1;
            previous = Some(addr);
            current = chunk.next(memory);
            assert!(
                current.map_or(true, |next| next > addr),
                "free list is not address ordered at {addr:#x}"
            );
        };

        let Some((addr, entry_size)) = found else {
            if let Some(hint) = hint {
                let skipped = self
                    .entries()
                    .take_while(|entry| entry.address < hint.entry)
                    .map(|entry| entry.size)
                    .max();
                largest = largest.max(skipped.unwrap_or(0));
            }
            self.list.largest_free_entry = largest;
            return None;
        };

        if walk_count >= HINT_MAX_WALK || (walk_count > 1 && hint.is_some()) {
            if let Some(previous) = previous {
                self.list.hints.add(previous, candidate_hint_size);
            }
        }
        if previous.is_none() && Some(addr) != head {
            previous = self.predecessor_of(addr);
        }

        self.list.free_memory_size -= size;
        self.list.stats.count += 1;
        self.list.stats.bytes += size;
        self.list.stats.search_count += walk_count;

        let next = FreeChunk::at(addr).next(memory);
        let remainder = entry_size - size;
        let recycle = addr + size;
        self.list.size_classes.decrement(entry_size);
        if self.recycle_between(recycle, recycle + remainder, previous, next) {
            self.list.size_classes.increment(remainder);
            self.list.hints.update(addr, recycle);
        } else {
            self.list.free_memory_size -= remainder;
            self.list.free_entry_count -= 1;
            self.list.stats.discarded_bytes += remainder;
            self.list.hints.remove(addr);
        }
        Some(addr)
    }

    /// Take the head entry, up to `max_size` bytes, as a TLH.
    ///
    /// A remainder too small to link is folded into the TLH.
    pub fn allocate_tlh(&mut self, max_size: usize) -> Option<Tlh> {
        let memory = self.memory();
        let Some(addr) = self.list.head else {
            self.list.largest_free_entry = 0;
            return None;
        };
        let chunk = FreeChunk::at(addr);
        let entry_size = chunk.size(memory);
        let next = chunk.next(memory);

        let mut consumed = max_size.min(entry_size);
        let mut remainder = entry_size - consumed;
        if remainder != 0 && remainder < self.minimum() {
            consumed += remainder;
            remainder = 0;
        }

        self.list.free_memory_size -= consumed;
        self.list.stats.count += 1;
        self.list.stats.bytes += consumed;
        self.list.size_classes.decrement(entry_size);

        let top = addr + consumed;
        if remainder > 0 {
            if self.recycle_between(top, top + remainder, None, next) {
                self.list.size_classes.increment(remainder);
            } else {
                self.list.free_memory_size -= remainder;
                self.list.free_entry_count -= 1;
                self.list.stats.discarded_bytes += remainder;
            }
        } else {
            self.list.head = next;
            self.list.free_entry_count -= 1;
        }
        Some(Tlh { base: addr, top })
    }

    /// Link `[base, top)` between `previous` and `next` if it is large
    /// enough; otherwise abandon it and link `previous` straight to `next`.
    fn recycle_between(
        &mut self,
        base: Address,
        top: Address,
        previous: Option<Address>,
        next: Option<Address>,
    ) -> bool {
        assert!(base <= top);
        assert!(next.map_or(true, |next| top <= next));
        let memory = self.memory();
        if top - base >= self.minimum() {
            FreeChunk::write(memory, base, top - base, next);
            self.link_after(previous, Some(base));
            true
        } else {
            FreeChunk::fill_with_holes(memory, base, top - base);
            self.link_after(previous, next);
            false
        }
    }

    /// Return `[base, top)` to the pool as a new entry in address order.
    ///
    /// Returns `false` if the range was too small and was abandoned instead.
    pub fn recycle_heap_chunk(&mut self, base: Address, top: Address) -> bool {
        let mut previous = None;
        let mut next = self.list.head;
        while let Some(entry) = next {
            if entry > base {
                break;
            }
            previous = Some(entry);
            next = FreeChunk::at(entry).next(self.memory());
        }
        let recycled = self.recycle_between(base, top, previous, next);
        if recycled {
            self.list.free_memory_size += top - base;
            self.list.free_entry_count += 1;
            self.list.size_classes.increment(top - base);
            self.list.hints.update_beyond(base);
        }
        recycled
    }

    /// Add the free range `[low, high)` to the pool.
    ///
    /// With `can_coalesce`, a range touching a neighbouring entry is merged
    /// into it instead of becoming a new entry. A range touching both
    /// neighbours fuses all three.
    pub fn expand_with_range(&mut self, low: Address, high: Address, can_coalesce: bool) {
        let memory = self.memory();
        let expand_size = high - low;
        if expand_size == 0 {
            return;
        }
        if expand_size < self.minimum() {
            self.pool.abandon(low, expand_size);
            return;
        }

        let mut previous = None;
        let mut next = self.list.head;
        while let Some(entry) = next {
            if low < entry {
                break;
            }
            previous = Some(entry);
            next = FreeChunk::at(entry).next(memory);
        }

        if can_coalesce {
            if let Some(prev) = previous.filter(|&p| FreeChunk::at(p).after_end(memory) == low) {
                let prev_chunk = FreeChunk::at(prev);
                let old_size = prev_chunk.size(memory);
                prev_chunk.expand_size(memory, expand_size);
                self.list.free_memory_size += expand_size;
                if let Some(next) = next.filter(|&n| n == high) {
                    let next_chunk = FreeChunk::at(next);
                    let next_size = next_chunk.size(memory);
                    prev_chunk.expand_size(memory, next_size);
                    prev_chunk.set_next(memory, next_chunk.next(memory));
                    self.list.free_entry_count -= 1;
                    self.list.size_classes.decrement(next_size);
                }
                let size = prev_chunk.size(memory);
                self.list.size_classes.resize(old_size, size);
                self.list.largest_free_entry = self.list.largest_free_entry.max(size);
                // Hints past a grown entry no longer hold.
                self.list.hints.update_beyond(prev);
                return;
            }
            if let Some(next) = next.filter(|&n| n == high) {
                let next_chunk = FreeChunk::at(next);
                let next_size = next_chunk.size(memory);
                let size = expand_size + next_size;
                FreeChunk::write(memory, low, size, next_chunk.next(memory));
                self.link_after(previous, Some(low));
                self.list.free_memory_size += expand_size;
                self.list.size_classes.resize(next_size, size);
                self.list.largest_free_entry = self.list.largest_free_entry.max(size);
                self.list.hints.update_beyond(low);
                return;
            }
        }

        assert!(next.map_or(true, |next| next >= high), "expanded range overlaps a free entry");
        FreeChunk::write(memory, low, expand_size, next);
        self.link_after(previous, Some(low));
        self.list.free_memory_size += expand_size;
        self.list.free_entry_count += 1;
        self.list.size_classes.increment(expand_size);
        self.list.largest_free_entry = self.list.largest_free_entry.max(expand_size);
        self.list.hints.update_beyond(low);
    }

    /// Remove `[low, high)` from the free entry that contains it. What is left
    /// on either side is kept if large enough and abandoned otherwise.
    ///
    /// # Panics
    ///
    /// Panics if no single free entry contains the range.
    pub fn contract_with_range(&mut self, low: Address, high: Address) -> Option<Address> {
        let memory = self.memory();
        if low == high {
            return None;
        }
        let mut previous = None;
        let mut current = self.list.head;
        while let Some(entry) = current {
            if low >= entry && high <= FreeChunk::at(entry).after_end(memory) {
                break;
            }
            previous = Some(entry);
            current = FreeChunk::at(entry).next(memory);
        }
        let Some(entry) = current else {
            panic!("contracted range {low:#x}..{high:#x} is not free");
        };

        let mut total_contract_size = high - low;
        let mut contract_count: isize = 1;
        let entry_chunk = FreeChunk::at(entry);
        let entry_top = entry_chunk.after_end(memory);
        let mut next = entry_chunk.next(memory);
        self.list.size_classes.decrement(entry_top - entry);

        if entry_top != high {
            if self.pool.can_be_connected(entry_top - high) {
                FreeChunk::write(memory, high, entry_top - high, next);
                self.list.size_classes.increment(entry_top - high);
                next = Some(high);
                contract_count -= 1;
            } else {
                self.pool.abandon(high, entry_top - high);
                total_contract_size += entry_top - high;
            }
        }
        if entry != low {
            if self.pool.can_be_connected(low - entry) {
                FreeChunk::write(memory, entry, low - entry, next);
                self.list.size_classes.increment(low - entry);
                next = Some(entry);
                contract_count -= 1;
            } else {
                self.pool.abandon(entry, low - entry);
                total_contract_size += low - entry;
            }
        }
        self.link_after(previous, next);

        self.list.free_memory_size -= total_contract_size;
        self.remove_entry_count(contract_count);
        self.list.hints.clear();
        Some(low)
    }

    /// Splice an address-ordered list of chunks into the pool, merging with
    /// the entries it touches on either side.
    pub fn add_free_entries(&mut self, entries: FreeEntryList) {
        let memory = self.memory();
        let FreeEntryList { head, tail, mut count, bytes } = entries;

        let mut added = Some(head);
        while let Some(entry) = added {
            let chunk = FreeChunk::at(entry);
            self.list.size_classes.increment(chunk.size(memory));
            added = if entry == tail { None } else { chunk.next(memory) };
        }

        let mut previous = None;
        let mut current = self.list.head;
        while let Some(entry) = current {
            if entry > head {
                break;
            }
            previous = Some(entry);
            current = FreeChunk::at(entry).next(memory);
        }

        let tail_chunk = FreeChunk::at(tail);
        match current.filter(|&next| tail_chunk.after_end(memory) == next) {
            Some(next) => {
                let next_chunk = FreeChunk::at(next);
                let (tail_size, next_size) = (tail_chunk.size(memory), next_chunk.size(memory));
                tail_chunk.expand_size(memory, next_size);
                tail_chunk.set_next(memory, next_chunk.next(memory));
                count -= 1;
                self.list.size_classes.decrement(next_size);
                self.list.size_classes.resize(tail_size, tail_size + next_size);
            }
            None => {
                assert!(current.map_or(true, |next| tail < next));
                tail_chunk.set_next(memory, current);
            }
        }

        let first = match previous {
            Some(prev) if FreeChunk::at(prev).after_end(memory) == head => {
                let head_chunk = FreeChunk::at(head);
                let prev_chunk = FreeChunk::at(prev);
                let (prev_size, head_size) = (prev_chunk.size(memory), head_chunk.size(memory));
                prev_chunk.expand_size(memory, head_size);
                prev_chunk.set_next(memory, head_chunk.next(memory));
                count -= 1;
                self.list.size_classes.decrement(head_size);
                self.list.size_classes.resize(prev_size, prev_size + head_size);
                prev
            }
            _ => {
                self.link_after(previous, Some(head));
                head
            }
        };

        self.list.free_memory_size += bytes;
        self.list.free_entry_count += count;
        self.list.hints.update_beyond(first);
    }

    /// Detach the free memory inside `[low, high)` and return it as a list of
    /// chunks of at least `minimum_size` bytes. Pieces of straddling entries
    /// that fall outside the range stay in the pool.
    pub fn remove_free_entries_within_range(
        &mut self,
        low: Address,
        high: Address,
        minimum_size: usize,
    ) -> Option<FreeEntryList> {
        let memory = self.memory();
        let mut previous = None;
        let mut current = self.list.head;
        while let Some(entry) = current {
            if entry >= low || FreeChunk::at(entry).after_end(memory) > low {
                break;
            }
            previous = Some(entry);
            current = FreeChunk::at(entry).next(memory);
        }
        let entry = current.filter(|&entry| entry < high)?;
        self.list.hints.clear();

        let mut result = DetachedList::default();
        let mut remove_size = 0usize;
        let mut remove_count: isize = 0;

        let entry_chunk = FreeChunk::at(entry);
        let next = entry_chunk.next(memory);
        let entry_top = entry_chunk.after_end(memory);
        remove_size += entry_chunk.size(memory);
        remove_count += 1;
        self.list.size_classes.decrement(entry_chunk.size(memory));
        let mut base = entry;
        let mut top = entry_top;

        if entry < low {
            if self.pool.can_be_connected(low - entry) {
                FreeChunk::write(memory, entry, low - entry, None);
                self.list.size_classes.increment(low - entry);
                self.link_after(previous, Some(entry));
                previous = Some(entry);
                remove_size -= low - entry;
                remove_count -= 1;
            }
            base = low;
        }
        if entry_top > high {
            if self.pool.can_be_connected(entry_top - high) {
                FreeChunk::write(memory, high, entry_top - high, None);
                self.list.size_classes.increment(entry_top - high);
                self.link_after(previous, Some(high));
                previous = Some(high);
                remove_size -= entry_top - high;
                remove_count -= 1;
            }
            top = high;
        }
        result.append(memory, base, top, minimum_size);

        let mut current = next;
        let mut tail = next;
        while let Some(entry) = current {
            let chunk = FreeChunk::at(entry);
            let entry_top = chunk.after_end(memory);
            if entry_top > high {
                break;
            }
            tail = chunk.next(memory);
            remove_size += chunk.size(memory);
            remove_count += 1;
            self.list.size_classes.decrement(chunk.size(memory));
            result.append(memory, entry, entry_top, minimum_size);
            current = tail;
        }

        if let Some(entry) = current.filter(|&entry| entry < high) {
            let chunk = FreeChunk::at(entry);
            let entry_top = chunk.after_end(memory);
            remove_size += chunk.size(memory);
            remove_count += 1;
            self.list.size_classes.decrement(chunk.size(memory));
            tail = chunk.next(memory);
            if self.pool.can_be_connected(entry_top - high) {
                FreeChunk::write(memory, high, entry_top - high, tail);
                self.list.size_classes.increment(entry_top - high);
                if previous.is_none() {
                    self.list.head = Some(high);
                }
                tail = Some(high);
                remove_size -= entry_top - high;
                remove_count -= 1;
            }
            result.append(memory, entry, high, minimum_size);
        }

        self.link_after(previous, tail);
        self.list.free_memory_size -= remove_size;
        self.remove_entry_count(remove_count);
        result.finish()
    }

    /// Address below which the pool holds at least `size_required` bytes in
    /// entries of at least `minimum_size`.
    #[must_use]
    pub fn find_address_after_free_size(&self, size_required: usize, minimum_size: usize) -> Option<Address> {
        let mut remaining = size_required;
        for entry in self.entries() {
            remaining = remaining.max(minimum_size);
            if remaining >= entry.size {
                if minimum_size <= entry.size {
                    remaining -= entry.size;
                    if remaining == 0 {
                        return Some(entry.end());
                    }
                }
            } else {
                if entry.size - remaining < self.minimum() {
                    return Some(entry.end());
                }
                return Some(entry.address + remaining);
            }
        }
        None
    }

    /// Start of the free entry ending exactly at `addr`.
    #[must_use]
    pub fn find_free_entry_ending_at(&self, addr: Address) -> Option<Address> {
        self.entries()
            .find(|entry| entry.end() == addr)
            .map(|entry| entry.address)
    }

    /// End of the free entry starting exactly at `addr`.
    #[must_use]
    pub fn find_free_entry_top_starting_at(&self, addr: Address) -> Option<Address> {
        self.entries()
            .take_while(|entry| entry.address <= addr)
            .find(|entry| entry.address == addr)
            .map(|entry| entry.end())
    }

    /// Free bytes that could be released from the top of `[low, high)`,
    /// keeping `alloc_size` bytes back for a pending allocation.
    #[must_use]
    pub fn available_contraction_size_ending_at(&self, alloc_size: usize, low: Address, high: Address) -> usize {
        let Some(last_free) = self.find_free_entry_ending_at(high) else {
            return 0;
        };
        let available = high - last_free.max(low);
        if alloc_size != 0 && alloc_size <= available {
            available - alloc_size
        } else {
            available
        }
    }

    /// Relink entries whose bytes the caller has already copied from
    /// `[src_base, src_top)` to `dst_base`.
    pub fn move_heap(&mut self, src_base: Address, src_top: Address, dst_base: Address) {
        let memory = self.memory();
        let relocate = |addr: Address| {
            if (src_base..src_top).contains(&addr) {
                addr - src_base + dst_base
            } else {
                addr
            }
        };
        let mut previous: Option<Address> = None;
        let mut current = self.list.head;
        while let Some(old) = current {
            let new = relocate(old);
            let next = FreeChunk::at(new).next(memory);
            if new != old {
                self.link_after(previous, Some(new));
            }
            assert!(previous.map_or(true, |previous| previous < new));
            previous = Some(new);
            current = next;
        }
        self.list.last_free_entry = previous;
        self.list.hints.clear();
    }

    /// Make the pool a single free entry covering `[low, high)`.
    ///
    /// Everything previously on the list is forgotten. `previous`, when given,
    /// is linked to the new entry.
    pub fn rebuild_free_list_in_region(
        &mut self,
        low: Address,
        high: Address,
        previous: Option<Address>,
    ) -> Option<Address> {
        self.reset();
        let size = high - low;
        if !self.pool.can_be_connected(size) {
            self.pool.abandon(low, size);
            return None;
        }
        FreeChunk::write(self.memory(), low, size, None);
        if let Some(previous) = previous {
            FreeChunk::at(previous).set_next(self.memory(), Some(low));
        }
        self.list.head = Some(low);
        self.list.last_free_entry = Some(low);
        self.list.free_memory_size = size;
        self.list.free_entry_count = 1;
        self.list.largest_free_entry = size;
        self.list.size_classes.increment(size);
        Some(low)
    }

    /// Forget every free entry and reset all statistics.
    pub fn reset(&mut self) {
        *self.list = FreeList::new();
    }

    /// Whether the list is strictly address ordered, non-overlapping, made of
    /// entries of at least the minimum size, and matches the running totals
    /// and size classes.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let mut total = 0;
        let mut count = 0;
        let mut previous_end = None;
        let mut classes = FreeEntrySizeClasses::new();
        for entry in self.entries() {
            if entry.size < self.minimum() || previous_end.is_some_and(|end| entry.address < end) {
                return false;
            }
            total += entry.size;
            count += 1;
            classes.increment(entry.size);
            previous_end = Some(entry.end());
        }
        total == self.list.free_memory_size
            && count == self.list.free_entry_count
            && classes == self.list.size_classes
    }

    /// Recompute size, count, largest entry and size classes by walking the
    /// list.
    pub fn recalculate_statistics(&mut self) {
        let (mut total, mut count, mut largest) = (0, 0, 0);
        let mut classes = FreeEntrySizeClasses::new();
        for entry in self.entries() {
            total += entry.size;
            count += 1;
            largest = largest.max(entry.size);
            classes.increment(entry.size);
        }
        self.list.free_memory_size = total;
        self.list.free_entry_count = count;
        self.list.largest_free_entry = largest;
        self.list.size_classes = classes;
    }

    /// Snapshot of the free list.
    #[must_use]
    pub fn free_entries(&self) -> Vec<FreeEntry> {
        self.entries().collect()
    }

    /// First entry of at least `size` bytes, by a walk from the head.
    #[must_use]
    pub fn lookup(&self, size: usize) -> Option<FreeEntry> {
        self.entries().find(|entry| entry.size >= size)
    }

    /// Link a connected run after `previous`, or make it the head.
    ///
    /// `previous` is rewritten as a chunk of `previous_size` bytes.
    pub fn connect_outer(&mut self, previous: Option<Address>, previous_size: usize, next: Address) {
        match previous {
            Some(previous) => {
                debug_assert!(previous < next);
                FreeChunk::write(self.memory(), previous, previous_size, Some(next));
            }
            None => self.list.head = Some(next),
        }
    }

    /// Close the list with `last`, written as a chunk of `size` bytes.
    pub fn connect_final(&mut self, last: Address, size: usize) {
        FreeChunk::write(self.memory(), last, size, None);
        self.list.last_free_entry = Some(last);
    }

    /// Install totals gathered while connecting.
    pub fn update_statistics(
        &mut self,
        free_bytes: usize,
        free_entries: usize,
        largest: usize,
        size_classes: FreeEntrySizeClasses,
    ) {
        self.list.free_memory_size = free_bytes;
        self.list.free_entry_count = free_entries;
        self.list.largest_free_entry = largest;
        self.list.size_classes = size_classes;
    }

    /// Accumulate dark matter found while sweeping.
    pub fn add_dark_matter(&mut self, bytes: usize, samples: usize) {
        self.list.dark_matter_bytes += bytes;
        self.list.dark_matter_samples += samples;
    }

    /// Linked free bytes.
    #[must_use]
    pub fn free_memory_size(&self) -> usize {
        self.list.free_memory_size
    }

    /// Number of linked entries.
    #[must_use]
    pub fn free_entry_count(&self) -> usize {
        self.list.free_entry_count
    }
}

impl std::fmt::Debug for PoolGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("head", &self.list.head)
            .field("free_memory_size", &self.list.free_memory_size)
            .field("free_entry_count", &self.list.free_entry_count)
            .finish_non_exhaustive()
    }
}

struct FreeEntries<'a> {
    memory: &'a HeapMemory,
    next: Option<Address>,
}

impl Iterator for FreeEntries<'_> {
    type Item = FreeEntry;

    fn next(&mut self) -> Option<FreeEntry> {
        let address = self.next?;
        let chunk = FreeChunk::at(address);
        self.next = chunk.next(self.memory);
        Some(FreeEntry {
            address,
            size: chunk.size(self.memory),
        })
    }
}

#[derive(Default)]
struct DetachedList {
    head: Option<Address>,
    tail: Option<Address>,
    count: usize,
    bytes: usize,
}

impl DetachedList {
    fn append(&mut self, memory: &HeapMemory, base: Address, top: Address, minimum_size: usize) {
        let size = top - base;
        if size < minimum_size.max(FREE_CHUNK_HEADER_SIZE) {
            FreeChunk::fill_with_holes(memory, base, size);
            return;
        }
        FreeChunk::write(memory, base, size, None);
        match self.tail {
            Some(tail) => FreeChunk::at(tail).set_next(memory, Some(base)),
            None => self.head = Some(base),
        }
        self.tail = Some(base);
        self.count += 1;
        self.bytes += size;
    }

    fn finish(self) -> Option<FreeEntryList> {
        Some(FreeEntryList {
            head: self.head?,
            tail: self.tail?,
            count: self.count,
            bytes: self.bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{free_listing as listing, pool_with_entries as pool_with};

    #[test]
    fn test_allocate_splits_entry() {
        let pool = pool_with(&[(0, 100), (200, 50)], 16);
        assert_eq!(pool.allocate_object(80), Some(0));
        assert_eq!(listing(&pool), vec![(80, 20), (200, 50)]);
        assert_eq!(pool.free_memory_size(), 70);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_allocate_abandons_small_remainder() {
        let pool = pool_with(&[(0, 100), (200, 50)], 16);
        assert_eq!(pool.allocate_object(95), Some(0));
        assert_eq!(listing(&pool), vec![(200, 50)]);
        assert_eq!(pool.free_memory_size(), 50);
        assert_eq!(pool.allocation_stats().discarded_bytes, 5);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_allocate_failure_records_largest() {
        let pool = pool_with(&[(0, 64), (128, 96)], 16);
        assert_eq!(pool.allocate_object(200), None);
        assert_eq!(pool.largest_free_entry(), 96);
        assert_eq!(pool.free_memory_size(), 160);
    }

    #[test]
    fn test_allocate_exact_fit_unlinks_entry() {
        let pool = pool_with(&[(0, 64), (128, 96)], 16);
        assert_eq!(pool.allocate_object(96), Some(128));
        assert_eq!(listing(&pool), vec![(0, 64)]);
        assert_eq!(pool.free_entry_count(), 1);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_long_walk_records_hint() {
        let entries: Vec<_> = (0..30).map(|i| (i * 64, 32)).collect();
        let pool = pool_with(&entries, 16);
        pool.expand_with_range(30 * 64, 30 * 64 + 256, false);
        assert_eq!(pool.allocate_object(128), Some(30 * 64));
        let hints = pool.hints();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].entry, 29 * 64);
        assert_eq!(hints[0].size, 32);

        // The next request starts from the hint and lands on the remainder.
        assert_eq!(pool.allocate_object(64), Some(30 * 64 + 128));
        assert!(pool.is_valid());
    }

    /// 30 entries of 32 bytes, then 256 bytes at 1920 with a hint recorded
    /// at 1856 by a 128-byte request.
    fn pool_with_hint(first_size: usize) -> MemoryPool {
        let mut entries = vec![(0, first_size)];
        entries.extend((1..30).map(|i| (i * 64, 32)));
        let pool = pool_with(&entries, 16);
        pool.expand_with_range(30 * 64, 30 * 64 + 256, false);
        assert_eq!(pool.allocate_object(128), Some(30 * 64));
        assert_eq!(pool.hints()[0].entry, 29 * 64);
        pool
    }

    #[test]
    fn test_hint_pulled_back_when_previous_entry_grows() {
        let pool = pool_with_hint(32);
        pool.expand_with_range(32, 64, true);
        assert_eq!(listing(&pool)[0], (0, 96));
        assert_eq!(pool.lookup(48).map(|entry| entry.address), Some(0));
        assert_eq!(pool.allocate_object(48), Some(0));
        assert!(pool.is_valid());
    }

    #[test]
    fn test_hint_pulled_back_when_next_entry_grows_down() {
        let pool = pool_with_hint(32);
        pool.expand_with_range(40, 64, true);
        assert_eq!(listing(&pool)[..2], [(0, 32), (40, 56)]);
        assert_eq!(pool.allocate_object(48), Some(40));
        assert!(pool.is_valid());
    }

    #[test]
    fn test_hint_pulled_back_when_added_entries_merge_into_previous() {
        let mut entries = vec![(0, 48)];
        entries.extend((1..30).map(|i| (i * 64, 32)));
        let pool = pool_with(&entries, 16);
        pool.expand_with_range(30 * 64, 30 * 64 + 256, false);
        let removed = pool.remove_free_entries_within_range(16, 48, 16).unwrap();
        assert_eq!(pool.allocate_object(128), Some(30 * 64));
        assert_eq!(pool.hints()[0].entry, 29 * 64);

        pool.add_free_entries(removed);
        assert_eq!(listing(&pool)[0], (0, 48));
        assert!(pool.hints().iter().all(|hint| hint.entry == 0));
        assert_eq!(pool.allocate_object(40), Some(0));
        assert!(pool.is_valid());
    }

    #[test]
    fn test_failed_hinted_walk_counts_entries_before_hint() {
        let pool = pool_with_hint(48);
        assert_eq!(pool.hints()[0].size, 48);
        assert_eq!(pool.allocate_object(200), None);
        assert_eq!(pool.largest_free_entry(), 128);
        assert_eq!(pool.allocate_object(128), Some(30 * 64 + 128));
        assert_eq!(pool.allocate_object(100), None);
        assert_eq!(pool.largest_free_entry(), 48);
    }

    #[test]
    fn test_size_classes_follow_list() {
        let classes = |pool: &MemoryPool| pool.free_entry_size_classes().iter().collect::<Vec<_>>();
        let pool = pool_with(&[(0, 100), (200, 50), (512, 512)], 16);
        assert_eq!(classes(&pool), vec![(32, 1), (64, 1), (512, 1)]);

        assert_eq!(pool.allocate_object(80), Some(0));
        assert_eq!(classes(&pool), vec![(16, 1), (32, 1), (512, 1)]);

        pool.expand_with_range(100, 200, true);
        assert_eq!(listing(&pool), vec![(80, 170), (512, 512)]);
        assert_eq!(classes(&pool), vec![(128, 1), (512, 1)]);

        assert_eq!(pool.contract_with_range(640, 768), Some(640));
        assert_eq!(classes(&pool), vec![(128, 2), (256, 1)]);

        assert_eq!(pool.allocate_tlh(64).map(|tlh| tlh.size()), Some(64));
        assert_eq!(classes(&pool), vec![(64, 1), (128, 1), (256, 1)]);

        let removed = pool.remove_free_entries_within_range(0, 1024, 16).unwrap();
        assert_eq!(pool.free_entry_size_classes().total(), 0);
        pool.add_free_entries(removed);
        assert_eq!(classes(&pool), vec![(64, 1), (128, 1), (256, 1)]);

        assert!(pool.recycle_heap_chunk(2048, 2080));
        assert_eq!(classes(&pool), vec![(32, 1), (64, 1), (128, 1), (256, 1)]);
        assert!(pool.is_valid());

        assert_eq!(pool.rebuild_free_list_in_region(4096, 8192, None), Some(4096));
        assert_eq!(classes(&pool), vec![(4096, 1)]);
    }

    #[test]
    fn test_allocate_tlh_folds_small_remainder() {
        let pool = pool_with(&[(0, 100), (200, 50)], 16);
        let tlh = pool.allocate_tlh(90).unwrap();
        assert_eq!((tlh.base, tlh.top), (0, 100));
        assert_eq!(listing(&pool), vec![(200, 50)]);
        let tlh = pool.allocate_tlh(20).unwrap();
        assert_eq!(tlh.size(), 20);
        assert_eq!(listing(&pool), vec![(220, 30)]);
        assert_eq!(pool.allocation_stats().bytes, 120);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_collector_allocate_without_lock() {
        let pool = pool_with(&[(0, 128)], 16);
        assert_eq!(pool.collector_allocate(32, false), Some(0));
        assert_eq!(pool.collector_allocate_tlh(1024, true).map(|t| t.size()), Some(96));
    }

    #[test]
    #[should_panic(expected = "exclusive access")]
    fn test_collector_allocate_detects_contention() {
        let pool = pool_with(&[(0, 128)], 16);
        let _held = pool.lock();
        let _ = pool.collector_allocate(32, false);
    }

    #[test]
    fn test_expand_with_range_coalesces_both_sides() {
        let pool = pool_with(&[(60, 20), (100, 30)], 16);
        pool.expand_with_range(80, 100, true);
        assert_eq!(listing(&pool), vec![(60, 70)]);
        assert_eq!(pool.free_memory_size(), 70);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_expand_with_range_coalesces_with_next() {
        let pool = pool_with(&[(100, 30)], 16);
        pool.expand_with_range(64, 100, true);
        assert_eq!(listing(&pool), vec![(64, 66)]);
        pool.expand_with_range(8, 16, true);
        assert_eq!(listing(&pool), vec![(64, 66)]);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_contract_with_range_keeps_large_sides() {
        let pool = pool_with(&[(0, 1024)], 16);
        assert_eq!(pool.contract_with_range(256, 512), Some(256));
        assert_eq!(listing(&pool), vec![(0, 256), (512, 512)]);
        assert_eq!(pool.free_memory_size(), 768);
        assert!(pool.is_valid());

        assert_eq!(pool.contract_with_range(8, 256), Some(8));
        assert_eq!(listing(&pool), vec![(512, 512)]);
        assert_eq!(pool.free_memory_size(), 512);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_recycle_heap_chunk_in_order() {
        let pool = pool_with(&[(0, 64), (512, 64)], 16);
        assert!(pool.recycle_heap_chunk(256, 320));
        assert!(!pool.recycle_heap_chunk(400, 408));
        assert_eq!(listing(&pool), vec![(0, 64), (256, 64), (512, 64)]);
        assert_eq!(pool.free_memory_size(), 192);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_remove_and_add_free_entries() {
        let pool = pool_with(&[(0, 256), (512, 128), (768, 512)], 16);
        let removed = pool.remove_free_entries_within_range(128, 1024, 16).unwrap();
        assert_eq!((removed.head, removed.tail), (128, 768));
        assert_eq!(removed.count, 3);
        assert_eq!(removed.bytes, 128 + 128 + 256);
        assert_eq!(listing(&pool), vec![(0, 128), (1024, 256)]);
        assert_eq!(pool.free_memory_size(), 384);
        assert!(pool.is_valid());

        pool.add_free_entries(removed);
        assert_eq!(listing(&pool), vec![(0, 256), (512, 128), (768, 512)]);
        assert_eq!(pool.free_memory_size(), 896);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_remove_free_entries_inside_one_entry() {
        let pool = pool_with(&[(0, 1024)], 16);
        let removed = pool.remove_free_entries_within_range(256, 512, 16).unwrap();
        assert_eq!((removed.head, removed.count, removed.bytes), (256, 1, 256));
        assert_eq!(listing(&pool), vec![(0, 256), (512, 512)]);
        assert_eq!(pool.free_entry_count(), 2);
        assert!(pool.is_valid());
        assert!(pool.remove_free_entries_within_range(2048, 4096, 16).is_none());
    }

    #[test]
    fn test_find_address_after_free_size() {
        let pool = pool_with(&[(0, 64), (256, 128), (1024, 512)], 16);
        assert_eq!(pool.find_address_after_free_size(64, 16), Some(64));
        assert_eq!(pool.find_address_after_free_size(100, 16), Some(256 + 36));
        // Splitting would leave less than the minimum behind.
        assert_eq!(pool.find_address_after_free_size(180, 16), Some(384));
        assert_eq!(pool.find_address_after_free_size(4096, 16), None);
    }

    #[test]
    fn test_entry_lookups() {
        let pool = pool_with(&[(0, 64), (256, 128)], 16);
        assert_eq!(pool.find_free_entry_ending_at(384), Some(256));
        assert_eq!(pool.find_free_entry_ending_at(100), None);
        assert_eq!(pool.find_free_entry_top_starting_at(256), Some(384));
        assert_eq!(pool.find_free_entry_top_starting_at(128), None);
        assert_eq!(pool.available_contraction_size_ending_at(0, 0, 384), 128);
        assert_eq!(pool.available_contraction_size_ending_at(32, 0, 384), 96);
        assert_eq!(pool.available_contraction_size_ending_at(0, 320, 384), 64);
    }

    #[test]
    fn test_move_heap_relinks_moved_entries() {
        let pool = pool_with(&[(0, 64), (4096, 64), (4352, 128)], 16);
        pool.memory().copy_within(4096, 8192, 512);
        pool.move_heap(4096, 4608, 8192);
        assert_eq!(listing(&pool), vec![(0, 64), (8192, 64), (8448, 128)]);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_rebuild_free_list_in_region() {
        let pool = pool_with(&[(0, 64), (256, 128)], 16);
        assert_eq!(pool.rebuild_free_list_in_region(1024, 2048, None), Some(1024));
        assert_eq!(listing(&pool), vec![(1024, 1024)]);
        assert_eq!(pool.free_memory_size(), 1024);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_recalculate_statistics() {
        let pool = pool_with(&[(0, 64), (256, 128)], 16);
        pool.lock().update_statistics(0, 0, 0, FreeEntrySizeClasses::new());
        assert!(!pool.is_valid());
        pool.recalculate_statistics();
        assert_eq!(pool.free_memory_size(), 192);
        assert_eq!(pool.largest_free_entry(), 128);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_reset_clears_everything() {
        let pool = pool_with(&[(0, 64)], 16);
        let _ = pool.allocate_object(16);
        pool.reset();
        assert_eq!(pool.first_free_entry(), None);
        assert_eq!(pool.free_memory_size(), 0);
        assert_eq!(pool.allocation_stats(), AllocationStats::default());
    }
}
