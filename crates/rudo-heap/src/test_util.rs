//! Builders shared by unit tests, integration tests and benches.

use std::sync::Arc;

use crate::heap::{Address, Heap, HeapConfig, HeapMemory};
use crate::object::SlotObjectModel;
use crate::pool::MemoryPool;

/// A pool over a fresh 64 KiB arena whose free list is exactly `entries`.
///
/// # Panics
///
/// Panics if the arena cannot be reserved.
#[must_use]
pub fn pool_with_entries(entries: &[(Address, usize)], minimum_free_entry_size: usize) -> MemoryPool {
    let memory = Arc::new(HeapMemory::new(64 * 1024).expect("reserve test arena"));
    let pool = MemoryPool::new(memory, minimum_free_entry_size);
    for &(address, size) in entries {
        pool.expand_with_range(address, address + size, false);
    }
    pool
}

/// The pool's free list as `(address, size)` pairs.
#[must_use]
pub fn free_listing(pool: &MemoryPool) -> Vec<(Address, usize)> {
    pool.free_entries()
        .iter()
        .map(|entry| (entry.address, entry.size))
        .collect()
}

/// A fully committed heap of `size` bytes cut into `region_size` regions.
///
/// # Panics
///
/// Panics if the configuration is rejected or memory cannot be reserved.
#[must_use]
pub fn heap_with_regions(size: usize, region_size: usize) -> Heap {
    let mut config = HeapConfig::new();
    config.set_reserved_size(size);
    config.set_initial_size(size);
    config.set_region_size(region_size);
    Heap::new(config).expect("create test heap")
}

/// Write a [`SlotObjectModel`] object at `address` and mark it.
pub fn place_live_object(heap: &Heap, address: Address, size: usize, references: usize) {
    SlotObjectModel::write_object(heap.memory(), address, size, references);
    heap.mark_object(address);
}

/// Write an unmarked [`SlotObjectModel`] object at `address`.
pub fn place_dead_object(heap: &Heap, address: Address, size: usize) {
    SlotObjectModel::write_object(heap.memory(), address, size, 0);
}
