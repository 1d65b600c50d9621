//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use rudo_heap::{Address, Heap, HeapConfig, HeapMemory, MemoryPool, SlotObjectModel};

/// Pool over a fresh arena whose free list is exactly `entries`.
pub fn pool_with(entries: &[(Address, usize)], minimum: usize) -> MemoryPool {
    let memory = Arc::new(HeapMemory::new(64 * 1024).unwrap());
    let pool = MemoryPool::new(memory, minimum);
    for &(addr, size) in entries {
        pool.expand_with_range(addr, addr + size, false);
    }
    pool
}

pub fn listing(pool: &MemoryPool) -> Vec<(Address, usize)> {
    pool.free_entries().iter().map(|e| (e.address, e.size)).collect()
}

/// Fully committed heap of `size` bytes cut into `region` byte regions.
pub fn heap(size: usize, region: usize, minimum: usize) -> Heap {
    let mut config = HeapConfig::new();
    config.set_reserved_size(size);
    config.set_initial_size(size);
    config.set_region_size(region);
    config.set_minimum_free_entry_size(minimum);
    Heap::new(config).unwrap()
}

pub fn live(heap: &Heap, addr: Address, size: usize, references: usize) {
    SlotObjectModel::write_object(heap.memory(), addr, size, references);
    heap.mark_object(addr);
}

pub fn dead(heap: &Heap, addr: Address, size: usize) {
    SlotObjectModel::write_object(heap.memory(), addr, size, 0);
}

/// Check the free-list invariants the pool must hold in every state.
pub fn assert_pool_invariants(pool: &MemoryPool) {
    let entries = pool.free_entries();
    for pair in entries.windows(2) {
        assert!(pair[0].end() <= pair[1].address, "entries overlap or are unordered: {pair:?}");
    }
    for entry in &entries {
        assert!(entry.size >= pool.minimum_free_entry_size(), "undersized entry {entry:?}");
    }
    let total: usize = entries.iter().map(|e| e.size).sum();
    assert_eq!(total, pool.free_memory_size());
    assert_eq!(entries.len(), pool.free_entry_count());
    assert!(pool.is_valid());
}

/// Small deterministic generator so layouts are reproducible.
pub struct XorShift(u64);

impl XorShift {
    pub const fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}
