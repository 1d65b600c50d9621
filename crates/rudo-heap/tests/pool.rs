//! Integration tests for the address-ordered free-list pool.

mod common;

use common::{assert_pool_invariants, listing, pool_with, XorShift};
use rudo_heap::{Address, MemoryPool};

#[test]
fn test_allocate_links_large_remainder() {
    let pool = pool_with(&[(0, 100), (200, 50)], 16);
    assert_eq!(pool.allocate_object(80), Some(0));
    assert_eq!(listing(&pool), vec![(80, 20), (200, 50)]);
    assert_eq!(pool.free_memory_size(), 70);
    assert_pool_invariants(&pool);
}

#[test]
fn test_allocate_abandons_small_remainder() {
    let pool = pool_with(&[(0, 100), (200, 50)], 16);
    assert_eq!(pool.allocate_object(95), Some(0));
    assert_eq!(listing(&pool), vec![(200, 50)]);
    // The 5 trailing bytes are discarded, not linked.
    assert_eq!(pool.free_memory_size(), 50);
    assert_eq!(pool.allocation_stats().discarded_bytes, 5);
    assert_pool_invariants(&pool);
}

#[test]
fn test_expand_coalesces_with_both_neighbours() {
    let pool = pool_with(&[(60, 20), (100, 30)], 16);
    pool.expand_with_range(80, 100, true);
    assert_eq!(listing(&pool), vec![(60, 70)]);
    assert_eq!(pool.free_memory_size(), 70);
    assert_pool_invariants(&pool);
}

#[test]
fn test_expand_without_coalescing_keeps_entries() {
    let pool = pool_with(&[(64, 32), (128, 32)], 16);
    pool.expand_with_range(96, 128, false);
    assert_eq!(listing(&pool), vec![(64, 32), (96, 32), (128, 32)]);
    assert_pool_invariants(&pool);
}

#[test]
fn test_allocation_failure_records_largest_entry() {
    let pool = pool_with(&[(0, 64), (128, 96), (512, 80)], 16);
    assert_eq!(pool.allocate_object(100), None);
    assert_eq!(pool.largest_free_entry(), 96);
    assert_eq!(listing(&pool).len(), 3);
}

#[test]
fn test_tlh_takes_head_entry() {
    let pool = pool_with(&[(0, 256), (512, 64)], 16);
    let tlh = pool.allocate_tlh(1024).unwrap();
    assert_eq!((tlh.base, tlh.top), (0, 256));
    let tlh = pool.allocate_tlh(40).unwrap();
    assert_eq!((tlh.base, tlh.top), (512, 552));
    assert_eq!(listing(&pool), vec![(552, 24)]);
    assert_pool_invariants(&pool);
}

#[test]
fn test_contract_splits_entry() {
    let pool = pool_with(&[(0, 1024)], 16);
    pool.contract_with_range(256, 512);
    assert_eq!(listing(&pool), vec![(0, 256), (512, 512)]);
    assert_pool_invariants(&pool);
}

#[test]
fn test_hint_search_matches_linear_search() {
    // Thirty small entries in front of larger ones force long walks and
    // populate the hint cache.
    let mut entries: Vec<_> = (0..30).map(|i| (i * 64, 32)).collect();
    entries.extend((0..8).map(|i| (4096 + i * 1024, 256 + i * 64)));
    let pool = pool_with(&entries, 16);

    let mut rng = XorShift::new(0x5eed);
    for _ in 0..200 {
        let size = 16 + rng.below(40) * 8;
        let expected = pool.lookup(size).map(|entry| entry.address);
        assert_eq!(pool.allocate_object(size), expected, "request of {size} bytes");
        assert_pool_invariants(&pool);
        if expected.is_none() {
            break;
        }
    }
    assert!(pool.allocation_stats().count > 0);
}

/// Every hint must only skip entries no larger than its size, and a hint at
/// or past the head must point at a linked entry.
fn assert_hints_hold(pool: &MemoryPool) {
    let entries = pool.free_entries();
    let head = entries.first().map(|entry| entry.address);
    for hint in pool.hints() {
        if head.map_or(true, |head| hint.entry < head) {
            continue;
        }
        assert!(
            entries.iter().any(|entry| entry.address == hint.entry),
            "hint {hint:?} points between entries"
        );
        for entry in entries.iter().take_while(|entry| entry.address < hint.entry) {
            assert!(entry.size <= hint.size, "hint {hint:?} skips {entry:?}");
        }
    }
}

#[test]
fn test_hinted_allocation_matches_linear_search_under_mixed_operations() {
    const SLOTS: usize = 200;
    const SLOT: usize = 256;

    let mut rng = XorShift::new(0x0dd_ba11);
    let entries: Vec<_> = (0..SLOTS)
        .map(|i| {
            let size = if rng.below(10) == 0 {
                128 + rng.below(16) * 8
            } else {
                16 + rng.below(12) * 8
            };
            (i * SLOT, size)
        })
        .collect();
    let pool = pool_with(&entries, 16);

    let mut allocated: Vec<(Address, usize)> = Vec::new();
    let mut saw_hint = false;
    for step in 0..1000 {
        let op = rng.below(10);
        match op {
            4 | 5 | 6 if !allocated.is_empty() => {
                let (addr, size) = allocated.swap_remove(rng.below(allocated.len()));
                if op == 6 {
                    assert!(pool.recycle_heap_chunk(addr, addr + size));
                } else {
                    pool.expand_with_range(addr, addr + size, true);
                }
            }
            7 => {
                if let Some(tlh) = pool.allocate_tlh(16 + rng.below(64) * 8) {
                    allocated.push((tlh.base, tlh.size()));
                }
            }
            8 | 9 => {
                let low = rng.below(SLOTS) * SLOT + rng.below(32) * 8;
                let high = low + 16 + rng.below(128) * 8;
                if let Some(removed) = pool.remove_free_entries_within_range(low, high, 16) {
                    assert_pool_invariants(&pool);
                    pool.add_free_entries(removed);
                }
            }
            _ => {
                let size = 16 + rng.below(31) * 8;
                let expected = pool.lookup(size).map(|entry| entry.address);
                assert_eq!(pool.allocate_object(size), expected, "step {step}: request of {size} bytes");
                if let Some(addr) = expected {
                    allocated.push((addr, size));
                }
            }
        }
        assert_pool_invariants(&pool);
        assert_hints_hold(&pool);
        saw_hint |= !pool.hints().is_empty();
    }
    assert!(saw_hint);
}

#[test]
fn test_allocations_never_overlap() {
    let pool = pool_with(&[(0, 8192), (16384, 8192)], 16);
    let mut rng = XorShift::new(7);
    let mut allocated = Vec::new();
    loop {
        let size = 16 + rng.below(64) * 8;
        let Some(addr) = pool.allocate_object(size) else {
            break;
        };
        allocated.push((addr, size));
        assert_pool_invariants(&pool);
    }
    allocated.sort_unstable();
    for pair in allocated.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlap between {pair:?}");
    }
    for &(addr, size) in &allocated {
        assert!(addr + size <= 8192 || (addr >= 16384 && addr + size <= 16384 + 8192));
    }
}

#[test]
fn test_collector_allocate_with_lock() {
    let pool = pool_with(&[(0, 512)], 16);
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..4 {
                    assert!(pool.collector_allocate(32, true).is_some());
                }
            });
        }
    });
    assert!(listing(&pool).is_empty());
    assert_eq!(pool.free_memory_size(), 0);
    assert_eq!(pool.allocation_stats().count, 16);
}
