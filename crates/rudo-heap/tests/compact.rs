//! Integration tests for the parallel compactor.

mod common;

use std::collections::HashSet;

use common::{assert_pool_invariants, dead, heap, listing, live, XorShift};
use rudo_heap::gc::{CompactConfig, CompactOptions, CompactScheme, Dispatcher, ForwardingTable};
use rudo_heap::{Address, Heap, HeapConfig, ObjectModel, RootSet, SlotObjectModel};

fn scheme(sub_area_size: usize) -> CompactScheme {
    let mut config = CompactConfig::new();
    config.set_sub_area_size(sub_area_size);
    CompactScheme::new(config)
}

const KEEP_TABLE: CompactOptions = CompactOptions {
    aggressive: false,
    rebuild_mark_bits: false,
};

#[test]
fn test_objects_evacuate_packed_into_lower_sub_area() {
    let heap = heap(8192, 8192, 64);
    live(&heap, 0, 64, 0);
    live(&heap, 4096, 24, 0);
    live(&heap, 4120, 16, 0);
    live(&heap, 4136, 40, 0);

    let stats = scheme(4096).compact(&heap, &SlotObjectModel, &RootSet::new(), &Dispatcher::new(1), KEEP_TABLE);
    assert_eq!(stats.moved_objects, 3);
    assert_eq!(stats.moved_bytes, 80);
    assert_eq!(stats.evacuated_sub_areas, 1);

    let table = ForwardingTable::new(
        heap.memory(),
        heap.mark_bits(),
        &SlotObjectModel,
        stats.compact_from,
        stats.compact_to,
    );
    let destination = table.get_forwarding_ptr(4096);
    assert_eq!(destination, 64);
    assert_eq!(table.get_forwarding_ptr(4120), destination + 24);
    assert_eq!(table.get_forwarding_ptr(4136), destination + 40);
    assert_eq!(table.get_forwarding_ptr(0), 0);

    // No gaps between the moved objects.
    let memory = heap.memory();
    assert_eq!(SlotObjectModel.consumed_size(memory, 64), 24);
    assert_eq!(SlotObjectModel.consumed_size(memory, 88), 16);
    assert_eq!(SlotObjectModel.consumed_size(memory, 104), 40);
    assert_eq!(listing(heap.pool(0)), vec![(144, 8192 - 144)]);
}

/// A live object of the random layout.
#[derive(Debug, Clone)]
struct Original {
    address: Address,
    size: usize,
    id: u64,
    references: Vec<Option<Address>>,
}

/// Fill `heap` with objects, about two thirds live, each live object
/// referencing up to two earlier live objects and tagged with an id in its
/// first payload word.
fn random_layout(heap: &Heap, seed: u64) -> Vec<Original> {
    let memory = heap.memory();
    let mut rng = XorShift::new(seed);
    let mut originals: Vec<Original> = Vec::new();
    loop {
        let size = 24 + rng.below(30) * 8;
        let Some(address) = heap.allocate_object(size) else {
            break;
        };
        if rng.below(3) == 0 {
            dead(heap, address, size);
            continue;
        }
        let slots = rng.below(3).min(size / 8 - 2);
        live(heap, address, size, slots);
        let id = originals.len() as u64 + 1;
        SlotObjectModel::set_payload_word(memory, address, 0, id);
        let mut references = Vec::new();
        for slot in 0..slots {
            let target = (!originals.is_empty() && rng.below(4) != 0)
                .then(|| originals[rng.below(originals.len())].address);
            SlotObjectModel::set_reference(memory, address, slot, target);
            references.push(target);
        }
        originals.push(Original {
            address,
            size,
            id,
            references,
        });
    }
    originals
}

#[test]
fn test_forwarding_is_injective_ordered_and_in_range() {
    let heap = heap(64 * 1024, 16 * 1024, 64);
    let originals = random_layout(&heap, 0x1234_5678);
    let mut roots = RootSet::new();
    let handles: Vec<_> = originals
        .iter()
        .step_by(5)
        .map(|object| (roots.add(Some(object.address)), object.address))
        .collect();

    let stats = scheme(4096).compact(&heap, &SlotObjectModel, &roots, &Dispatcher::new(4), KEEP_TABLE);
    let memory = heap.memory();
    let table = ForwardingTable::new(memory, heap.mark_bits(), &SlotObjectModel, stats.compact_from, stats.compact_to);

    let mut seen = HashSet::new();
    for object in &originals {
        let new = table.get_forwarding_ptr(object.address);
        assert!(seen.insert(new), "two objects forwarded to {new:#x}");
        if (stats.compact_from..stats.compact_to).contains(&object.address) {
            assert!(new >= stats.compact_from && new < stats.compact_to);
        } else {
            assert_eq!(new, object.address);
        }
        assert!(new <= object.address, "object at {:#x} moved up", object.address);
        assert_eq!(SlotObjectModel.consumed_size(memory, new), object.size);
        assert_eq!(SlotObjectModel::payload_word(memory, new, 0), object.id);
        for (slot, target) in object.references.iter().enumerate() {
            let expected = target.map(|target| table.get_forwarding_ptr(target));
            assert_eq!(SlotObjectModel::reference(memory, new, slot), expected);
        }
    }

    // Objects sharing a compaction page keep their relative order.
    for pair in originals.windows(2) {
        if pair[0].address / 1024 == pair[1].address / 1024 {
            assert!(table.get_forwarding_ptr(pair[0].address) < table.get_forwarding_ptr(pair[1].address));
        }
    }

    for (handle, original) in handles {
        assert_eq!(roots.get(handle), Some(table.get_forwarding_ptr(original)));
    }
    assert_eq!(stats.fixed_up_roots, roots.len());
    assert_pool_invariants(heap.pool(0));
}

#[test]
fn test_mark_bits_rebuilt_at_new_addresses() {
    let heap = heap(64 * 1024, 16 * 1024, 64);
    let originals = random_layout(&heap, 99);
    let mut roots = RootSet::new();
    let handles: Vec<_> = originals
        .iter()
        .map(|object| (roots.add(Some(object.address)), object.id))
        .collect();

    let stats = scheme(4096).compact(&heap, &SlotObjectModel, &roots, &Dispatcher::new(3), CompactOptions::new());
    assert!(stats.moved_objects > 0);

    let memory = heap.memory();
    for &(handle, id) in &handles {
        let new = roots.get(handle).unwrap();
        assert!(heap.is_marked(new));
        assert_eq!(SlotObjectModel::payload_word(memory, new, 0), id);
    }
    assert_eq!(heap.mark_bits().count_marked(), originals.len());

    let live_bytes: usize = originals.iter().map(|object| object.size).sum();
    assert!(heap.free_memory_size() + live_bytes <= heap.committed_size());
    assert_eq!(stats.free_bytes, heap.free_memory_size());
    assert_pool_invariants(heap.pool(0));
}

#[test]
fn test_aggressive_compaction_packs_every_region() {
    for threads in [1, 2, 4] {
        let heap = heap(64 * 1024, 16 * 1024, 64);
        let originals = random_layout(&heap, 2024);
        let mut roots = RootSet::new();
        let handles: Vec<_> = originals.iter().map(|object| roots.add(Some(object.address))).collect();

        let stats = scheme(4096).compact(
            &heap,
            &SlotObjectModel,
            &roots,
            &Dispatcher::new(threads),
            CompactOptions::aggressive(),
        );
        assert_eq!(stats.evacuated_sub_areas, 0);

        let mut cursor = None;
        for (object, handle) in originals.iter().zip(&handles) {
            let region = heap.region_for(object.address).unwrap();
            let expected = match cursor {
                Some((low, top)) if low == region.low => top,
                _ => region.low,
            };
            assert_eq!(roots.get(*handle), Some(expected), "{threads} threads");
            cursor = Some((region.low, expected + object.size));
        }

        // One free entry per region, running to the region top.
        for entry in heap.pool(0).free_entries() {
            assert_eq!(entry.end(), heap.region_for(entry.address).unwrap().high);
        }
        assert_pool_invariants(heap.pool(0));
    }
}

#[test]
fn test_compacting_twice_moves_nothing() {
    let heap = heap(32 * 1024, 16 * 1024, 64);
    random_layout(&heap, 5);
    let scheme = scheme(4096);
    let dispatcher = Dispatcher::new(2);
    let roots = RootSet::new();
    let first = scheme.compact(&heap, &SlotObjectModel, &roots, &dispatcher, CompactOptions::aggressive());
    assert!(first.moved_objects > 0);
    let entries = heap.pool(0).free_entries();
    let second = scheme.compact(&heap, &SlotObjectModel, &roots, &dispatcher, CompactOptions::aggressive());
    assert_eq!(second.moved_objects, 0);
    assert_eq!(heap.pool(0).free_entries(), entries);
}

#[test]
fn test_hashed_object_grows_when_moved() {
    let heap = heap(4096, 4096, 16);
    let memory = heap.memory();
    dead(&heap, 0, 64);
    live(&heap, 64, 32, 0);
    SlotObjectModel::mark_hashed(memory, 64);
    live(&heap, 96, 32, 1);
    SlotObjectModel::set_reference(memory, 96, 0, Some(64));

    let mut roots = RootSet::new();
    let hashed = roots.add(Some(64));
    let holder = roots.add(Some(96));
    scheme(4096).compact(&heap, &SlotObjectModel, &roots, &Dispatcher::new(1), CompactOptions::aggressive());

    assert_eq!(roots.get(hashed), Some(0));
    assert_eq!(roots.get(holder), Some(40));
    assert_eq!(SlotObjectModel.consumed_size(memory, 0), 40);
    assert_eq!(SlotObjectModel::hash_code(memory, 0), 64);
    assert_eq!(SlotObjectModel::reference(memory, 40, 0), Some(0));
    assert_eq!(listing(heap.pool(0)), vec![(72, 4096 - 72)]);
}

#[test]
fn test_evacuation_stays_within_pool() {
    let mut config = HeapConfig::new();
    config.set_reserved_size(16 * 1024);
    config.set_initial_size(4096);
    config.set_region_size(4096);
    let mut heap = Heap::new(config).unwrap();
    let other = heap.add_pool();
    heap.expand(4096, other).unwrap();
    heap.expand(4096, 0).unwrap();

    live(&heap, 0, 64, 0);
    dead(&heap, 4096, 512);
    live(&heap, 4608, 64, 0);
    dead(&heap, 8192, 256);
    live(&heap, 8448, 64, 0);

    let mut roots = RootSet::new();
    let in_other = roots.add(Some(4608));
    let in_first = roots.add(Some(8448));
    let stats = scheme(4096).compact(&heap, &SlotObjectModel, &roots, &Dispatcher::new(1), CompactOptions::new());

    assert_eq!(roots.get(in_first), Some(64));
    assert_eq!(roots.get(in_other), Some(4096));
    assert_eq!(stats.evacuated_sub_areas, 1);
    assert_eq!(stats.slid_sub_areas, 1);
    assert_eq!(listing(heap.pool(0)), vec![(128, 4096 - 128), (8192, 4096)]);
    assert_eq!(listing(heap.pool(other)), vec![(4160, 4096 - 64)]);
}
