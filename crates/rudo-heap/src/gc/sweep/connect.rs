//! Splicing swept chunks into their pools.
//!
//! Chunks are connected in address order by the master alone. Each pool keeps
//! a [`ConnectState`]: the last entry linked so far, the trailing candidate of
//! the last chunk seen, and running totals. Boundary candidates are merged
//! across chunk seams before they are linked, so a free run split between two
//! chunks ends up as one entry.
//!
//! Compaction rebuilds its free lists through the same state, feeding it
//! whole ranges with [`ConnectState::add_free_entry`].

use super::chunk::SweepChunk;
use crate::pool::{FreeEntry, FreeEntrySizeClasses, MemoryPool, PoolGuard};

#[derive(Debug, Default)]
pub(crate) struct ConnectState {
    /// Last linked entry. Its size may be ahead of what is written in the heap.
    previous: Option<FreeEntry>,
    /// Trailing candidate of the last chunk connected to this pool.
    previous_trailing: Option<FreeEntry>,
    pub free_bytes: usize,
    pub free_entries: usize,
    pub largest_free_entry: usize,
    pub size_classes: FreeEntrySizeClasses,
}

impl ConnectState {
    fn link(&mut self, guard: &mut PoolGuard<'_>, entry: FreeEntry) {
        guard.connect_outer(
            self.previous.map(|previous| previous.address),
            self.previous.map_or(0, |previous| previous.size),
            entry.address,
        );
        self.previous = Some(entry);
        if entry.size != 0 {
            self.free_bytes += entry.size;
            self.free_entries += 1;
            self.largest_free_entry = self.largest_free_entry.max(entry.size);
            self.size_classes.increment(entry.size);
        }
    }

    /// Link `entry` if it is large enough, otherwise make it walkable.
    fn link_or_abandon(&mut self, pool: &MemoryPool, guard: &mut PoolGuard<'_>, entry: FreeEntry) {
        if pool.can_be_connected(entry.size) {
            self.link(guard, entry);
        } else {
            pool.abandon(entry.address, entry.size);
        }
    }

    /// Link an address-ordered free range, or abandon it if too small.
    pub fn add_free_entry(&mut self, pool: &MemoryPool, guard: &mut PoolGuard<'_>, entry: FreeEntry) {
        debug_assert!(self.previous.map_or(true, |previous| previous.end() <= entry.address));
        self.link_or_abandon(pool, guard, entry);
    }

    /// Connect `chunk`. `projection` is how far the last object of the
    /// preceding chunk spills into this one.
    pub(super) fn connect_chunk(
        &mut self,
        pool: &MemoryPool,
        guard: &mut PoolGuard<'_>,
        chunk: &mut SweepChunk,
        projection: usize,
    ) {
        let mut leading = chunk.leading;
        if projection > 0 {
            if projection > chunk.size() {
                chunk.projection = projection - chunk.size();
                leading = None;
            } else {
                leading = leading.map(|entry| {
                    assert!(entry.size >= projection, "object spills over a live object");
                    FreeEntry {
                        address: entry.address + projection,
                        size: entry.size - projection,
                    }
                });
            }
        }

        if let (Some(previous), Some(entry)) = (self.previous.as_mut(), leading) {
            if chunk.coalesce_candidate && previous.end() == entry.address {
                let old_size = previous.size;
                previous.size += entry.size;
                self.size_classes.resize(old_size, previous.size);
                self.free_bytes += entry.size;
                self.largest_free_entry = self.largest_free_entry.max(previous.size);
                leading = None;
            }
        }

        if let Some(trailing) = self.previous_trailing.take() {
            match leading {
                Some(entry) if chunk.coalesce_candidate && trailing.end() == entry.address => {
                    let joint = FreeEntry {
                        address: trailing.address,
                        size: trailing.size + entry.size,
                    };
                    self.link_or_abandon(pool, guard, joint);
                    leading = None;
                }
                _ => self.link_or_abandon(pool, guard, trailing),
            }
        }

        if let Some(entry) = leading {
            if entry.end() == chunk.top {
                chunk.leading = None;
                chunk.trailing = Some(entry);
            } else {
                self.link_or_abandon(pool, guard, entry);
            }
        }

        if let (Some(head), Some(tail)) = (chunk.free_list_head, chunk.free_list_tail) {
            debug_assert!(self.previous.map_or(true, |previous| previous.address < head.address));
            guard.connect_outer(
                self.previous.map(|previous| previous.address),
                self.previous.map_or(0, |previous| previous.size),
                head.address,
            );
            self.previous = Some(tail);
            self.free_bytes += chunk.free_bytes;
            self.free_entries += chunk.free_entries;
            self.largest_free_entry = self.largest_free_entry.max(chunk.largest_free_entry);
            self.size_classes.merge(&chunk.size_classes);
        }

        self.previous_trailing = chunk.trailing;
        guard.add_dark_matter(chunk.dark_matter_bytes, chunk.dark_matter_samples);
    }

    /// Link the last chunk's trailing candidate, terminate the list and
    /// install the totals.
    pub fn finish(mut self, pool: &MemoryPool, guard: &mut PoolGuard<'_>) -> Self {
        if let Some(trailing) = self.previous_trailing.take() {
            self.link_or_abandon(pool, guard, trailing);
        }
        if let Some(last) = self.previous {
            guard.connect_final(last.address, last.size);
        }
        guard.update_statistics(
            self.free_bytes,
            self.free_entries,
            self.largest_free_entry,
            self.size_classes.clone(),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, HeapConfig};

    fn heap() -> Heap {
        let mut config = HeapConfig::new();
        config.set_reserved_size(8192);
        config.set_initial_size(8192);
        config.set_region_size(8192);
        config.set_minimum_free_entry_size(16);
        Heap::new(config).unwrap()
    }

    #[test]
    fn test_connect_merges_trailing_and_leading() {
        let heap = heap();
        let pool = heap.pool(0);
        let mut guard = pool.lock();
        guard.reset();
        let mut state = ConnectState::default();

        let mut first = SweepChunk::new(0, 0, 4096, 0, false);
        first.leading = Some(FreeEntry { address: 0, size: 1000 });
        first.trailing = Some(FreeEntry { address: 4000, size: 96 });
        let mut second = SweepChunk::new(1, 4096, 8192, 0, true);
        second.leading = Some(FreeEntry { address: 4096, size: 104 });

        state.connect_chunk(pool, &mut guard, &mut first, 0);
        state.connect_chunk(pool, &mut guard, &mut second, 0);
        let state = state.finish(pool, &mut guard);
        drop(guard);

        assert_eq!(
            pool.free_entries(),
            vec![
                FreeEntry { address: 0, size: 1000 },
                FreeEntry { address: 4000, size: 200 },
            ]
        );
        assert_eq!(state.free_bytes, 1200);
        assert_eq!(pool.free_entry_size_classes().iter().collect::<Vec<_>>(), vec![(128, 1), (512, 1)]);
        assert!(pool.is_valid());
    }

    #[test]
    fn test_connect_applies_projection() {
        let heap = heap();
        let pool = heap.pool(0);
        let mut guard = pool.lock();
        guard.reset();
        let mut state = ConnectState::default();

        let mut first = SweepChunk::new(0, 0, 4096, 0, false);
        first.projection = 40;
        let mut second = SweepChunk::new(1, 4096, 8192, 0, true);
        second.leading = Some(FreeEntry { address: 4096, size: 200 });

        state.connect_chunk(pool, &mut guard, &mut first, 0);
        state.connect_chunk(pool, &mut guard, &mut second, first.projection);
        state.finish(pool, &mut guard);
        drop(guard);

        assert_eq!(pool.free_entries(), vec![FreeEntry { address: 4136, size: 160 }]);
    }

    #[test]
    fn test_connect_abandons_small_candidates() {
        let heap = heap();
        let pool = heap.pool(0);
        let mut guard = pool.lock();
        guard.reset();
        let mut state = ConnectState::default();

        let mut only = SweepChunk::new(0, 0, 4096, 0, false);
        only.leading = Some(FreeEntry { address: 0, size: 8 });
        only.trailing = Some(FreeEntry { address: 4088, size: 8 });
        state.connect_chunk(pool, &mut guard, &mut only, 0);
        let state = state.finish(pool, &mut guard);
        drop(guard);

        assert_eq!(state.free_entries, 0);
        assert_eq!(pool.free_memory_size(), 0);
        assert_eq!(pool.first_free_entry(), None);
    }
}
