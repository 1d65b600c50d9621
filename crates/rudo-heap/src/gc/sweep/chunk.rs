//! Sweeping one chunk of the mark map.
//!
//! A chunk is swept without looking at its neighbours. Free memory touching
//! the chunk base is kept aside as the leading candidate and free memory
//! touching the chunk top as the trailing candidate; both are resolved when
//! chunks are connected in address order. Everything in between is linked
//! into a chunk-local list with [`MemoryPool::connect_inner`].
//!
//! A free run is found a mark word at a time. Runs of empty words are merged,
//! then widened into the neighbouring words: `leading_zeros` of the word
//! before the run gives the free slots at its high end, `trailing_zeros` of
//! the word after the run gives the free slots at its low end. Holes that do
//! not touch an empty word are never linked; they are dark matter and are
//! only sampled.

use crate::gc::mark::{MarkBitmap, HEAP_BYTES_PER_MAP_WORD};
use crate::heap::{Address, HeapMemory, SLOT_SIZE};
use crate::object::ObjectModel;
use crate::pool::{FreeEntry, FreeEntrySizeClasses, MemoryPool};

/// A swept range of one region.
#[derive(Debug, Clone)]
pub(super) struct SweepChunk {
    pub index: usize,
    pub base: Address,
    pub top: Address,
    pub pool: usize,
    /// The previous chunk ends at `base` in the same region.
    pub coalesce_candidate: bool,
    pub leading: Option<FreeEntry>,
    pub trailing: Option<FreeEntry>,
    /// Bytes of the last object that spill past `top`.
    pub projection: usize,
    pub free_list_head: Option<FreeEntry>,
    pub free_list_tail: Option<FreeEntry>,
    pub free_bytes: usize,
    pub free_entries: usize,
    pub largest_free_entry: usize,
    pub size_classes: FreeEntrySizeClasses,
    pub dark_matter_bytes: usize,
    pub dark_matter_samples: usize,
}

impl SweepChunk {
    pub fn new(index: usize, base: Address, top: Address, pool: usize, coalesce_candidate: bool) -> Self {
        debug_assert!(base % HEAP_BYTES_PER_MAP_WORD == 0 && top % HEAP_BYTES_PER_MAP_WORD == 0);
        Self {
            index,
            base,
            top,
            pool,
            coalesce_candidate,
            leading: None,
            trailing: None,
            projection: 0,
            free_list_head: None,
            free_list_tail: None,
            free_bytes: 0,
            free_entries: 0,
            largest_free_entry: 0,
            size_classes: FreeEntrySizeClasses::new(),
            dark_matter_bytes: 0,
            dark_matter_samples: 0,
        }
    }

    pub const fn size(&self) -> usize {
        self.top - self.base
    }
}

/// Everything a worker needs to sweep chunks.
pub(super) struct ChunkSweeper<'a> {
    pub memory: &'a HeapMemory,
    pub bitmap: &'a MarkBitmap,
    pub model: &'a dyn ObjectModel,
    pub pool: &'a MemoryPool,
    /// Sample every Nth candidate word; `0` disables sampling.
    pub sample_rate: usize,
}

const fn word_base(index: usize) -> Address {
    index * HEAP_BYTES_PER_MAP_WORD
}

/// Free slots at the high end of a mark word, in bytes.
const fn free_high_end(word: u64) -> usize {
    word.leading_zeros() as usize * SLOT_SIZE
}

/// Free slots at the low end of a mark word, in bytes.
const fn free_low_end(word: u64) -> usize {
    word.trailing_zeros() as usize * SLOT_SIZE
}

impl ChunkSweeper<'_> {
    /// Bytes the object marked at `slot` extends beyond its first slot.
    fn spill(&self, slot: Address) -> usize {
        self.model.consumed_size(self.memory, slot) - SLOT_SIZE
    }

    /// Advance over empty words starting at `*current`. Returns the bytes
    /// covered.
    fn skip_empty_words(&self, current: &mut usize, top: usize) -> usize {
        let start = *current;
        while *current < top && self.bitmap.word(*current) == 0 {
            *current += 1;
        }
        (*current - start) * HEAP_BYTES_PER_MAP_WORD
    }

    /// Free bytes at the low end of the word at `index`, if it is in the chunk.
    fn low_end_of(&self, index: usize, top: usize) -> usize {
        if index < top {
            free_low_end(self.bitmap.word(index))
        } else {
            0
        }
    }

    /// Sweep `chunk`, filling in its local free list and boundary candidates.
    ///
    /// Returns `true` if the chunk holds at least one live object.
    pub fn sweep(&self, chunk: &mut SweepChunk) -> bool {
        assert!(chunk.free_list_tail.is_none(), "sweep chunk reused without reset");
        let base_word = MarkBitmap::word_index(chunk.base);
        let top_word = MarkBitmap::word_index(chunk.top);
        let mut current = base_word;

        let leading = self.skip_empty_words(&mut current, top_word) + self.low_end_of(current, top_word);
        if leading > 0 {
            self.add_free_memory(chunk, chunk.base, leading);
        }
        let live_found = current < top_word;

        let rate = if self.sample_rate == 0 { usize::MAX } else { self.sample_rate };
        let mut candidates = 0usize;
        let mut sampled_bytes = 0usize;
        let mut samples = 0usize;

        while current < top_word {
            let run_start = current;
            let mut size = self.skip_empty_words(&mut current, top_word);
            if size == 0 {
                candidates += 1;
                if candidates % rate == 0 {
                    sampled_bytes += self.sample(chunk, current, top_word);
                    samples += 1;
                }
            } else {
                let mut head = word_base(run_start);
                if run_start > base_word {
                    let high_end = free_high_end(self.bitmap.word(run_start - 1));
                    head -= high_end;
                    size += high_end;
                }
                size += self.low_end_of(current, top_word);
                if !self.add_free_memory(chunk, head, size) {
                    break;
                }
                // The word that ended the run is a candidate too.
                continue;
            }
            current += 1;
        }

        let last = current.min(top_word) - 1;
        let last_word = self.bitmap.word(last);
        if last_word != 0 {
            let free = free_high_end(last_word);
            self.calculate_trailing_details(chunk, chunk.top - free, free);
        }

        if samples > 0 {
            let projected = sampled_bytes * candidates / samples;
            let free_space = chunk.free_bytes
                + chunk.leading.map_or(0, |entry| entry.size)
                + chunk.trailing.map_or(0, |entry| entry.size);
            let occupied = chunk.size().saturating_sub(free_space);
            chunk.dark_matter_bytes = if projected >= occupied { sampled_bytes } else { projected };
            chunk.dark_matter_samples = samples;
        }

        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_sweep_chunk(chunk.base, chunk.top, chunk.free_bytes, chunk.free_entries);

        live_found
    }

    /// Record `[addr, addr + size)` where `addr` follows a marked slot or is
    /// the chunk base. Returns `false` once the range reaches the chunk top.
    fn add_free_memory(&self, chunk: &mut SweepChunk, addr: Address, size: usize) -> bool {
        debug_assert!(chunk.free_list_tail.map_or(true, |tail| tail.address <= addr));
        if addr == chunk.base {
            chunk.leading = Some(FreeEntry { address: addr, size });
            return false;
        }
        if addr + size == chunk.top {
            self.calculate_trailing_details(chunk, addr, size);
            return false;
        }

        let spill = self.spill(addr - SLOT_SIZE);
        assert!(spill <= size, "object at {:#x} overlaps a free run", addr - SLOT_SIZE);
        let addr = addr + spill;
        let size = size - spill;
        let previous = chunk.free_list_tail.map(|tail| tail.address);
        if self.pool.connect_inner(addr, size, previous) {
            let entry = FreeEntry { address: addr, size };
            if chunk.free_list_tail.is_none() {
                chunk.free_list_head = Some(entry);
            }
            if size != 0 {
                chunk.free_bytes += size;
                chunk.free_entries += 1;
                chunk.largest_free_entry = chunk.largest_free_entry.max(size);
                chunk.size_classes.increment(size);
            }
            chunk.free_list_tail = Some(entry);
        }
        true
    }

    /// Resolve free memory running up to the chunk top. `addr` follows the
    /// last marked slot of the chunk; the object there may spill into the
    /// free range or past the chunk altogether.
    fn calculate_trailing_details(&self, chunk: &mut SweepChunk, addr: Address, size: usize) {
        let spill = self.spill(addr - SLOT_SIZE);
        if spill > size {
            chunk.projection = spill - size;
        } else if spill < size {
            chunk.trailing = Some(FreeEntry {
                address: addr + spill,
                size: size - spill,
            });
        }
    }

    /// Measure the holes between objects starting in the word at `index`,
    /// plus the hole after its last object when that hole ends in the next,
    /// non-empty word.
    fn sample(&self, chunk: &SweepChunk, index: usize, top_word: usize) -> usize {
        let low = word_base(index);
        let mut objects = self.bitmap.marked_in(low, low + HEAP_BYTES_PER_MAP_WORD);
        let Some(first) = objects.next() else {
            return 0;
        };
        let mut end = first + self.model.consumed_size(self.memory, first);
        let mut dark_matter = 0;
        for object in objects {
            dark_matter += object - end;
            end = object + self.model.consumed_size(self.memory, object);
        }

        let next = index + 1;
        if next < top_word && self.bitmap.word(next) != 0 {
            let limit = (end + self.pool.minimum_free_entry_size()).min(chunk.top);
            if let Some(object) = self.bitmap.find_next_marked(end.max(word_base(next)), limit) {
                dark_matter += object - end;
            }
        }
        dark_matter
    }
}
