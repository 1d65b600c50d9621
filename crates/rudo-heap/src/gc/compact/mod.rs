//! Parallel compaction: evacuate sub-areas into lower free space, slide what
//! is left, fix up every reference and rebuild pools and mark bits.
//!
//! ```text
//! master:  build sub-area table ─┐
//! all:                           └─ find first live object per sub-area ─┐
//! master:                           drop empty sub-areas, reset pools  ─┘─┐
//! all:                                             evacuate / slide ──────┘ (barrier)
//! all:                                             fix up objects and roots (barrier)
//! all:                                             rebuild mark bits ─┐
//! master:                                          rebuild free lists ┘
//! ```
//!
//! Sub-areas are claimed with a compare-and-swap on their action, so each
//! phase runs exactly once per sub-area. A sub-area being emptied moves
//! `Init -> Busy`. Once processed, one with enough free space becomes `Ready`
//! and may then be claimed (`Ready -> Busy`) by a higher sub-area as an
//! evacuation destination. Objects that fit nowhere
//! are slid down within their own sub-area, so compaction never fails.

mod sub_area;
mod table;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

pub use self::table::ForwardingTable;

use self::sub_area::{build_table, starts_region, SubAreaAction, SubAreaEntry, SubAreaState};
use self::table::CompactTableEntry;
use crate::free_chunk::FreeChunk;
use crate::gc::dispatcher::{Dispatcher, Task, WorkerEnv};
use crate::gc::sweep::ConnectState;
use crate::heap::{align_up, page_index, page_start, Address, Heap, HeapMemory, COMPACT_PAGE_SIZE};
use crate::object::{HeapWalker, ObjectModel};
use crate::pool::{FreeEntry, MemoryPool};
use crate::roots::RootSet;

/// Root slots fixed up per work unit.
const ROOT_BATCH_SIZE: usize = 256;

/// Compaction tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactConfig {
    /// Bytes per sub-area, rounded up to the compaction page.
    pub sub_area_size: usize,
    /// Smallest free space worth offering as an evacuation destination.
    pub tlh_minimum_size: usize,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            sub_area_size: 4 * 1024 * 1024,
            tlh_minimum_size: 512,
        }
    }
}

impl CompactConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sub-area size.
    pub const fn set_sub_area_size(&mut self, bytes: usize) {
        self.sub_area_size = bytes;
    }

    /// Set the minimum destination size.
    pub const fn set_tlh_minimum_size(&mut self, bytes: usize) {
        self.tlh_minimum_size = bytes;
    }
}

/// Per-run compaction options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactOptions {
    /// One sub-area per region and no evacuation: every region is slid.
    pub aggressive: bool,
    /// Rebuild the mark bits for the final object positions. When off, the
    /// bitmap is left holding the forwarding table and must be cleared
    /// before the next marking.
    pub rebuild_mark_bits: bool,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            aggressive: false,
            rebuild_mark_bits: true,
        }
    }
}

impl CompactOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a sliding-only compaction.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            aggressive: true,
            ..Self::default()
        }
    }
}

/// Outcome of one compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactStats {
    /// Sub-areas left after empty ones were dropped.
    pub sub_areas: usize,
    /// Objects copied to a new address.
    pub moved_objects: usize,
    /// Bytes copied, before any growth on move.
    pub moved_bytes: usize,
    /// Objects whose reference slots were fixed up.
    pub fixed_up_objects: usize,
    /// Non-null roots rewritten.
    pub fixed_up_roots: usize,
    /// Sub-areas that sent objects to a lower sub-area.
    pub evacuated_sub_areas: usize,
    /// Sub-areas compacted in place.
    pub slid_sub_areas: usize,
    /// Bytes linked into pools afterwards.
    pub free_bytes: usize,
    /// Entries linked into pools afterwards.
    pub free_entries: usize,
    /// Start of the range objects may have moved in.
    pub compact_from: Address,
    /// End of the range objects may have moved in.
    pub compact_to: Address,
    /// Table construction and real-limit discovery.
    pub setup_duration: Duration,
    /// Evacuation and sliding.
    pub move_duration: Duration,
    /// Object and root fixup.
    pub fixup_duration: Duration,
    /// Mark-bit and free-list rebuild.
    pub rebuild_duration: Duration,
    /// Wall time of the whole compaction.
    pub duration: Duration,
}

impl CompactStats {
    const fn absorb(&mut self, worker: &Self) {
        self.moved_objects += worker.moved_objects;
        self.moved_bytes += worker.moved_bytes;
        self.fixed_up_objects += worker.fixed_up_objects;
        self.fixed_up_roots += worker.fixed_up_roots;
        self.evacuated_sub_areas += worker.evacuated_sub_areas;
        self.slid_sub_areas += worker.slid_sub_areas;
    }
}

/// Parallel sub-area compactor.
///
/// Expects the live objects to be marked and every pool to own whole
/// regions. Afterwards each pool's free list describes the space left
/// behind, and every root and reference slot points at the moved objects.
///
/// # Example
///
/// ```
/// use rudo_heap::gc::{CompactOptions, CompactScheme, Dispatcher};
/// use rudo_heap::{Heap, HeapConfig, RootSet, SlotObjectModel};
///
/// let mut config = HeapConfig::new();
/// config.set_reserved_size(1 << 20);
/// config.set_initial_size(1 << 20);
/// let heap = Heap::new(config).unwrap();
///
/// let dead = heap.allocate_object(4096).unwrap();
/// SlotObjectModel::write_object(heap.memory(), dead, 4096, 0);
/// let live = heap.allocate_object(64).unwrap();
/// SlotObjectModel::write_object(heap.memory(), live, 64, 0);
/// heap.mark_object(live);
///
/// let mut roots = RootSet::new();
/// let root = roots.add(Some(live));
/// let stats = CompactScheme::default().compact(
///     &heap,
///     &SlotObjectModel,
///     &roots,
///     &Dispatcher::new(1),
///     CompactOptions::default(),
/// );
/// assert_eq!(roots.get(root), Some(dead));
/// assert_eq!(stats.moved_objects, 1);
/// assert_eq!(heap.free_memory_size(), (1 << 20) - 64);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactScheme {
    config: CompactConfig,
}

impl CompactScheme {
    /// Create a compactor with `config`.
    #[must_use]
    pub const fn new(config: CompactConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &CompactConfig {
        &self.config
    }

    /// Compact the heap.
    ///
    /// # Panics
    ///
    /// Panics if an internal invariant is broken, for example if an object
    /// grows further on move than the gap it slides into.
    pub fn compact(
        &self,
        heap: &Heap,
        model: &dyn ObjectModel,
        roots: &RootSet,
        dispatcher: &Dispatcher,
        options: CompactOptions,
    ) -> CompactStats {
        let start = Instant::now();
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_phase_start(
            crate::tracing::internal::GcPhase::CompactSetup,
            heap.free_memory_size(),
        );

        let task = CompactTask {
            heap,
            model,
            roots,
            sub_area_size: align_up(self.config.sub_area_size.max(1), COMPACT_PAGE_SIZE),
            tlh_minimum_size: self.config.tlh_minimum_size,
            options,
            table: RwLock::new(Vec::new()),
            compact_from: AtomicUsize::new(0),
            compact_to: AtomicUsize::new(0),
            stats: Mutex::new(CompactStats::default()),
        };
        dispatcher.run(&task);

        let mut stats = task.stats.into_inner();
        stats.compact_from = task.compact_from.into_inner();
        stats.compact_to = task.compact_to.into_inner();
        stats.duration = start.elapsed();

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_phase_end(crate::tracing::internal::GcPhase::Rebuild, stats.free_bytes);
        stats
    }
}

/// Where a run of [`CompactTask::do_compact`] stopped.
struct Compacted {
    /// First marked object left in place, if the destination ran out.
    next: Option<Address>,
    /// First byte after the last object written.
    dead: Address,
}

/// Make `[from, to)` walkable as free space, split at the start of the page
/// holding `to`. Returns the bytes below that page, the part that may
/// receive objects: the page of `to` has its mark bits rebuilt with the
/// following sub-area.
fn set_free_chunk_page_aligned(memory: &HeapMemory, from: Address, to: Address) -> usize {
    let aligned = page_start(to);
    if from >= aligned {
        FreeChunk::fill_with_holes(memory, from, to - from);
        return 0;
    }
    FreeChunk::fill_with_holes(memory, from, aligned - from);
    FreeChunk::fill_with_holes(memory, aligned, to - aligned);
    aligned - from
}

struct CompactTask<'a> {
    heap: &'a Heap,
    model: &'a dyn ObjectModel,
    roots: &'a RootSet,
    sub_area_size: usize,
    tlh_minimum_size: usize,
    options: CompactOptions,
    table: RwLock<Vec<SubAreaEntry>>,
    compact_from: AtomicUsize,
    compact_to: AtomicUsize,
    stats: Mutex<CompactStats>,
}

impl CompactTask<'_> {
    fn memory(&self) -> &HeapMemory {
        self.heap.memory()
    }

    fn forwarding(&self) -> ForwardingTable<'_> {
        ForwardingTable::new(
            self.heap.memory(),
            self.heap.mark_bits(),
            self.model,
            self.compact_from.load(Ordering::Acquire),
            self.compact_to.load(Ordering::Acquire),
        )
    }

    const fn state_for(&self, free_size: usize) -> SubAreaState {
        if free_size >= self.tlh_minimum_size {
            SubAreaState::Ready
        } else {
            SubAreaState::Full
        }
    }

    fn set_real_limits(&self) {
        let table = self.table.read();
        let bitmap = self.heap.mark_bits();
        for (index, entry) in table.iter().enumerate() {
            if entry.state() != SubAreaState::Init || starts_region(&table, index) {
                continue;
            }
            if entry.change_action(SubAreaAction::SettingRealLimits) {
                let limit = table[index + 1].low;
                entry.set_first_object(bitmap.find_next_marked(entry.low, limit));
            }
        }
    }

    fn remove_null_sub_areas(&self) -> usize {
        let mut table = self.table.write();
        table.retain(|entry| entry.first_object().is_some());

        let first = table.iter().position(|entry| entry.state() == SubAreaState::Init);
        let last = table.iter().rposition(|entry| entry.state() == SubAreaState::Init);
        if let (Some(first), Some(last)) = (first, last) {
            self.compact_from.store(table[first].start(), Ordering::Release);
            self.compact_to.store(table[last + 1].start(), Ordering::Release);
        }
        table.iter().filter(|entry| entry.state().is_sub_area()).count()
    }

    fn move_objects(&self, counts: &mut CompactStats) {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Move);

        let table = self.table.read();
        for (index, entry) in table.iter().enumerate() {
            if entry.claim_for_evacuation() {
                self.evacuate_sub_area(&table, index, counts);
            }
        }
    }

    /// Empty sub-area `index` into lower `Ready` sub-areas, then slide what
    /// did not fit.
    fn evacuate_sub_area(&self, table: &[SubAreaEntry], index: usize, counts: &mut CompactStats) {
        let memory = self.memory();
        let source = &table[index];
        let first = source.start();
        let end = table[index + 1].start();

        let mut remaining = self.heap.mark_bits().find_next_marked(first, page_start(end));
        let mut evacuated = false;
        if !self.options.aggressive {
            for destination in &table[..index] {
                let Some(next) = remaining else {
                    break;
                };
                if destination.pool != source.pool
                    || !destination.change_state(SubAreaState::Ready, SubAreaState::Busy)
                {
                    continue;
                }
                let Some(cursor) = destination.free_chunk() else {
                    destination.set_state(SubAreaState::Full);
                    continue;
                };
                let capacity = destination.free_size();
                let moved = self.do_compact(next, end, cursor, Some(capacity), counts);
                let left = capacity - (moved.dead - cursor);
                FreeChunk::fill_with_holes(memory, moved.dead, left);
                destination.set_free(Some(moved.dead), left);
                destination.set_state(self.state_for(left));

                if moved.dead > cursor {
                    evacuated = true;
                    #[cfg(feature = "tracing")]
                    crate::gc::tracing::log_evacuation(next, cursor, moved.dead - cursor);
                }
                remaining = moved.next;
            }
        }
        if evacuated {
            counts.evacuated_sub_areas += 1;
        }

        let free_chunk = match remaining {
            None => Some(first),
            Some(next) if evacuated => {
                #[cfg(feature = "tracing")]
                crate::gc::tracing::log_fallback_to_slide(first, next);
                counts.slid_sub_areas += 1;
                Some(self.do_compact(next, end, first, None, counts).dead)
            }
            Some(_) => self.first_dead(first, end).map(|dead| {
                match self.heap.mark_bits().find_next_marked(dead, page_start(end)) {
                    Some(next) => {
                        counts.slid_sub_areas += 1;
                        self.do_compact(next, end, dead, None, counts).dead
                    }
                    None => dead,
                }
            }),
        };

        let free_size = free_chunk.map_or(0, |chunk| set_free_chunk_page_aligned(memory, chunk, end));
        source.set_free(free_chunk, free_size);
        source.set_state(self.state_for(free_size));
    }

    /// End of the run of live objects starting at `from`, if it ends before
    /// `end`.
    fn first_dead(&self, from: Address, end: Address) -> Option<Address> {
        let bitmap = self.heap.mark_bits();
        // The page holding `end` belongs to the next sub-area.
        let limit = page_start(end);
        let mut cursor = from;
        while cursor < end {
            if cursor >= limit || !bitmap.is_marked(cursor) {
                return Some(cursor);
            }
            cursor += self.model.consumed_size(self.memory(), cursor);
        }
        None
    }

    /// Move the marked objects of `[start, finish)` down to `dead`, recording
    /// forwarding addresses page by page.
    ///
    /// With a `capacity` the objects are evacuated: a page is only started if
    /// all of its objects fit in what is left, otherwise the run stops and
    /// reports the page's first object. Without one they slide in place.
    fn do_compact(
        &self,
        start: Address,
        finish: Address,
        mut dead: Address,
        capacity: Option<usize>,
        counts: &mut CompactStats,
    ) -> Compacted {
        let memory = self.memory();
        let bitmap = self.heap.mark_bits();
        let limit = page_start(finish);
        let base = dead;

        let mut current_page = None;
        let mut entry = CompactTableEntry::default();
        let mut saved = 0;
        let mut next = None;

        for object in bitmap.marked_in(start, limit) {
            let page = page_index(object);
            if current_page != Some(page) {
                if let Some(previous) = current_page.take() {
                    entry.store(bitmap, previous);
                }
                if let Some(capacity) = capacity {
                    let page_end = (page_start(object) + COMPACT_PAGE_SIZE).min(limit);
                    let needed: usize = bitmap
                        .marked_in(object, page_end)
                        .map(|marked| self.model.consumed_size_for_move(memory, marked))
                        .sum();
                    if dead - base + needed > capacity {
                        next = Some(object);
                        break;
                    }
                }
                current_page = Some(page);
                entry = CompactTableEntry::default();
                saved = 0;
            }

            entry.save_forwarding_ptr(object, dead, saved);
            saved += 1;

            let size = self.model.consumed_size(memory, object);
            if dead == object {
                dead += size;
                continue;
            }
            let new_size = self.model.consumed_size_for_move(memory, object);
            assert!(
                capacity.is_some() || dead + new_size <= object + size,
                "object at {object:#x} grows past the gap it slides into"
            );
            self.model.pre_move(memory, object);
            memory.copy_within(object, dead, size);
            self.model.post_move(memory, object, dead);
            dead += new_size;
            counts.moved_objects += 1;
            counts.moved_bytes += size;
        }

        if let Some(page) = current_page {
            entry.store(bitmap, page);
        }
        Compacted { next, dead }
    }

    fn fixup_objects(&self, counts: &mut CompactStats) {
        let memory = self.memory();
        let forwarding = self.forwarding();
        let table = self.table.read();
        for (index, entry) in table.iter().enumerate() {
            if !entry.state().is_sub_area() || !entry.change_action(SubAreaAction::FixingUp) {
                continue;
            }
            let walker = HeapWalker::new(memory, self.model, entry.start(), table[index + 1].start());
            for (object, _) in walker.objects() {
                self.model.for_each_reference(memory, object, &mut |slot| {
                    if let Some(target) = memory.read_reference(slot) {
                        memory.write_reference(slot, Some(forwarding.get_forwarding_ptr(target)));
                    }
                });
                counts.fixed_up_objects += 1;
            }
        }
    }

    fn fixup_roots(&self, env: &WorkerEnv<'_>, counts: &mut CompactStats) {
        let forwarding = self.forwarding();
        for batch in 0..self.roots.batch_count(ROOT_BATCH_SIZE) {
            if env.handle_next_work_unit() {
                counts.fixed_up_roots += self
                    .roots
                    .fix_up_batch(batch, ROOT_BATCH_SIZE, |target| forwarding.get_forwarding_ptr(target));
            }
        }
    }

    fn rebuild_mark_bits(&self) {
        let memory = self.memory();
        let bitmap = self.heap.mark_bits();
        let table = self.table.read();
        for (index, entry) in table.iter().enumerate() {
            if !entry.state().is_sub_area() || !entry.change_action(SubAreaAction::RebuildingMarkBits) {
                continue;
            }
            let (low, high) = (entry.start(), table[index + 1].start());
            bitmap.clear_range(page_start(low), page_start(high));
            if entry.free_chunk() == Some(low) {
                continue;
            }
            for (object, _) in HeapWalker::new(memory, self.model, low, high).objects() {
                bitmap.mark(object);
            }
        }
    }

    /// Relink every pool from the sub-areas' free chunks, in address order.
    fn rebuild_free_lists(&self, stats: &mut CompactStats) {
        let table = self.table.read();
        let pools = self.heap.pools();
        let mut guards: Vec<_> = pools.iter().map(MemoryPool::lock).collect();
        let mut states: Vec<ConnectState> = pools.iter().map(|_| ConnectState::default()).collect();

        let mut free_base: Option<(Address, usize)> = None;
        let mut close = |base: Option<(Address, usize)>, end: Address| {
            if let Some((address, pool)) = base.filter(|&(address, _)| address < end) {
                let entry = FreeEntry {
                    address,
                    size: end - address,
                };
                states[pool].add_free_entry(&pools[pool], &mut guards[pool], entry);
            }
        };
        for entry in table.iter() {
            let start = entry.start();
            if !entry.state().is_sub_area() {
                close(free_base.take(), start);
                continue;
            }
            match entry.free_chunk() {
                Some(chunk) if chunk == start => {
                    free_base.get_or_insert((start, entry.pool));
                }
                Some(chunk) => {
                    close(free_base.take(), start);
                    free_base = Some((chunk, entry.pool));
                }
                None => close(free_base.take(), start),
            }
        }
        debug_assert!(free_base.is_none(), "free range left open past the heap end");

        for (index, (state, guard)) in states.into_iter().zip(guards.iter_mut()).enumerate() {
            let state = state.finish(&pools[index], guard);
            stats.free_bytes += state.free_bytes;
            stats.free_entries += state.free_entries;
            debug_assert!(guard.is_valid(), "pool {index} invalid after compaction");
            #[cfg(feature = "tracing")]
            crate::gc::tracing::log_pool_rebuilt(
                index,
                state.free_bytes,
                state.free_entries,
                state.largest_free_entry,
            );
        }
    }
}

impl Task for CompactTask<'_> {
    fn run(&self, env: &WorkerEnv<'_>) {
        let mut counts = CompactStats::default();
        let mut phase = Instant::now();

        if env.sync_and_release_master() {
            #[cfg(feature = "tracing")]
            let _span = crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::CompactSetup);
            *self.table.write() = build_table(self.heap, self.sub_area_size, self.options.aggressive);
            env.release_synchronized();
        }

        self.set_real_limits();

        if env.sync_and_release_master() {
            let sub_areas = self.remove_null_sub_areas();
            for pool in self.heap.pools() {
                pool.lock().reset();
            }
            let mut stats = self.stats.lock();
            stats.sub_areas = sub_areas;
            stats.setup_duration = phase.elapsed();
            drop(stats);
            env.release_synchronized();
        }
        phase = Instant::now();

        self.move_objects(&mut counts);
        env.sync_all();
        if env.is_master() {
            self.stats.lock().move_duration = phase.elapsed();
        }
        phase = Instant::now();

        {
            #[cfg(feature = "tracing")]
            let _span = crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Fixup);
            self.fixup_objects(&mut counts);
            self.fixup_roots(env, &mut counts);
        }
        env.sync_all();
        if env.is_master() {
            self.stats.lock().fixup_duration = phase.elapsed();
        }
        phase = Instant::now();

        {
            #[cfg(feature = "tracing")]
            let _span = crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Rebuild);
            if self.options.rebuild_mark_bits {
                self.rebuild_mark_bits();
            }
        }
        self.stats.lock().absorb(&counts);

        if env.sync_and_release_master() {
            let mut stats = self.stats.lock();
            self.rebuild_free_lists(&mut stats);
            stats.rebuild_duration = phase.elapsed();
            drop(stats);
            env.release_synchronized();
        }
    }
}
