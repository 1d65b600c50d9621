//! Parallel sweep: rebuild every pool's free list from the mark bitmap.
//!
//! The committed heap is cut into chunks that never cross a region boundary.
//! Workers claim chunks through the dispatcher's work units and sweep them
//! independently; the master then connects the chunks in address order.
//!
//! ```text
//! master:  reset pools, prepare chunks ─┐
//! all:                                  └─ sweep claimed chunks ─┐
//! master:                                                        └─ connect, flush pools
//! ```

mod chunk;
mod connect;

use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};

use self::chunk::{ChunkSweeper, SweepChunk};
pub(crate) use self::connect::ConnectState;
use crate::gc::dispatcher::{Dispatcher, Task, WorkerEnv};
use crate::gc::mark::HEAP_BYTES_PER_MAP_WORD;
use crate::heap::{align_up, Heap};
use crate::object::ObjectModel;
use crate::pool::MemoryPool;

const MIN_CHUNK_SIZE: usize = 4 * 1024;
const MAX_CHUNK_SIZE: usize = 256 * 1024;
const CHUNKS_PER_THREAD: usize = 32;

/// Sweep tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    /// Bytes per chunk. `None` sizes chunks from the heap and thread count.
    pub chunk_size: Option<usize>,
    /// Sample one in this many candidate mark words for dark matter.
    /// `0` disables sampling.
    pub dark_matter_sample_rate: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            dark_matter_sample_rate: 32,
        }
    }
}

impl SweepConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed chunk size, rounded up to a whole mark word.
    pub const fn set_chunk_size(&mut self, bytes: usize) {
        self.chunk_size = Some(bytes);
    }

    /// Set the dark matter sample rate.
    pub const fn set_dark_matter_sample_rate(&mut self, rate: usize) {
        self.dark_matter_sample_rate = rate;
    }

    fn chunk_size_for(&self, heap_size: usize, threads: usize) -> usize {
        match self.chunk_size {
            Some(bytes) => align_up(bytes.max(1), HEAP_BYTES_PER_MAP_WORD),
            None => align_up(heap_size / (threads * CHUNKS_PER_THREAD), HEAP_BYTES_PER_MAP_WORD)
                .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Chunks swept.
    pub chunks: usize,
    /// Bytes linked into pools.
    pub free_bytes: usize,
    /// Entries linked into pools.
    pub free_entries: usize,
    /// Largest linked entry.
    pub largest_free_entry: usize,
    /// Projected dark matter.
    pub dark_matter_bytes: usize,
    /// Wall time of the sweep.
    pub duration: Duration,
}

/// Mark-bitmap driven sweep over every committed region.
///
/// # Example
///
/// ```
/// use rudo_heap::gc::{Dispatcher, ParallelSweep};
/// use rudo_heap::{Heap, HeapConfig, SlotObjectModel};
///
/// let mut config = HeapConfig::new();
/// config.set_reserved_size(1 << 20);
/// config.set_initial_size(1 << 20);
/// let heap = Heap::new(config).unwrap();
///
/// let live = heap.allocate_object(64).unwrap();
/// SlotObjectModel::write_object(heap.memory(), live, 64, 0);
/// heap.mark_object(live);
///
/// let stats = ParallelSweep::default().sweep(&heap, &SlotObjectModel, &Dispatcher::new(2));
/// assert_eq!(stats.free_bytes, (1 << 20) - 64);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelSweep {
    config: SweepConfig,
}

impl ParallelSweep {
    /// Create a sweep with `config`.
    #[must_use]
    pub const fn new(config: SweepConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Rebuild every pool's free list from the mark bitmap.
    ///
    /// Unmarked memory becomes free entries or, when too small to link,
    /// holes. Every pool's previous list, hints and statistics are discarded.
    pub fn sweep(&self, heap: &Heap, model: &dyn ObjectModel, dispatcher: &Dispatcher) -> SweepStats {
        let start = Instant::now();
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Sweep);
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_phase_start(
            crate::tracing::internal::GcPhase::Sweep,
            heap.free_memory_size(),
        );

        let task = SweepTask {
            heap,
            model,
            chunk_size: self
                .config
                .chunk_size_for(heap.committed_size(), dispatcher.thread_count()),
            sample_rate: self.config.dark_matter_sample_rate,
            chunks: RwLock::new(Vec::new()),
            results: SegQueue::new(),
            stats: Mutex::new(SweepStats::default()),
        };
        dispatcher.run(&task);

        let mut stats = task.stats.into_inner();
        stats.duration = start.elapsed();

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_phase_end(crate::tracing::internal::GcPhase::Sweep, stats.free_bytes);
        stats
    }
}

struct SweepTask<'a> {
    heap: &'a Heap,
    model: &'a dyn ObjectModel,
    chunk_size: usize,
    sample_rate: usize,
    chunks: RwLock<Vec<SweepChunk>>,
    results: SegQueue<SweepChunk>,
    stats: Mutex<SweepStats>,
}

impl SweepTask<'_> {
    fn prepare_chunks(&self) -> Vec<SweepChunk> {
        let mut chunks = Vec::new();
        for region in self.heap.regions() {
            let mut base = region.low;
            while base < region.high {
                let top = (base + self.chunk_size).min(region.high);
                chunks.push(SweepChunk::new(chunks.len(), base, top, region.pool, base != region.low));
                base = top;
            }
        }
        chunks
    }

    fn sweep_chunks(&self, env: &WorkerEnv<'_>) {
        let chunks = self.chunks.read();
        for prepared in chunks.iter() {
            if env.handle_next_work_unit() {
                let sweeper = ChunkSweeper {
                    memory: self.heap.memory(),
                    bitmap: self.heap.mark_bits(),
                    model: self.model,
                    pool: self.heap.pool(prepared.pool),
                    sample_rate: self.sample_rate,
                };
                let mut chunk = prepared.clone();
                sweeper.sweep(&mut chunk);
                self.results.push(chunk);
            }
        }
    }

    fn connect_all_chunks(&self) {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Connect);

        let mut swept = Vec::with_capacity(self.results.len());
        while let Some(chunk) = self.results.pop() {
            swept.push(chunk);
        }
        swept.sort_unstable_by_key(|chunk| chunk.index);
        assert_eq!(swept.len(), self.chunks.read().len(), "sweep chunk lost");

        let pools = self.heap.pools();
        let mut guards: Vec<_> = pools.iter().map(MemoryPool::lock).collect();
        let mut states: Vec<ConnectState> = pools.iter().map(|_| ConnectState::default()).collect();
        let mut stats = SweepStats {
            chunks: swept.len(),
            ..SweepStats::default()
        };

        let mut projection = 0;
        for chunk in &mut swept {
            let incoming = if chunk.coalesce_candidate { projection } else { 0 };
            states[chunk.pool].connect_chunk(&pools[chunk.pool], &mut guards[chunk.pool], chunk, incoming);
            projection = chunk.projection;
            stats.dark_matter_bytes += chunk.dark_matter_bytes;
        }

        for (index, (state, guard)) in states.into_iter().zip(guards.iter_mut()).enumerate() {
            let state = state.finish(&pools[index], guard);
            stats.free_bytes += state.free_bytes;
            stats.free_entries += state.free_entries;
            stats.largest_free_entry = stats.largest_free_entry.max(state.largest_free_entry);
            debug_assert!(guard.is_valid(), "pool {index} invalid after sweep");
            #[cfg(feature = "tracing")]
            crate::gc::tracing::log_pool_rebuilt(
                index,
                state.free_bytes,
                state.free_entries,
                state.largest_free_entry,
            );
        }
        *self.stats.lock() = stats;
    }
}

impl Task for SweepTask<'_> {
    fn run(&self, env: &WorkerEnv<'_>) {
        if env.sync_and_release_master() {
            for pool in self.heap.pools() {
                pool.lock().reset();
            }
            *self.chunks.write() = self.prepare_chunks();
            env.release_synchronized();
        }

        self.sweep_chunks(env);

        if env.sync_and_release_master() {
            self.connect_all_chunks();
            env.release_synchronized();
        }
    }
}
