//! Collection driver: one dispatcher shared by sweep and compaction.
//!
//! Marking is done by the caller. A collection consumes the mark bitmap as
//! it finds it and leaves it describing the live objects afterwards, at
//! their new addresses when compaction ran.

use std::time::Instant;

use parking_lot::Mutex;

use crate::gc::compact::{CompactConfig, CompactOptions, CompactScheme};
use crate::gc::dispatcher::Dispatcher;
use crate::gc::sweep::{ParallelSweep, SweepConfig};
use crate::heap::Heap;
use crate::metrics::{global_metrics, CollectionType, GcMetrics, PhaseTimer};
use crate::object::ObjectModel;
use crate::roots::RootSet;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{next_gc_id, trace_gc_collection};

/// What a collection does after marking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectionKind {
    /// Rebuild free lists only.
    #[default]
    Sweep,
    /// Sweep, then evacuate and slide sub-areas.
    Compact,
    /// Sweep, then slide every region into its low end.
    AggressiveCompact,
}

impl CollectionKind {
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    const fn as_str(self) -> &'static str {
        match self {
            Self::Sweep => "sweep",
            Self::Compact => "compact",
            Self::AggressiveCompact => "aggressive_compact",
        }
    }

    const fn collection_type(self) -> CollectionType {
        match self {
            Self::Sweep => CollectionType::Sweep,
            Self::Compact => CollectionType::Compact,
            Self::AggressiveCompact => CollectionType::AggressiveCompact,
        }
    }
}

/// Collector configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Worker threads, including the calling thread.
    pub gc_threads: usize,
    /// Sweep tuning.
    pub sweep: SweepConfig,
    /// Compaction tuning.
    pub compact: CompactConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            gc_threads: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            sweep: SweepConfig::default(),
            compact: CompactConfig::default(),
        }
    }
}

impl CollectorConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads. Zero is treated as one.
    pub const fn set_gc_threads(&mut self, threads: usize) {
        self.gc_threads = if threads == 0 { 1 } else { threads };
    }

    /// Set the sweep tuning.
    pub const fn set_sweep(&mut self, config: SweepConfig) {
        self.sweep = config;
    }

    /// Set the compaction tuning.
    pub const fn set_compact(&mut self, config: CompactConfig) {
        self.compact = config;
    }
}

/// Sweep and compaction behind a single entry point.
///
/// # Example
///
/// ```
/// use rudo_heap::gc::{CollectionKind, CollectorConfig, GarbageCollector};
/// use rudo_heap::{Heap, HeapConfig, RootSet, SlotObjectModel};
///
/// let mut config = HeapConfig::new();
/// config.set_reserved_size(1 << 20);
/// config.set_initial_size(1 << 20);
/// let heap = Heap::new(config).unwrap();
///
/// let dead = heap.allocate_object(128).unwrap();
/// SlotObjectModel::write_object(heap.memory(), dead, 128, 0);
/// let live = heap.allocate_object(64).unwrap();
/// SlotObjectModel::write_object(heap.memory(), live, 64, 0);
/// heap.mark_object(live);
///
/// let mut roots = RootSet::new();
/// let root = roots.add(Some(live));
///
/// let mut collector_config = CollectorConfig::new();
/// collector_config.set_gc_threads(2);
/// let collector = GarbageCollector::new(collector_config);
/// let metrics = collector.collect(&heap, &SlotObjectModel, &roots, CollectionKind::AggressiveCompact);
///
/// assert_eq!(roots.get(root), Some(dead));
/// assert_eq!(metrics.objects_moved, 1);
/// assert_eq!(metrics.free_bytes, (1 << 20) - 64);
/// ```
#[derive(Debug)]
pub struct GarbageCollector {
    dispatcher: Dispatcher,
    sweep: ParallelSweep,
    compact: CompactScheme,
    metrics: Mutex<GcMetrics>,
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new(CollectorConfig::default())
    }
}

impl GarbageCollector {
    /// Create a collector.
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(config.gc_threads),
            sweep: ParallelSweep::new(config.sweep),
            compact: CompactScheme::new(config.compact),
            metrics: Mutex::new(GcMetrics::new()),
        }
    }

    /// The worker pool shared by every phase.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Metrics of the most recent collection run by this collector.
    #[must_use]
    pub fn last_metrics(&self) -> GcMetrics {
        *self.metrics.lock()
    }

    /// Collect `heap` from its current mark bits.
    ///
    /// Every object the caller did not mark is garbage. With a compacting
    /// `kind`, `roots` and references inside live objects are updated to the
    /// new addresses.
    pub fn collect(&self, heap: &Heap, model: &dyn ObjectModel, roots: &RootSet, kind: CollectionKind) -> GcMetrics {
        #[cfg(feature = "tracing")]
        let gc_id = next_gc_id();
        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_collection(kind.as_str(), gc_id);

        let start = Instant::now();
        let free_before = heap.free_memory_size();
        let mut timer = PhaseTimer::new();

        timer.start();
        let sweep = self.sweep.sweep(heap, model, &self.dispatcher);
        timer.end_sweep();

        let mut metrics = GcMetrics {
            collection_type: kind.collection_type(),
            dark_matter_bytes: sweep.dark_matter_bytes,
            ..GcMetrics::new()
        };

        let options = match kind {
            CollectionKind::Sweep => None,
            CollectionKind::Compact => Some(CompactOptions::new()),
            CollectionKind::AggressiveCompact => Some(CompactOptions::aggressive()),
        };
        if let Some(options) = options {
            timer.start();
            let compact = self.compact.compact(heap, model, roots, &self.dispatcher, options);
            timer.end_compact();
            metrics.objects_moved = compact.moved_objects;
            metrics.bytes_moved = compact.moved_bytes;
        }

        metrics.free_bytes = heap.free_memory_size();
        metrics.free_entries = heap.pools().iter().map(|pool| pool.free_entry_count()).sum();
        metrics.largest_free_entry = heap
            .pools()
            .iter()
            .map(|pool| pool.largest_free_entry())
            .max()
            .unwrap_or(0);
        metrics.bytes_reclaimed = metrics.free_bytes.saturating_sub(free_before);
        metrics.sweep_duration = timer.sweep;
        metrics.compact_duration = timer.compact;
        metrics.duration = start.elapsed();
        metrics.total_collections = global_metrics().record(&metrics);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            gc_id = gc_id.0,
            kind = kind.as_str(),
            free_bytes = metrics.free_bytes,
            bytes_reclaimed = metrics.bytes_reclaimed,
            objects_moved = metrics.objects_moved,
            "collection_end"
        );

        *self.metrics.lock() = metrics;
        metrics
    }
}
