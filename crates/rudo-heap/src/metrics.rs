//! Collection metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Statistics from the most recent collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcMetrics {
    /// Duration of the collection.
    pub duration: Duration,
    /// Linked free bytes gained by the collection. Zero if it shrank.
    pub bytes_reclaimed: usize,
    /// Linked free bytes across all pools afterwards.
    pub free_bytes: usize,
    /// Linked free entries across all pools afterwards.
    pub free_entries: usize,
    /// Largest linked entry afterwards.
    pub largest_free_entry: usize,
    /// Dark matter projected by the sweep.
    pub dark_matter_bytes: usize,
    /// Objects moved by compaction.
    pub objects_moved: usize,
    /// Bytes moved by compaction.
    pub bytes_moved: usize,
    /// Type of collection.
    pub collection_type: CollectionType,
    /// Total collections since process start, including this one.
    pub total_collections: usize,
    /// Duration of the sweep phase.
    pub sweep_duration: Duration,
    /// Duration of the compaction phase.
    pub compact_duration: Duration,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero/defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::from_secs(0),
            bytes_reclaimed: 0,
            free_bytes: 0,
            free_entries: 0,
            largest_free_entry: 0,
            dark_matter_bytes: 0,
            objects_moved: 0,
            bytes_moved: 0,
            collection_type: CollectionType::None,
            total_collections: 0,
            sweep_duration: Duration::from_secs(0),
            compact_duration: Duration::from_secs(0),
        }
    }
}

/// Type of collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Sweep only.
    Sweep = 1,
    /// Sweep followed by evacuating compaction.
    Compact = 2,
    /// Sweep followed by sliding compaction of whole regions.
    AggressiveCompact = 3,
}

/// Internal helper for capturing phase durations.
///
/// # Example
///
/// ```
/// use rudo_heap::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... sweep ...
/// timer.end_sweep();
///
/// timer.start();
/// // ... compaction ...
/// timer.end_compact();
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Sweep phase time.
    pub sweep: Duration,
    /// Compaction phase time.
    pub compact: Duration,
    /// Start time of current phase.
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sweep: Duration::ZERO,
            compact: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the sweep phase and record its duration.
    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep = start.elapsed();
        }
    }

    /// End the compaction phase and record its duration.
    pub fn end_compact(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.compact = start.elapsed();
        }
    }
}

/// Process-level cumulative collection statistics.
///
/// # Example
///
/// ```
/// use rudo_heap::global_metrics;
///
/// let metrics = global_metrics();
/// println!("Total collections: {}", metrics.total_collections());
/// println!("Total bytes moved: {}", metrics.total_bytes_moved());
/// ```
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    sweep_collections: AtomicUsize,
    compact_collections: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    objects_moved: AtomicUsize,
    bytes_moved: AtomicUsize,
    pause_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Create a new `GlobalMetrics` with all counters initialized to zero.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            sweep_collections: AtomicUsize::new(0),
            compact_collections: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            objects_moved: AtomicUsize::new(0),
            bytes_moved: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    /// Count a finished collection. Returns the new total.
    pub(crate) fn record(&self, metrics: &GcMetrics) -> usize {
        match metrics.collection_type {
            CollectionType::Sweep => {
                self.sweep_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::Compact | CollectionType::AggressiveCompact => {
                self.compact_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::None => {}
        }
        self.bytes_reclaimed
            .fetch_add(metrics.bytes_reclaimed, Ordering::Relaxed);
        self.objects_moved.fetch_add(metrics.objects_moved, Ordering::Relaxed);
        self.bytes_moved.fetch_add(metrics.bytes_moved, Ordering::Relaxed);
        let pause = u64::try_from(metrics.duration.as_nanos()).unwrap_or(u64::MAX);
        self.pause_ns.fetch_add(pause, Ordering::Relaxed);
        self.collections.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the total number of collections performed.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of sweep-only collections performed.
    #[inline]
    #[must_use]
    pub fn total_sweep_collections(&self) -> usize {
        self.sweep_collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of compacting collections performed.
    #[inline]
    #[must_use]
    pub fn total_compact_collections(&self) -> usize {
        self.compact_collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of free bytes gained by collections.
    #[inline]
    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    /// Returns the total number of objects moved by compaction.
    #[inline]
    #[must_use]
    pub fn total_objects_moved(&self) -> usize {
        self.objects_moved.load(Ordering::Relaxed)
    }

    /// Returns the total number of bytes moved by compaction.
    #[inline]
    #[must_use]
    pub fn total_bytes_moved(&self) -> usize {
        self.bytes_moved.load(Ordering::Relaxed)
    }

    /// Returns the total pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Get the global cumulative collection metrics.
///
/// Returns a reference to the process-level singleton that tracks
/// cumulative statistics across all heaps and collections.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}
