//! Collector tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for collections and their phases.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Collector phases.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Per-chunk bitmap scan.
        Sweep,
        /// Splice of chunk free lists into the pools.
        Connect,
        /// Sub-area table construction and trimming.
        CompactSetup,
        /// Evacuation and sliding.
        Move,
        /// Reference and root fixup.
        Fixup,
        /// Free-list and mark-bit rebuild.
        Rebuild,
    }

    /// Stable identifier for one collection.
    ///
    /// Correlates every event of a single collection. Starts at 1 and
    /// increases monotonically.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next collection id.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole collection.
    pub fn trace_gc_collection(collection_type: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Span covering one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the start of a phase.
    pub fn log_phase_start(phase: GcPhase, free_bytes_before: usize) {
        tracing::debug!(phase = ?phase, free_bytes_before, "phase_start");
    }

    /// Log the end of a phase.
    pub fn log_phase_end(phase: GcPhase, free_bytes_after: usize) {
        tracing::debug!(phase = ?phase, free_bytes_after, "phase_end");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
