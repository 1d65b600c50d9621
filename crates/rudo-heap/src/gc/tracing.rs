//! Collector-level tracing events.

use crate::heap::Address;

/// Log the result of sweeping one chunk.
pub fn log_sweep_chunk(base: Address, top: Address, free_bytes: usize, free_entries: usize) {
    tracing::debug!(base, top, free_bytes, free_entries, "sweep_chunk");
}

/// Log an evacuation of part of a sub-area into a lower one.
pub fn log_evacuation(source: Address, destination: Address, bytes: usize) {
    tracing::debug!(source, destination, bytes, "evacuation");
}

/// Log that a sub-area's remaining objects are slid in place.
pub fn log_fallback_to_slide(source: Address, remaining_from: Address) {
    tracing::debug!(source, remaining_from, "fallback_to_slide");
}

/// Log a pool after its free list was rebuilt.
pub fn log_pool_rebuilt(pool: usize, free_bytes: usize, free_entries: usize, largest: usize) {
    tracing::debug!(pool, free_bytes, free_entries, largest, "pool_rebuilt");
}
