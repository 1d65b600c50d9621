//! Mark state shared by sweep and compaction.
//!
//! Marking itself is driven by the embedder: live objects are recorded with
//! [`crate::Heap::mark_object`] before a collection is started.

pub mod bitmap;

pub use bitmap::{MarkBitmap, MarkedObjects, HEAP_BYTES_PER_MAP_WORD};
