//! Heap engine for a stop-the-world garbage collector.
//!
//! `rudo-heap` manages a single reserved address range for a managed
//! runtime. It provides an **address-ordered free-list allocator**, a
//! **parallel sweep** that rebuilds free lists from a mark bitmap, and a
//! **parallel compactor** that slides and evacuates live objects while
//! keeping a compressed forwarding table in the mark bitmap itself.
//!
//! # Features
//!
//! - **First-fit allocation** with a small hint cache for long free lists
//! - **Thread-local heaps (TLH)**: whole free entries handed to a mutator
//! - **Parallel sweep**: chunked bitmap scan with dark-matter projection
//! - **Parallel compaction**: sub-area evacuation, sliding fallback,
//!   parallel reference and root fixup
//! - **Pluggable object model**: sizes, references and move hooks come from
//!   an [`ObjectModel`]
//!
//! # Quick Start
//!
//! ```
//! use rudo_heap::gc::{CollectionKind, GarbageCollector};
//! use rudo_heap::{Heap, HeapConfig, RootSet, SlotObjectModel};
//!
//! let mut config = HeapConfig::new();
//! config.set_reserved_size(1 << 20);
//! config.set_initial_size(1 << 20);
//! let heap = Heap::new(config).unwrap();
//!
//! // Allocate two objects, the second referencing the first.
//! let a = heap.allocate_object(32).unwrap();
//! SlotObjectModel::write_object(heap.memory(), a, 32, 0);
//! let b = heap.allocate_object(32).unwrap();
//! SlotObjectModel::write_object(heap.memory(), b, 32, 1);
//! SlotObjectModel::set_reference(heap.memory(), b, 0, Some(a));
//!
//! // Marking is up to the embedder.
//! heap.mark_object(a);
//! heap.mark_object(b);
//!
//! let mut roots = RootSet::new();
//! roots.add(Some(b));
//! GarbageCollector::default().collect(&heap, &SlotObjectModel, &roots, CollectionKind::Sweep);
//! assert_eq!(heap.free_memory_size(), (1 << 20) - 64);
//! ```
//!
//! # Addresses
//!
//! Every [`Address`] is a byte offset from the heap base. References stored
//! in the heap use the same encoding, with [`heap::NULL_REFERENCE`] for null.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod free_chunk;
pub mod gc;
pub mod heap;
pub mod metrics;
pub mod object;
pub mod pool;
pub mod roots;
mod tracing;

// Re-export public API
pub use free_chunk::{FreeChunk, FREE_CHUNK_HEADER_SIZE};
pub use heap::{Address, Heap, HeapConfig, HeapMemory, Region};
pub use metrics::{global_metrics, CollectionType, GcMetrics, GlobalMetrics};
pub use object::{HeapEntry, HeapWalker, ObjectModel, SlotObjectModel};
pub use pool::{AllocationStats, FreeEntry, FreeEntrySizeClasses, MemoryPool, PoolGuard, Tlh};
pub use roots::{RootHandle, RootSet};
pub use tracing::GcId;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util;
