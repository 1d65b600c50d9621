//! Collector infrastructure: worker dispatch, the mark bitmap, parallel
//! sweep and parallel compaction.
//!
//! - [`Dispatcher`] forks workers and provides the phase barriers
//! - [`ParallelSweep`] rebuilds free lists from the mark bits
//! - [`CompactScheme`] evacuates and slides live objects
//! - [`GarbageCollector`] runs both with shared metrics

pub mod collector;
pub mod compact;
pub mod dispatcher;
pub mod mark;
pub mod sweep;

#[cfg(feature = "tracing")]
pub mod tracing;

pub use collector::{CollectionKind, CollectorConfig, GarbageCollector};
pub use compact::{CompactConfig, CompactOptions, CompactScheme, CompactStats, ForwardingTable};
pub use dispatcher::{Dispatcher, Task, WorkerEnv};
pub use sweep::{ParallelSweep, SweepConfig, SweepStats};
