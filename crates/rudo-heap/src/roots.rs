//! Root slots handed to the compactor.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::Address;

const NULL_ROOT: usize = usize::MAX;

/// Handle to a slot in a [`RootSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(usize);

/// Growable set of references held outside the heap.
///
/// Compaction rewrites every non-null slot to the object's new address.
#[derive(Debug, Default)]
pub struct RootSet {
    slots: Vec<AtomicUsize>,
}

impl RootSet {
    /// An empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Add a slot holding `target`.
    pub fn add(&mut self, target: Option<Address>) -> RootHandle {
        self.slots.push(AtomicUsize::new(target.unwrap_or(NULL_ROOT)));
        RootHandle(self.slots.len() - 1)
    }

    /// Current value of a slot.
    #[must_use]
    pub fn get(&self, handle: RootHandle) -> Option<Address> {
        match self.slots[handle.0].load(Ordering::Relaxed) {
            NULL_ROOT => None,
            addr => Some(addr),
        }
    }

    /// Overwrite a slot.
    pub fn set(&self, handle: RootHandle, target: Option<Address>) {
        self.slots[handle.0].store(target.unwrap_or(NULL_ROOT), Ordering::Relaxed);
    }

    /// Number of slots.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the set has no slots.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Non-null slot values.
    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&addr| addr != NULL_ROOT)
    }

    /// Rewrite every non-null slot in `batch` with `forward`. Returns the
    /// number of slots rewritten.
    pub(crate) fn fix_up_batch(&self, batch: usize, batch_size: usize, forward: impl Fn(Address) -> Address) -> usize {
        let start = batch * batch_size;
        let end = (start + batch_size).min(self.slots.len());
        let mut fixed = 0;
        for slot in &self.slots[start.min(end)..end] {
            let addr = slot.load(Ordering::Relaxed);
            if addr != NULL_ROOT {
                slot.store(forward(addr), Ordering::Relaxed);
                fixed += 1;
            }
        }
        fixed
    }

    pub(crate) fn batch_count(&self, batch_size: usize) -> usize {
        self.slots.len().div_ceil(batch_size)
    }
}
