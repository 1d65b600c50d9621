//! Object model seam and heap walking.
//!
//! The heap engine never interprets object contents itself. Sizes, reference
//! slots and move hooks all come from an [`ObjectModel`] supplied by the
//! embedder. [`SlotObjectModel`] is a small model used by the tests, benches
//! and anyone who just needs "a header word followed by reference slots".

use crate::free_chunk::HoleKind;
use crate::heap::{Address, HeapMemory, SLOT_SIZE};

/// Interprets objects stored in the heap.
///
/// Implementations must be usable from every collector worker at once.
pub trait ObjectModel: Sync {
    /// Bytes occupied by the object at `object`. A non-zero multiple of 8.
    fn consumed_size(&self, memory: &HeapMemory, object: Address) -> usize;

    /// Bytes the object will occupy once moved.
    fn consumed_size_for_move(&self, memory: &HeapMemory, object: Address) -> usize {
        self.consumed_size(memory, object)
    }

    /// Called before the object's bytes are copied.
    fn pre_move(&self, _memory: &HeapMemory, _object: Address) {}

    /// Called after the object's bytes were copied from `from` to `to`.
    /// Only the memory at `to` is valid.
    fn post_move(&self, _memory: &HeapMemory, _from: Address, _to: Address) {}

    /// Call `visit` with the address of every reference slot in the object.
    fn for_each_reference(
        &self,
        memory: &HeapMemory,
        object: Address,
        visit: &mut dyn FnMut(Address),
    );
}

/// Header-plus-slots object layout.
///
/// ```text
/// header bits  0..32   consumed size in bytes (8 aligned)
/// header bit   2       hashed: identity hash was observed
/// header bits 32..48   number of reference slots
/// header bit  48       hash slot appended after a move
/// slots                reference slots, then payload words
/// ```
///
/// A hashed object grows by one slot the first time it moves; the slot keeps
/// the address it was hashed at so [`SlotObjectModel::hash_code`] stays stable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotObjectModel;

const SIZE_MASK: u64 = 0xFFFF_FFF8;
const HASHED: u64 = 1 << 2;
const REF_COUNT_SHIFT: u32 = 32;
const REF_COUNT_MASK: u64 = 0xFFFF;
const HASH_SLOT: u64 = 1 << 48;

impl SlotObjectModel {
    /// Write a fresh object of `size` bytes with `references` null slots and
    /// zeroed payload.
    ///
    /// # Panics
    ///
    /// Panics if `size` is unaligned, below the minimum object size, or too
    /// small for the requested slots.
    pub fn write_object(memory: &HeapMemory, addr: Address, size: usize, references: usize) {
        assert!(size >= crate::heap::MIN_OBJECT_SIZE && size % SLOT_SIZE == 0);
        assert!(SLOT_SIZE * (1 + references) <= size, "object too small for its slots");
        assert!(references as u64 <= REF_COUNT_MASK);
        memory.write_word(addr, size as u64 | ((references as u64) << REF_COUNT_SHIFT));
        for index in 0..references {
            memory.write_reference(Self::slot(addr, index), None);
        }
        let payload = addr + SLOT_SIZE * (1 + references);
        memory.fill(payload, addr + size - payload, 0);
    }

    const fn slot(object: Address, index: usize) -> Address {
        object + SLOT_SIZE * (1 + index)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn size_of(memory: &HeapMemory, object: Address) -> usize {
        (memory.read_word(object) & SIZE_MASK) as usize
    }

    /// Number of reference slots.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn reference_count(memory: &HeapMemory, object: Address) -> usize {
        ((memory.read_word(object) >> REF_COUNT_SHIFT) & REF_COUNT_MASK) as usize
    }

    /// Store `target` in reference slot `index`.
    pub fn set_reference(memory: &HeapMemory, object: Address, index: usize, target: Option<Address>) {
        assert!(index < Self::reference_count(memory, object));
        memory.write_reference(Self::slot(object, index), target);
    }

    /// Load reference slot `index`.
    #[must_use]
    pub fn reference(memory: &HeapMemory, object: Address, index: usize) -> Option<Address> {
        assert!(index < Self::reference_count(memory, object));
        memory.read_reference(Self::slot(object, index))
    }

    /// Payload word `index`, counted after the reference slots.
    #[must_use]
    pub fn payload_word(memory: &HeapMemory, object: Address, index: usize) -> u64 {
        memory.read_word(Self::slot(object, Self::reference_count(memory, object) + index))
    }

    /// Store payload word `index`.
    pub fn set_payload_word(memory: &HeapMemory, object: Address, index: usize, value: u64) {
        let slot = Self::slot(object, Self::reference_count(memory, object) + index);
        assert!(slot < object + Self::size_of(memory, object));
        memory.write_word(slot, value);
    }

    /// Record that the object's identity hash was observed.
    pub fn mark_hashed(memory: &HeapMemory, object: Address) {
        memory.write_word(object, memory.read_word(object) | HASHED);
    }

    /// Identity hash: the address the object had when first hashed.
    #[must_use]
    pub fn hash_code(memory: &HeapMemory, object: Address) -> u64 {
        if memory.read_word(object) & HASH_SLOT != 0 {
            memory.read_word(object + Self::size_of(memory, object) - SLOT_SIZE)
        } else {
            object as u64
        }
    }

    fn grows_on_move(header: u64) -> bool {
        header & HASHED != 0 && header & HASH_SLOT == 0
    }
}

impl ObjectModel for SlotObjectModel {
    fn consumed_size(&self, memory: &HeapMemory, object: Address) -> usize {
        Self::size_of(memory, object)
    }

    fn consumed_size_for_move(&self, memory: &HeapMemory, object: Address) -> usize {
        let size = Self::size_of(memory, object);
        if Self::grows_on_move(memory.read_word(object)) {
            size + SLOT_SIZE
        } else {
            size
        }
    }

    fn post_move(&self, memory: &HeapMemory, from: Address, to: Address) {
        let header = memory.read_word(to);
        if !Self::grows_on_move(header) {
            return;
        }
        let size = Self::size_of(memory, to);
        memory.write_word(to + size, from as u64);
        let grown = (header & !SIZE_MASK) | ((size + SLOT_SIZE) as u64 & SIZE_MASK) | HASH_SLOT;
        memory.write_word(to, grown);
    }

    fn for_each_reference(
        &self,
        memory: &HeapMemory,
        object: Address,
        visit: &mut dyn FnMut(Address),
    ) {
        for index in 0..Self::reference_count(memory, object) {
            visit(Self::slot(object, index));
        }
    }
}

/// One step of a heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapEntry {
    /// A live or dead object.
    Object {
        /// Object address.
        address: Address,
        /// Consumed size.
        size: usize,
    },
    /// Free memory: a linked chunk or a single-slot filler.
    Hole {
        /// Hole address.
        address: Address,
        /// Hole size.
        size: usize,
    },
}

impl HeapEntry {
    /// Address of the entry.
    #[must_use]
    pub const fn address(&self) -> Address {
        match *self {
            Self::Object { address, .. } | Self::Hole { address, .. } => address,
        }
    }

    /// Size of the entry.
    #[must_use]
    pub const fn size(&self) -> usize {
        match *self {
            Self::Object { size, .. } | Self::Hole { size, .. } => size,
        }
    }
}

/// Linear walk over `[low, high)` of a parseable heap range.
pub struct HeapWalker<'a> {
    memory: &'a HeapMemory,
    model: &'a dyn ObjectModel,
    cursor: Address,
    limit: Address,
}

impl<'a> HeapWalker<'a> {
    /// Walk from `low` up to `high`. `low` must be the start of an entry.
    #[must_use]
    pub fn new(memory: &'a HeapMemory, model: &'a dyn ObjectModel, low: Address, high: Address) -> Self {
        Self {
            memory,
            model,
            cursor: low,
            limit: high,
        }
    }

    /// Only the objects of the walk.
    pub fn objects(self) -> impl Iterator<Item = (Address, usize)> + 'a {
        self.filter_map(|entry| match entry {
            HeapEntry::Object { address, size } => Some((address, size)),
            HeapEntry::Hole { .. } => None,
        })
    }
}

impl Iterator for HeapWalker<'_> {
    type Item = HeapEntry;

    fn next(&mut self) -> Option<HeapEntry> {
        if self.cursor >= self.limit {
            return None;
        }
        let address = self.cursor;
        let entry = match HoleKind::decode(self.memory.read_word(address)) {
            Some(HoleKind::SingleSlot) => HeapEntry::Hole {
                address,
                size: SLOT_SIZE,
            },
            #[allow(clippy::cast_possible_truncation)]
            Some(HoleKind::Linked { .. }) => HeapEntry::Hole {
                address,
                size: self.memory.read_word(address + SLOT_SIZE) as usize,
            },
            None => HeapEntry::Object {
                address,
                size: self.model.consumed_size(self.memory, address),
            },
        };
        assert!(entry.size() > 0, "heap entry at {address:#x} has zero size");
        self.cursor += entry.size();
        Some(entry)
    }
}

impl std::fmt::Debug for HeapWalker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapWalker")
            .field("cursor", &self.cursor)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}
