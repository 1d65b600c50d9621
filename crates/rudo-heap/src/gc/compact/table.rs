//! Forwarding table stored over the mark bitmap.
//!
//! Once a compaction page has been moved its two mark words are no longer
//! needed, so they are reused as a [`CompactTableEntry`]:
//!
//! ```text
//! word 0  bits  0..2   tag, both set
//!         bits  2..43  new address of the first moved object of the page
//!         bits 43..64  three 7-bit hints: (new address - entry address) / 8
//!                      of the second, third and fourth object
//! word 1  one bit per 16-byte granule, set for every object of the page
//!         that was given a new address
//! ```
//!
//! Raw mark bits never carry the tag: the first two slots of a page cannot
//! both start objects because an object is at least 16 bytes long.

use crate::gc::mark::MarkBitmap;
use crate::heap::{page_index, page_start, Address, HeapMemory, MIN_OBJECT_SIZE, SLOT_SIZE};
use crate::object::ObjectModel;

const TAG: u64 = 0b11;
const ADDRESS_BITS: u32 = 43;
const ADDRESS_MASK: u64 = ((1 << ADDRESS_BITS) - 1) & !TAG;
const HINT_BITS: u32 = 7;
const HINT_MASK: u64 = (1 << HINT_BITS) - 1;
/// Hint value meaning "walk instead".
const HINT_INVALID: u64 = HINT_MASK;
/// Objects after the first that get a hint.
pub(super) const MAX_HINTS: usize = 3;

/// Forwarding record of one compaction page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct CompactTableEntry {
    word0: u64,
    word1: u64,
}

impl CompactTableEntry {
    /// Read the entry of `page`. The result is only meaningful if
    /// [`CompactTableEntry::is_valid`].
    pub fn load(bitmap: &MarkBitmap, page: usize) -> Self {
        Self {
            word0: bitmap.word(2 * page),
            word1: bitmap.word(2 * page + 1),
        }
    }

    /// Overwrite the mark words of `page`.
    pub fn store(self, bitmap: &MarkBitmap, page: usize) {
        debug_assert!(self.is_valid(), "storing an empty forwarding entry");
        bitmap.set_word(2 * page, self.word0);
        bitmap.set_word(2 * page + 1, self.word1);
    }

    pub const fn is_valid(self) -> bool {
        self.word0 & TAG == TAG
    }

    #[allow(clippy::cast_possible_truncation)]
    pub const fn address(self) -> Address {
        (self.word0 & ADDRESS_MASK) as Address
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn granule(object: Address) -> u32 {
        ((object - page_start(object)) / MIN_OBJECT_SIZE) as u32
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn hint_shift(ordinal: usize) -> u32 {
        ADDRESS_BITS + (ordinal as u32 - 1) * HINT_BITS
    }

    /// Hint for the `ordinal`-th object of the page (1-based after the first).
    #[allow(clippy::cast_possible_truncation)]
    pub const fn hint(self, ordinal: usize) -> Option<Address> {
        let value = (self.word0 >> Self::hint_shift(ordinal)) & HINT_MASK;
        if value == HINT_INVALID {
            None
        } else {
            Some(self.address() + value as usize * SLOT_SIZE)
        }
    }

    /// Record that `object`, the `count`-th object saved on this page, moves
    /// to `new_address`.
    pub fn save_forwarding_ptr(&mut self, object: Address, new_address: Address, count: usize) {
        if count == 0 {
            assert!(
                new_address as u64 & !ADDRESS_MASK == 0,
                "forwarding address {new_address:#x} out of range"
            );
            self.word0 = new_address as u64 | TAG | (u64::MAX << ADDRESS_BITS);
        } else if count <= MAX_HINTS {
            debug_assert!(new_address >= self.address());
            let offset = ((new_address - self.address()) / SLOT_SIZE) as u64;
            let shift = Self::hint_shift(count);
            self.word0 &= !(HINT_MASK << shift);
            self.word0 |= offset.min(HINT_INVALID) << shift;
        }
        self.word1 |= 1 << Self::granule(object);
    }

    /// Position of `object` among the page's saved objects, if it was saved.
    pub const fn ordinal(self, object: Address) -> Option<usize> {
        let bit = 1u64 << Self::granule(object);
        if self.word1 & bit == 0 {
            return None;
        }
        Some((self.word1 & (bit - 1)).count_ones() as usize)
    }
}

/// Looks up where compaction moved an object.
///
/// Only valid between the move phase and the rebuild of the mark bits. A
/// compaction run with [`crate::gc::CompactOptions::rebuild_mark_bits`] off
/// leaves the table in place, so it can be queried afterwards with the
/// range reported in [`crate::gc::CompactStats`].
pub struct ForwardingTable<'a> {
    memory: &'a HeapMemory,
    bitmap: &'a MarkBitmap,
    model: &'a dyn ObjectModel,
    compact_from: Address,
    compact_to: Address,
}

impl<'a> ForwardingTable<'a> {
    /// View the table covering `[compact_from, compact_to)`.
    #[must_use]
    pub fn new(
        memory: &'a HeapMemory,
        bitmap: &'a MarkBitmap,
        model: &'a dyn ObjectModel,
        compact_from: Address,
        compact_to: Address,
    ) -> Self {
        Self {
            memory,
            bitmap,
            model,
            compact_from,
            compact_to,
        }
    }

    /// New address of the object that lived at `object` before compaction.
    ///
    /// Objects outside the compacted range, and objects that kept their
    /// place without being recorded, map to themselves.
    #[must_use]
    pub fn get_forwarding_ptr(&self, object: Address) -> Address {
        if object < self.compact_from || object >= self.compact_to {
            return object;
        }
        let entry = CompactTableEntry::load(self.bitmap, page_index(object));
        if !entry.is_valid() {
            return object;
        }
        let Some(ordinal) = entry.ordinal(object) else {
            return object;
        };
        if ordinal == 0 {
            return entry.address();
        }

        let (mut known, mut address) = (0, entry.address());
        for candidate in (1..=ordinal.min(MAX_HINTS)).rev() {
            if let Some(hinted) = entry.hint(candidate) {
                known = candidate;
                address = hinted;
                break;
            }
        }
        // Objects of one page land back to back.
        for _ in known..ordinal {
            address += self.model.consumed_size(self.memory, address);
        }
        address
    }

    /// Compacted range as `(from, to)`.
    #[must_use]
    pub const fn range(&self) -> (Address, Address) {
        (self.compact_from, self.compact_to)
    }
}

impl std::fmt::Debug for ForwardingTable<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingTable")
            .field("compact_from", &self.compact_from)
            .field("compact_to", &self.compact_to)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::COMPACT_PAGE_SIZE;
    use crate::object::SlotObjectModel;

    #[test]
    fn test_raw_mark_bits_are_never_an_entry() {
        let bitmap = MarkBitmap::new(4 * COMPACT_PAGE_SIZE);
        bitmap.mark(COMPACT_PAGE_SIZE);
        bitmap.mark(COMPACT_PAGE_SIZE + 16);
        bitmap.mark(COMPACT_PAGE_SIZE + 600);
        assert!(!CompactTableEntry::load(&bitmap, 1).is_valid());
        bitmap.mark(8);
        assert!(!CompactTableEntry::load(&bitmap, 0).is_valid());
    }

    #[test]
    fn test_entry_hints_and_ordinals() {
        let page = 3 * COMPACT_PAGE_SIZE;
        let mut entry = CompactTableEntry::default();
        let objects = [page + 16, page + 48, page + 96, page + 200, page + 512];
        let targets = [64, 96, 144, 248, 560];
        for (count, (&object, &target)) in objects.iter().zip(&targets).enumerate() {
            entry.save_forwarding_ptr(object, target, count);
        }
        assert!(entry.is_valid());
        assert_eq!(entry.address(), 64);
        assert_eq!(entry.hint(1), Some(96));
        assert_eq!(entry.hint(2), Some(144));
        assert_eq!(entry.hint(3), Some(248));
        assert_eq!(entry.ordinal(page + 16), Some(0));
        assert_eq!(entry.ordinal(page + 512), Some(4));
        assert_eq!(entry.ordinal(page + 32), None);
    }

    #[test]
    fn test_entry_hint_out_of_range_is_invalid() {
        let page = COMPACT_PAGE_SIZE;
        let mut entry = CompactTableEntry::default();
        entry.save_forwarding_ptr(page, 0, 0);
        entry.save_forwarding_ptr(page + 1000, 1016, 1);
        assert_eq!(entry.hint(1), None);
    }

    #[test]
    fn test_entry_round_trips_through_bitmap() {
        let bitmap = MarkBitmap::new(4 * COMPACT_PAGE_SIZE);
        let mut entry = CompactTableEntry::default();
        entry.save_forwarding_ptr(2 * COMPACT_PAGE_SIZE + 128, 40, 0);
        entry.store(&bitmap, 2);
        assert_eq!(CompactTableEntry::load(&bitmap, 2), entry);
        assert!(bitmap.is_marked(2 * COMPACT_PAGE_SIZE));
    }

    #[test]
    fn test_get_forwarding_ptr_walks_past_hints() {
        let memory = HeapMemory::new(8 * COMPACT_PAGE_SIZE).unwrap();
        let bitmap = MarkBitmap::new(memory.len());
        let page = 4 * COMPACT_PAGE_SIZE;
        // Six 32-byte objects of page 4 packed at 0; the third hint is lost.
        let mut entry = CompactTableEntry::default();
        for count in 0..6 {
            SlotObjectModel::write_object(&memory, count * 32, 32, 0);
            entry.save_forwarding_ptr(page + count * 64, count * 32, count);
        }
        entry.word0 |= HINT_INVALID << CompactTableEntry::hint_shift(3);
        entry.store(&bitmap, 4);

        let table = ForwardingTable::new(&memory, &bitmap, &SlotObjectModel, page, page + COMPACT_PAGE_SIZE);
        for count in 0..6 {
            assert_eq!(table.get_forwarding_ptr(page + count * 64), count * 32);
        }
        assert_eq!(table.get_forwarding_ptr(page + 16), page + 16);
        assert_eq!(table.get_forwarding_ptr(page - 64), page - 64);
        assert_eq!(table.get_forwarding_ptr(7 * COMPACT_PAGE_SIZE), 7 * COMPACT_PAGE_SIZE);
    }
}
