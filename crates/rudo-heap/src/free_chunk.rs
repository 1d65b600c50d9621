//! Free-list records written in place over dead heap memory.
//!
//! A linked free chunk occupies its first two words:
//!
//! ```text
//! word 0: (next << 2) | MULTI_SLOT_HOLE     next == END_OF_LIST when last
//! word 1: size in bytes
//! ```
//!
//! A dead range too small to carry that header is filled with one
//! `SINGLE_SLOT_HOLE` marker per 8-byte slot. Both tags set bit 0, which no
//! object header does, so a heap walk can step over free memory without a
//! side table.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::{Address, HeapMemory, SLOT_SIZE};

/// Tag of a chunk carrying a next link and a size.
pub const MULTI_SLOT_HOLE: u64 = 0b01;
/// Tag of an 8-byte hole with no further content.
pub const SINGLE_SLOT_HOLE: u64 = 0b11;
/// Bits of word 0 reserved for the tag.
pub const TAG_MASK: u64 = 0b11;
/// Next-link value terminating a list.
pub const END_OF_LIST: u64 = u64::MAX & !TAG_MASK;
/// Bytes needed for a linked chunk header.
pub const FREE_CHUNK_HEADER_SIZE: usize = 16;
/// Empty-list value for a head updated with [`FreeChunk::link_in_as_head`].
pub const EMPTY_HEAD: usize = usize::MAX;

const NEXT_SHIFT: u32 = 2;

/// Kind of hole described by a heap word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoleKind {
    /// An 8-byte filler.
    SingleSlot,
    /// A chunk with a size word and a link to the next chunk.
    Linked {
        /// The following chunk, if any.
        next: Option<Address>,
    },
}

impl HoleKind {
    /// Encode as a heap word.
    #[must_use]
    pub const fn encode(self) -> u64 {
        match self {
            Self::SingleSlot => SINGLE_SLOT_HOLE,
            Self::Linked { next: None } => END_OF_LIST | MULTI_SLOT_HOLE,
            Self::Linked { next: Some(next) } => ((next as u64) << NEXT_SHIFT) | MULTI_SLOT_HOLE,
        }
    }

    /// Decode a heap word. Returns `None` when the word is not a hole tag,
    /// which means it is the header of an object.
    #[must_use]
    pub const fn decode(word: u64) -> Option<Self> {
        match word & TAG_MASK {
            SINGLE_SLOT_HOLE => Some(Self::SingleSlot),
            MULTI_SLOT_HOLE => {
                let link = word & !TAG_MASK;
                if link == END_OF_LIST {
                    Some(Self::Linked { next: None })
                } else {
                    #[allow(clippy::cast_possible_truncation)]
                    Some(Self::Linked {
                        next: Some((link >> NEXT_SHIFT) as Address),
                    })
                }
            }
            _ => None,
        }
    }
}

/// View of a linked free chunk at a heap address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeChunk(Address);

impl FreeChunk {
    /// View the chunk at `addr`. Nothing is read or written.
    #[must_use]
    pub const fn at(addr: Address) -> Self {
        Self(addr)
    }

    /// Address of the chunk.
    #[must_use]
    pub const fn address(self) -> Address {
        self.0
    }

    /// Write a linked chunk header at `addr`.
    pub fn write(memory: &HeapMemory, addr: Address, size: usize, next: Option<Address>) -> Self {
        debug_assert!(size >= FREE_CHUNK_HEADER_SIZE);
        let chunk = Self(addr);
        chunk.set_next(memory, next);
        chunk.set_size(memory, size);
        chunk
    }

    /// Kind of hole stored at this address, or `None` for an object.
    #[must_use]
    pub fn kind(self, memory: &HeapMemory) -> Option<HoleKind> {
        HoleKind::decode(memory.read_word(self.0))
    }

    /// The next chunk in the list.
    ///
    /// # Panics
    ///
    /// Panics if the address does not hold a linked chunk.
    #[must_use]
    pub fn next(self, memory: &HeapMemory) -> Option<Address> {
        match self.kind(memory) {
            Some(HoleKind::Linked { next }) => next,
            other => panic!("expected a linked free chunk at {:#x}, found {other:?}", self.0),
        }
    }

    /// Rewrite the next link, tagging the chunk as linked.
    pub fn set_next(self, memory: &HeapMemory, next: Option<Address>) {
        memory.write_word(self.0, HoleKind::Linked { next }.encode());
    }

    /// Size in bytes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn size(self, memory: &HeapMemory) -> usize {
        memory.read_word(self.0 + SLOT_SIZE) as usize
    }

    /// Overwrite the size.
    pub fn set_size(self, memory: &HeapMemory, size: usize) {
        memory.write_word(self.0 + SLOT_SIZE, size as u64);
    }

    /// Grow the chunk by `bytes`.
    pub fn expand_size(self, memory: &HeapMemory, bytes: usize) {
        self.set_size(memory, self.size(memory) + bytes);
    }

    /// First address past the chunk.
    #[must_use]
    pub fn after_end(self, memory: &HeapMemory) -> Address {
        self.0 + self.size(memory)
    }

    /// Make `[addr, addr + size)` walkable.
    ///
    /// Ranges of at least [`FREE_CHUNK_HEADER_SIZE`] get an unlinked chunk
    /// header, which is returned. Smaller ranges get single-slot markers; a
    /// range shorter than one slot is left untouched.
    pub fn fill_with_holes(memory: &HeapMemory, addr: Address, size: usize) -> Option<Self> {
        if size >= FREE_CHUNK_HEADER_SIZE {
            return Some(Self::write(memory, addr, size, None));
        }
        let mut slot = addr;
        while slot + SLOT_SIZE <= addr + size {
            memory.write_word(slot, SINGLE_SLOT_HOLE);
            slot += SLOT_SIZE;
        }
        None
    }

    /// Push this chunk onto a lock-free LIFO list rooted at `head`.
    ///
    /// `head` holds [`EMPTY_HEAD`] when the list is empty. The size is written
    /// before the chunk is published.
    pub fn link_in_as_head(self, memory: &HeapMemory, size: usize, head: &AtomicUsize) {
        self.set_size(memory, size);
        let mut current = head.load(Ordering::Acquire);
        loop {
            self.set_next(memory, (current != EMPTY_HEAD).then_some(current));
            match head.compare_exchange_weak(current, self.0, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
