//! Heap arena, region layout and configuration.
//!
//! The managed heap is a single virtual-memory reservation. Everything inside
//! it is addressed by byte offset from the reservation base, so an [`Address`]
//! of `0` is the first byte of the heap and is a valid location. Memory is only
//! ever touched through [`HeapMemory`], which views the reservation as a slice
//! of `AtomicU64` words; the collector relies on partitioning, not locking, to
//! keep workers off each other's words.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sys_alloc::Reservation;

use crate::gc::mark::MarkBitmap;
use crate::pool::MemoryPool;

/// Byte offset from the heap base.
pub type Address = usize;

/// Size of a heap slot. One mark bit covers one slot.
pub const SLOT_SIZE: usize = 8;

/// Smallest object the heap can hold. Two objects never share a 16-byte granule.
pub const MIN_OBJECT_SIZE: usize = 16;

/// Granularity of the compaction forwarding table (two mark-bitmap words).
pub const COMPACT_PAGE_SIZE: usize = 1024;

/// Upper bound on the reserved size; forwarding addresses are stored in 43 bits.
pub const MAX_HEAP_SIZE: usize = 1 << 43;

/// In-memory encoding of a null reference.
pub const NULL_REFERENCE: u64 = u64::MAX;

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Index of the compaction page containing `addr`.
#[inline]
#[must_use]
pub const fn page_index(addr: Address) -> usize {
    addr / COMPACT_PAGE_SIZE
}

/// First address of the compaction page containing `addr`.
#[inline]
#[must_use]
pub const fn page_start(addr: Address) -> Address {
    align_down(addr, COMPACT_PAGE_SIZE)
}

/// Word-addressable view of the reserved heap.
///
/// All accesses use relaxed atomics. Cross-thread visibility comes from the
/// dispatcher barriers and the compare-and-swap state transitions that hand
/// memory from one worker to another.
pub struct HeapMemory {
    reservation: Reservation,
}

impl HeapMemory {
    /// Reserve and commit `len` bytes of standalone heap memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the reservation or commit fails, or if `len` is zero
    /// or larger than [`MAX_HEAP_SIZE`].
    pub fn new(len: usize) -> io::Result<Self> {
        if len > MAX_HEAP_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "heap memory exceeds the addressable limit",
            ));
        }
        let reservation = Reservation::new(len)?;
        reservation.commit(0, reservation.len())?;
        Ok(Self { reservation })
    }

    pub(crate) const fn from_reservation(reservation: Reservation) -> Self {
        Self { reservation }
    }

    /// Size of the reserved range in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reservation.len()
    }

    /// Whether the reservation is empty. Always `false` for a constructed heap.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reservation.is_empty()
    }

    #[inline]
    fn words(&self) -> &[AtomicU64] {
        // SAFETY: the reservation is page aligned, readable and writable for
        // its whole length, and lives as long as `self`. `AtomicU64` has the
        // same layout as `u64`, and every access goes through atomics.
        unsafe {
            std::slice::from_raw_parts(
                self.reservation.ptr().cast::<AtomicU64>(),
                self.reservation.len() / SLOT_SIZE,
            )
        }
    }

    /// Read the 8 bytes at `addr`. `addr` need not be slot aligned.
    #[inline]
    #[must_use]
    pub fn read_word(&self, addr: Address) -> u64 {
        let words = self.words();
        let index = addr / SLOT_SIZE;
        let shift = (addr % SLOT_SIZE) * 8;
        if shift == 0 {
            return words[index].load(Ordering::Relaxed);
        }
        let lo = words[index].load(Ordering::Relaxed) >> shift;
        let hi = words[index + 1].load(Ordering::Relaxed) << (64 - shift);
        lo | hi
    }

    /// Write the 8 bytes at `addr`. `addr` need not be slot aligned; bytes of
    /// the two straddled words outside the target range are preserved.
    #[inline]
    pub fn write_word(&self, addr: Address, value: u64) {
        let words = self.words();
        let index = addr / SLOT_SIZE;
        let shift = (addr % SLOT_SIZE) * 8;
        if shift == 0 {
            words[index].store(value, Ordering::Relaxed);
            return;
        }
        let lo_mask = u64::MAX << shift;
        words[index].fetch_and(!lo_mask, Ordering::Relaxed);
        words[index].fetch_or(value << shift, Ordering::Relaxed);
        let hi_mask = u64::MAX >> (64 - shift);
        words[index + 1].fetch_and(!hi_mask, Ordering::Relaxed);
        words[index + 1].fetch_or(value >> (64 - shift), Ordering::Relaxed);
    }

    /// Read a reference slot.
    #[inline]
    #[must_use]
    pub fn read_reference(&self, slot: Address) -> Option<Address> {
        match self.read_word(slot) {
            NULL_REFERENCE => None,
            #[allow(clippy::cast_possible_truncation)]
            raw => Some(raw as Address),
        }
    }

    /// Write a reference slot.
    #[inline]
    pub fn write_reference(&self, slot: Address, target: Option<Address>) {
        self.write_word(slot, target.map_or(NULL_REFERENCE, |addr| addr as u64));
    }

    /// Fill `[addr, addr + len)` with `value`, one word at a time.
    pub fn fill(&self, addr: Address, len: usize, value: u64) {
        assert_eq!(addr % SLOT_SIZE, 0, "fill must be slot aligned");
        assert_eq!(len % SLOT_SIZE, 0, "fill must cover whole slots");
        let words = self.words();
        for word in &words[addr / SLOT_SIZE..(addr + len) / SLOT_SIZE] {
            word.store(value, Ordering::Relaxed);
        }
    }

    /// Copy `len` bytes from `src` to `dst`. The ranges may overlap.
    pub fn copy_within(&self, src: Address, dst: Address, len: usize) {
        assert!(
            src % SLOT_SIZE == 0 && dst % SLOT_SIZE == 0 && len % SLOT_SIZE == 0,
            "copy_within requires slot-aligned ranges"
        );
        if src == dst || len == 0 {
            return;
        }
        let words = self.words();
        let (src, dst, count) = (src / SLOT_SIZE, dst / SLOT_SIZE, len / SLOT_SIZE);
        if dst < src {
            for i in 0..count {
                let value = words[src + i].load(Ordering::Relaxed);
                words[dst + i].store(value, Ordering::Relaxed);
            }
        } else {
            for i in (0..count).rev() {
                let value = words[src + i].load(Ordering::Relaxed);
                words[dst + i].store(value, Ordering::Relaxed);
            }
        }
    }

    fn commit(&self, low: Address, high: Address) -> io::Result<()> {
        let page = sys_alloc::page_size();
        let low = align_down(low, page);
        let high = align_up(high, page).min(self.len());
        if high > low {
            self.reservation.commit(low, high - low)?;
        }
        Ok(())
    }

    fn decommit(&self, low: Address, high: Address) -> io::Result<()> {
        let page = sys_alloc::page_size();
        let low = align_up(low, page);
        let high = align_up(high, page).min(self.len());
        if high > low {
            self.reservation.decommit(low, high - low)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HeapMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapMemory")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Heap shape configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Bytes of address space reserved up front.
    pub reserved_size: usize,
    /// Bytes committed and handed to the default pool at construction.
    pub initial_size: usize,
    /// Size of each region. The last region of an expansion may be shorter.
    pub region_size: usize,
    /// Free ranges smaller than this are never linked into a pool.
    pub minimum_free_entry_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            reserved_size: 256 * 1024 * 1024,
            initial_size: 32 * 1024 * 1024,
            region_size: 16 * 1024 * 1024,
            minimum_free_entry_size: 64,
        }
    }
}

impl HeapConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reserved address-space size.
    pub const fn set_reserved_size(&mut self, bytes: usize) {
        self.reserved_size = bytes;
    }

    /// Set the initially committed size.
    pub const fn set_initial_size(&mut self, bytes: usize) {
        self.initial_size = bytes;
    }

    /// Set the region size.
    pub const fn set_region_size(&mut self, bytes: usize) {
        self.region_size = bytes;
    }

    /// Set the minimum size of a linked free entry.
    pub const fn set_minimum_free_entry_size(&mut self, bytes: usize) {
        self.minimum_free_entry_size = bytes;
    }

    fn validate(&self) -> io::Result<()> {
        let invalid = |msg: &str| Err(io::Error::new(io::ErrorKind::InvalidInput, msg.to_owned()));
        if self.reserved_size == 0 || self.reserved_size > MAX_HEAP_SIZE {
            return invalid("reserved size must be non-zero and below 8 TiB");
        }
        if self.region_size == 0 || self.region_size % COMPACT_PAGE_SIZE != 0 {
            return invalid("region size must be a non-zero multiple of 1024 bytes");
        }
        if self.initial_size % COMPACT_PAGE_SIZE != 0 || self.initial_size > self.reserved_size {
            return invalid("initial size must be a multiple of 1024 bytes within the reservation");
        }
        if self.reserved_size % COMPACT_PAGE_SIZE != 0 {
            return invalid("reserved size must be a multiple of 1024 bytes");
        }
        if self.minimum_free_entry_size < crate::free_chunk::FREE_CHUNK_HEADER_SIZE
            || self.minimum_free_entry_size % SLOT_SIZE != 0
        {
            return invalid("minimum free entry size must be slot aligned and hold a free chunk header");
        }
        Ok(())
    }
}

/// A committed, contiguous range of the heap owned by one pool.
///
/// Regions tile the committed heap from address `0` upward. No free entry and
/// no object ever crosses a region boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First address of the region.
    pub low: Address,
    /// One past the last address of the region.
    pub high: Address,
    /// Index of the owning pool.
    pub pool: usize,
}

impl Region {
    /// Size of the region in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.high - self.low
    }

    /// Whether `addr` falls inside the region.
    #[must_use]
    pub const fn contains(&self, addr: Address) -> bool {
        addr >= self.low && addr < self.high
    }
}

/// The managed heap: memory, mark bitmap, regions and pools.
#[derive(Debug)]
pub struct Heap {
    memory: Arc<HeapMemory>,
    mark_bits: MarkBitmap,
    regions: Vec<Region>,
    pools: Vec<MemoryPool>,
    config: HeapConfig,
    committed: usize,
}

impl Heap {
    /// Reserve the heap, commit the initial size and hand it to one pool.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::InvalidInput`] for an invalid configuration, or
    /// the operating system error if the reservation cannot be made.
    pub fn new(config: HeapConfig) -> io::Result<Self> {
        config.validate()?;
        let reservation = Reservation::new(config.reserved_size)?;
        let memory = Arc::new(HeapMemory::from_reservation(reservation));
        let mark_bits = MarkBitmap::new(memory.len());
        let pool = MemoryPool::new(Arc::clone(&memory), config.minimum_free_entry_size);
        let mut heap = Self {
            memory,
            mark_bits,
            regions: Vec::new(),
            pools: vec![pool],
            config,
            committed: 0,
        };
        if config.initial_size > 0 {
            heap.expand(config.initial_size, 0)?;
        }
        Ok(heap)
    }

    /// The heap memory.
    #[must_use]
    pub const fn memory(&self) -> &Arc<HeapMemory> {
        &self.memory
    }

    /// The mark bitmap covering the whole reservation.
    #[must_use]
    pub const fn mark_bits(&self) -> &MarkBitmap {
        &self.mark_bits
    }

    /// The configuration the heap was built with.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Bytes currently committed.
    #[must_use]
    pub const fn committed_size(&self) -> usize {
        self.committed
    }

    /// Committed regions in address order.
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// All pools, indexed by [`Region::pool`].
    #[must_use]
    pub fn pools(&self) -> &[MemoryPool] {
        &self.pools
    }

    /// The pool at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn pool(&self, index: usize) -> &MemoryPool {
        &self.pools[index]
    }

    /// The region containing `addr`, if committed.
    #[must_use]
    pub fn region_for(&self, addr: Address) -> Option<&Region> {
        let index = self.regions.partition_point(|region| region.high <= addr);
        self.regions.get(index).filter(|region| region.contains(addr))
    }

    /// The pool owning `addr`, if committed.
    #[must_use]
    pub fn pool_for(&self, addr: Address) -> Option<&MemoryPool> {
        self.region_for(addr).map(|region| &self.pools[region.pool])
    }

    /// Add an empty pool and return its index. Regions are assigned to it by
    /// [`Heap::expand`].
    pub fn add_pool(&mut self) -> usize {
        self.pools.push(MemoryPool::new(
            Arc::clone(&self.memory),
            self.config.minimum_free_entry_size,
        ));
        self.pools.len() - 1
    }

    /// Commit `bytes` more memory (rounded up to the compaction page), split it
    /// into regions and give them to `pool` as free memory.
    ///
    /// Returns the number of bytes added.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::InvalidInput`] if `pool` does not exist or the
    /// reservation is exhausted, or the OS error if committing fails.
    pub fn expand(&mut self, bytes: usize, pool: usize) -> io::Result<usize> {
        if pool >= self.pools.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no such pool"));
        }
        let bytes = align_up(bytes, COMPACT_PAGE_SIZE);
        let low = self.committed;
        let high = low
            .checked_add(bytes)
            .filter(|&high| high <= self.config.reserved_size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "heap reservation exhausted"))?;
        if bytes == 0 {
            return Ok(0);
        }
        self.memory.commit(low, high)?;
        let mut region_low = low;
        while region_low < high {
            let region_high = (region_low + self.config.region_size).min(high);
            self.regions.push(Region {
                low: region_low,
                high: region_high,
                pool,
            });
            self.pools[pool].expand_with_range(region_low, region_high, false);
            region_low = region_high;
        }
        self.committed = high;
        Ok(bytes)
    }

    /// Give back up to `bytes` from the top of the heap. Only whole regions that
    /// are entirely free are released, and the first region is always kept.
    ///
    /// Returns the number of bytes released.
    ///
    /// # Errors
    ///
    /// Returns the OS error if decommitting fails.
    pub fn contract(&mut self, bytes: usize) -> io::Result<usize> {
        let mut released = 0;
        while self.regions.len() > 1 {
            let Some(&region) = self.regions.last() else {
                break;
            };
            if released + region.size() > bytes {
                break;
            }
            let pool = &self.pools[region.pool];
            let available = pool.available_contraction_size_ending_at(0, region.low, region.high);
            if available < region.size()
                || pool.find_free_entry_ending_at(region.high) != Some(region.low)
            {
                break;
            }
            pool.contract_with_range(region.low, region.high);
            self.mark_bits.clear_range(region.low, region.high);
            self.memory.decommit(region.low, region.high)?;
            self.regions.pop();
            self.committed = region.low;
            released += region.size();
        }
        Ok(released)
    }

    /// Allocate `size` bytes from the first pool that can satisfy the request.
    #[must_use]
    pub fn allocate_object(&self, size: usize) -> Option<Address> {
        self.pools.iter().find_map(|pool| pool.allocate_object(size))
    }

    /// Set the mark bit for the object at `addr`. Returns `true` if it was clear.
    pub fn mark_object(&self, addr: Address) -> bool {
        self.mark_bits.mark(addr)
    }

    /// Whether the object at `addr` is marked.
    #[must_use]
    pub fn is_marked(&self, addr: Address) -> bool {
        self.mark_bits.is_marked(addr)
    }

    /// Clear every mark bit.
    pub fn clear_mark_bits(&self) {
        self.mark_bits.clear();
    }

    /// Total linked free memory across all pools.
    #[must_use]
    pub fn free_memory_size(&self) -> usize {
        self.pools.iter().map(MemoryPool::free_memory_size).sum()
    }
}
