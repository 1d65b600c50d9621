//! Sub-area table: the unit of parallel compaction work.
//!
//! Every committed region is cut into sub-areas. The table lists them in
//! address order, closes each region with an [`SubAreaState::EndSegment`]
//! entry whose first object is the region top, and ends with a single
//! [`SubAreaState::EndHeap`]. The objects of entry `i` are the objects in
//! `[first_object(i), first_object(i + 1))`.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::heap::{Address, Heap};

const NONE: usize = usize::MAX;

/// Compaction progress of a sub-area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(super) enum SubAreaState {
    /// Not processed yet.
    Init = 0,
    /// Claimed as an evacuation destination.
    Busy = 1,
    /// Processed, with a free chunk large enough to receive objects.
    Ready = 2,
    /// Processed, nothing left to give.
    Full = 3,
    /// Closes a region.
    EndSegment = 4,
    /// Closes the table.
    EndHeap = 5,
}

impl SubAreaState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Busy,
            2 => Self::Ready,
            3 => Self::Full,
            4 => Self::EndSegment,
            _ => Self::EndHeap,
        }
    }

    /// Whether the entry covers heap memory rather than closing a range.
    pub const fn is_sub_area(self) -> bool {
        !matches!(self, Self::EndSegment | Self::EndHeap)
    }
}

/// Phase a sub-area has been claimed for. Each phase is run once per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(super) enum SubAreaAction {
    None = 0,
    SettingRealLimits = 1,
    Evacuating = 2,
    FixingUp = 3,
    RebuildingMarkBits = 4,
}

#[derive(Debug)]
pub(super) struct SubAreaEntry {
    /// Tentative start, page aligned. Fixed once the table is built.
    pub low: Address,
    pub pool: usize,
    first_object: AtomicUsize,
    free_chunk: AtomicUsize,
    free_size: AtomicUsize,
    state: AtomicU8,
    action: AtomicU8,
}

impl SubAreaEntry {
    fn new(low: Address, pool: usize, state: SubAreaState) -> Self {
        Self {
            low,
            pool,
            first_object: AtomicUsize::new(low),
            free_chunk: AtomicUsize::new(NONE),
            free_size: AtomicUsize::new(0),
            state: AtomicU8::new(state as u8),
            action: AtomicU8::new(SubAreaAction::None as u8),
        }
    }

    /// First object, or `None` once real-limit discovery found no live object.
    pub fn first_object(&self) -> Option<Address> {
        match self.first_object.load(Ordering::Acquire) {
            NONE => None,
            addr => Some(addr),
        }
    }

    /// First object once the table is trimmed: every remaining entry has one.
    pub fn start(&self) -> Address {
        self.first_object().unwrap_or(self.low)
    }

    pub fn set_first_object(&self, first: Option<Address>) {
        self.first_object.store(first.unwrap_or(NONE), Ordering::Release);
    }

    /// Start of the free memory left in the sub-area, which runs up to the
    /// next entry's first object.
    pub fn free_chunk(&self) -> Option<Address> {
        match self.free_chunk.load(Ordering::Acquire) {
            NONE => None,
            addr => Some(addr),
        }
    }

    /// Bytes at [`SubAreaEntry::free_chunk`] usable as an evacuation destination.
    pub fn free_size(&self) -> usize {
        self.free_size.load(Ordering::Acquire)
    }

    pub fn set_free(&self, chunk: Option<Address>, size: usize) {
        self.free_chunk.store(chunk.unwrap_or(NONE), Ordering::Release);
        self.free_size.store(size, Ordering::Release);
    }

    pub fn state(&self) -> SubAreaState {
        SubAreaState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Publish a new state. Memory written before this call is visible to a
    /// worker that later claims the entry.
    pub fn set_state(&self, state: SubAreaState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`. Returns `true` if this call made the change.
    pub fn change_state(&self, from: SubAreaState, to: SubAreaState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim an `Init` sub-area as an evacuation source, moving it to
    /// `Busy` until its objects are placed. Exactly one caller wins.
    pub fn claim_for_evacuation(&self) -> bool {
        if self.state() != SubAreaState::Init || !self.change_action(SubAreaAction::Evacuating) {
            return false;
        }
        let claimed = self.change_state(SubAreaState::Init, SubAreaState::Busy);
        assert!(claimed, "sub-area left Init before its evacuation was claimed");
        true
    }

    /// Claim the entry for `action`. Exactly one caller per action wins.
    pub fn change_action(&self, action: SubAreaAction) -> bool {
        let current = self.action.load(Ordering::Acquire);
        if current == action as u8 {
            return false;
        }
        match self
            .action
            .compare_exchange(current, action as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(actual) => {
                assert_eq!(actual, action as u8, "sub-area action raced to an unexpected phase");
                false
            }
        }
    }
}

/// Build the tentative table. With `one_per_region`, a region is a single
/// sub-area; otherwise it is cut every `sub_area_size` bytes.
pub(super) fn build_table(heap: &Heap, sub_area_size: usize, one_per_region: bool) -> Vec<SubAreaEntry> {
    let mut table = Vec::new();
    for region in heap.regions() {
        let step = if one_per_region { region.size() } else { sub_area_size };
        let mut low = region.low;
        while low < region.high {
            table.push(SubAreaEntry::new(low, region.pool, SubAreaState::Init));
            low = (low + step).min(region.high);
        }
        table.push(SubAreaEntry::new(region.high, region.pool, SubAreaState::EndSegment));
    }
    table.push(SubAreaEntry::new(heap.committed_size(), 0, SubAreaState::EndHeap));
    table
}

/// Whether entry `index` starts a region. Such entries keep the region low
/// as their first object even when nothing lives there.
pub(super) fn starts_region(table: &[SubAreaEntry], index: usize) -> bool {
    index == 0 || table[index - 1].state() == SubAreaState::EndSegment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapConfig;

    fn heap() -> Heap {
        let mut config = HeapConfig::new();
        config.set_reserved_size(64 * 1024);
        config.set_initial_size(40 * 1024);
        config.set_region_size(16 * 1024);
        Heap::new(config).unwrap()
    }

    #[test]
    fn test_build_table_cuts_regions() {
        let heap = heap();
        let table = build_table(&heap, 8 * 1024, false);
        let shape: Vec<_> = table.iter().map(|entry| (entry.low, entry.state())).collect();
        assert_eq!(
            shape,
            vec![
                (0, SubAreaState::Init),
                (8 * 1024, SubAreaState::Init),
                (16 * 1024, SubAreaState::EndSegment),
                (16 * 1024, SubAreaState::Init),
                (24 * 1024, SubAreaState::Init),
                (32 * 1024, SubAreaState::EndSegment),
                (32 * 1024, SubAreaState::Init),
                (40 * 1024, SubAreaState::EndSegment),
                (40 * 1024, SubAreaState::EndHeap),
            ]
        );
        assert!(starts_region(&table, 0));
        assert!(!starts_region(&table, 1));
        assert!(starts_region(&table, 3));
        assert!(starts_region(&table, 6));
    }

    #[test]
    fn test_build_table_one_per_region() {
        let heap = heap();
        let table = build_table(&heap, 8 * 1024, true);
        let lows: Vec<_> = table
            .iter()
            .filter(|entry| entry.state().is_sub_area())
            .map(|entry| entry.low)
            .collect();
        assert_eq!(lows, vec![0, 16 * 1024, 32 * 1024]);
    }

    #[test]
    fn test_change_action_claims_once() {
        let entry = SubAreaEntry::new(0, 0, SubAreaState::Init);
        assert!(entry.change_action(SubAreaAction::SettingRealLimits));
        assert!(!entry.change_action(SubAreaAction::SettingRealLimits));
        assert!(entry.change_action(SubAreaAction::Evacuating));
        assert!(entry.change_action(SubAreaAction::FixingUp));
    }

    #[test]
    fn test_change_action_across_threads() {
        let entry = SubAreaEntry::new(0, 0, SubAreaState::Init);
        let wins = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if entry.change_action(SubAreaAction::Evacuating) {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(wins.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_evacuation_claim_moves_source_to_busy() {
        let entry = SubAreaEntry::new(0, 0, SubAreaState::Init);
        assert!(entry.claim_for_evacuation());
        assert_eq!(entry.state(), SubAreaState::Busy);
        assert!(!entry.claim_for_evacuation());
        // A source being emptied cannot receive objects.
        assert!(!entry.change_state(SubAreaState::Ready, SubAreaState::Busy));
        entry.set_state(SubAreaState::Ready);
        assert!(!entry.claim_for_evacuation());
    }

    #[test]
    fn test_evacuation_claim_across_threads() {
        let entry = SubAreaEntry::new(0, 0, SubAreaState::Init);
        let wins = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if entry.claim_for_evacuation() {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(wins.load(Ordering::Relaxed), 1);
        assert_eq!(entry.state(), SubAreaState::Busy);
    }

    #[test]
    fn test_destination_claim() {
        let entry = SubAreaEntry::new(0, 0, SubAreaState::Init);
        assert!(!entry.change_state(SubAreaState::Ready, SubAreaState::Busy));
        entry.set_state(SubAreaState::Ready);
        assert!(entry.change_state(SubAreaState::Ready, SubAreaState::Busy));
        assert!(!entry.change_state(SubAreaState::Ready, SubAreaState::Busy));
        assert_eq!(entry.state(), SubAreaState::Busy);
    }
}
