//! The arena of guarded slots.
//!
//! `SlotPool` owns the reserved region, the per-slot table, the metadata
//! table and the two FIFO queues (free slots, free metadata records). All
//! tables live in one anonymous mapping so they never come from the heap
//! being instrumented.
//!
//! Locking: one mutex covers the tables and queues and is held only for
//! O(1) bookkeeping. Page protection changes and poisoning happen outside
//! it.
//!
//! Reuse order is strict FIFO. A slot is handed out only after every slot
//! freed before it; slots never used yet are queued at reservation time in
//! address order. With `total_pages` slots and at most `max_allocated_pages`
//! live at once, a freed slot sits out at least
//! `total_pages - max_allocated_pages` acquisitions before reuse.

pub mod free_list;
pub mod metadata;

use crate::config::{Placement, Settings};
use crate::error::InitError;
use crate::platform::{self, Region};
use crate::state::AllocatorState;
use crate::sync::Mutex;
use crate::util::{align_down, align_up, default_alignment, POISON_BYTE};
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use free_list::IndexQueue;
use metadata::{
    AllocationInfo, Side, SlotEntry, SlotId, SlotMetadata, SlotState, INVALID_INDEX,
};

/// Why a request was not served. None of these are errors for the caller:
/// the wrapped allocator simply handles the request instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decline {
    ZeroSize,
    /// Larger than one slot.
    TooLarge,
    /// Not a power of two, or larger than a page.
    BadAlignment,
    /// `max_allocated_pages` slots are live.
    Exhausted,
    /// The kernel refused to make the slot accessible.
    CommitFailed,
}

/// A free the pool refuses to perform. The caller treats both as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// Not the start of a live allocation.
    InvalidFree,
    /// The start of an allocation that was already freed.
    DoubleFree,
}

#[derive(Debug, Clone, Copy)]
pub struct Acquired {
    pub slot: SlotId,
    pub ptr: NonNull<u8>,
    pub side: Side,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots live right now.
    pub allocated: usize,
    /// Successful acquisitions since reservation.
    pub total_allocations: usize,
    /// Slots waiting in the FIFO (never used or quarantined).
    pub free_slots: usize,
}

struct PoolInner {
    slots: *mut SlotEntry,
    num_slots: usize,
    metadata: *mut SlotMetadata,
    num_metadata: usize,
    free_slots: IndexQueue,
    free_metadata: IndexQueue,
    num_allocated: usize,
    total_allocations: usize,
}

// Raw pointers into the pool's table mapping; only touched under the lock.
unsafe impl Send for PoolInner {}

impl PoolInner {
    const fn empty() -> Self {
        PoolInner {
            slots: ptr::null_mut(),
            num_slots: 0,
            metadata: ptr::null_mut(),
            num_metadata: 0,
            free_slots: IndexQueue::empty(),
            free_metadata: IndexQueue::empty(),
            num_allocated: 0,
            total_allocations: 0,
        }
    }

    fn slots(&mut self) -> &mut [SlotEntry] {
        if self.slots.is_null() {
            return &mut [];
        }
        unsafe { core::slice::from_raw_parts_mut(self.slots, self.num_slots) }
    }

    fn metadata(&mut self) -> &mut [SlotMetadata] {
        if self.metadata.is_null() {
            return &mut [];
        }
        unsafe { core::slice::from_raw_parts_mut(self.metadata, self.num_metadata) }
    }

    /// Point `slot` at metadata record `idx`, detaching the record from the
    /// slot it described before.
    fn link(&mut self, slot: SlotId, idx: u16, record: SlotMetadata) {
        let previous = self.metadata()[idx as usize].slot;
        if previous != INVALID_INDEX && self.slots()[previous as usize].metadata == idx {
            self.slots()[previous as usize].metadata = INVALID_INDEX;
        }
        self.metadata()[idx as usize] = record;
        self.slots()[slot] = SlotEntry {
            state: SlotState::Allocated,
            metadata: idx,
            alloc_ptr: record.alloc_ptr,
        };
    }
}

pub struct SlotPool {
    state: AllocatorState,
    max_allocated: usize,
    placement: Placement,
    next_side: AtomicUsize,
    region: Option<Region>,
    tables: Option<Region>,
    inner: Mutex<PoolInner>,
}

impl SlotPool {
    /// An unreserved pool: owns no memory and declines every request.
    pub const fn new() -> Self {
        SlotPool {
            state: AllocatorState::empty(),
            max_allocated: 0,
            placement: Placement::Random,
            next_side: AtomicUsize::new(0),
            region: None,
            tables: None,
            inner: Mutex::new(PoolInner::empty()),
        }
    }

    /// Reserve the guarded region and map the bookkeeping tables.
    ///
    /// The region is reserved with no access and no commit charge; slots are
    /// committed one at a time as they are handed out.
    pub fn reserve(&mut self, settings: &Settings) -> Result<(), InitError> {
        settings.validate()?;
        let page_size = platform::page_size();
        let total = settings.total_pages;
        let num_metadata = settings.num_metadata;

        let bytes = AllocatorState::region_size(page_size, settings.pages_per_slot, total);
        let region = Region::reserve(bytes).ok_or(InitError::Reserve { bytes })?;

        let metadata_off = align_up(total * size_of::<SlotEntry>(), align_of::<SlotMetadata>());
        let free_slots_off = align_up(
            metadata_off + num_metadata * size_of::<SlotMetadata>(),
            align_of::<u16>(),
        );
        let free_metadata_off = free_slots_off + total * size_of::<u16>();
        let table_bytes = align_up(free_metadata_off + num_metadata * size_of::<u16>(), page_size);
        let tables = Region::map(table_bytes).ok_or(InitError::MetadataMap { bytes: table_bytes })?;

        let inner = unsafe {
            let base = tables.as_ptr();
            let slots = base as *mut SlotEntry;
            for i in 0..total {
                slots.add(i).write(SlotEntry::EMPTY);
            }
            let metadata = base.add(metadata_off) as *mut SlotMetadata;
            for i in 0..num_metadata {
                metadata.add(i).write(SlotMetadata::EMPTY);
            }
            PoolInner {
                slots,
                num_slots: total,
                metadata,
                num_metadata,
                free_slots: IndexQueue::new_filled(base.add(free_slots_off) as *mut u16, total),
                free_metadata: IndexQueue::new_filled(
                    base.add(free_metadata_off) as *mut u16,
                    num_metadata,
                ),
                num_allocated: 0,
                total_allocations: 0,
            }
        };

        let mut state = AllocatorState::new(region.addr(), page_size, settings.pages_per_slot, total);
        state.num_metadata = num_metadata;
        state.slot_table_addr = tables.addr();
        state.metadata_addr = tables.addr() + metadata_off;

        self.state = state;
        self.max_allocated = settings.max_allocated_pages;
        self.placement = settings.placement;
        *self.inner.get_mut() = inner;
        self.region = Some(region);
        self.tables = Some(tables);
        Ok(())
    }

    #[inline]
    pub fn state(&self) -> &AllocatorState {
        &self.state
    }

    /// Largest request a slot can hold.
    #[inline]
    pub fn max_request(&self) -> usize {
        self.state.slot_bytes()
    }

    /// O(1) membership test for the whole reserved region, guard pages
    /// included.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.state.pointer_is_mine(addr)
    }

    /// The slot whose usable pages contain `addr`.
    #[inline]
    pub fn lookup(&self, addr: usize) -> Option<SlotId> {
        self.state.addr_to_slot(addr)
    }

    fn choose_side(&self) -> Side {
        let right = match self.placement {
            Placement::Left => false,
            Placement::Right => true,
            Placement::Random => platform::fast_random_u64() & 1 == 1,
            Placement::Alternate => self.next_side.fetch_add(1, Ordering::Relaxed) & 1 == 1,
        };
        if right {
            Side::Right
        } else {
            Side::Left
        }
    }

    /// Hand out the oldest free slot, placed per the placement policy, and
    /// record `info` as its allocation site.
    ///
    /// `alignment == 0` means the default alignment for `size`.
    pub fn acquire_slot(
        &self,
        size: usize,
        alignment: usize,
        type_name: Option<&'static str>,
        info: &AllocationInfo,
    ) -> Result<Acquired, Decline> {
        if size == 0 {
            return Err(Decline::ZeroSize);
        }
        let slot_bytes = self.state.slot_bytes();
        if size > slot_bytes {
            return Err(Decline::TooLarge);
        }
        let alignment = if alignment == 0 {
            default_alignment(size)
        } else {
            alignment
        };
        if !alignment.is_power_of_two() || alignment > self.state.page_size {
            return Err(Decline::BadAlignment);
        }

        let side = self.choose_side();
        let offset = match side {
            Side::Left => 0,
            Side::Right => align_down(slot_bytes - size, alignment),
        };

        let (slot, idx) = self.take_next()?;

        // The slot keeps its old state and record until the commit succeeds,
        // so a failed commit leaves quarantine history untouched.
        let base = self.state.slot_to_addr(slot) as *mut u8;
        if !unsafe { platform::mark_read_write(base, slot_bytes) } {
            self.abandon(slot, idx);
            return Err(Decline::CommitFailed);
        }

        let record = SlotMetadata {
            slot: slot as u16,
            alloc_ptr: base as usize + offset,
            alloc_size: size,
            side,
            type_name,
            alloc: *info,
            dealloc: AllocationInfo::EMPTY,
            deallocation_occurred: false,
        };
        {
            let mut inner = self.inner.lock();
            inner.link(slot, idx, record);
            inner.total_allocations += 1;
        }
        let ptr = unsafe { NonNull::new_unchecked(base.add(offset)) };
        Ok(Acquired { slot, ptr, side })
    }

    /// Pop the oldest free slot and metadata record and count the slot as
    /// live. Neither is touched until `link`.
    fn take_next(&self) -> Result<(SlotId, u16), Decline> {
        let mut inner = self.inner.lock();
        if inner.num_allocated >= self.max_allocated {
            return Err(Decline::Exhausted);
        }
        let slot = match inner.free_slots.pop_front() {
            Some(slot) => slot as SlotId,
            None => return Err(Decline::Exhausted),
        };
        let idx = match inner.free_metadata.pop_front() {
            Some(idx) => idx,
            None => {
                inner.free_slots.push_front(slot as u16);
                return Err(Decline::Exhausted);
            }
        };
        inner.num_allocated += 1;
        Ok((slot, idx))
    }

    /// Undo `take_next` after a failed commit. Both indices go back to the
    /// front of their queues so the FIFO order is unchanged.
    #[cold]
    fn abandon(&self, slot: SlotId, idx: u16) {
        let mut inner = self.inner.lock();
        inner.free_metadata.push_front(idx);
        inner.free_slots.push_front(slot as u16);
        inner.num_allocated -= 1;
    }

    /// Free the allocation at `addr` in `slot`: record `info` as the free
    /// site, move the slot to QuarantinedFreed, poison it if asked, revoke
    /// access and queue it behind every other free slot.
    pub fn release_slot(
        &self,
        slot: SlotId,
        addr: usize,
        info: &AllocationInfo,
        poison: bool,
    ) -> Result<(), FreeError> {
        let idx = {
            let mut inner = self.inner.lock();
            let entry = match inner.slots().get(slot) {
                Some(entry) => *entry,
                None => return Err(FreeError::InvalidFree),
            };
            match entry.state {
                SlotState::Allocated if entry.alloc_ptr == addr => {}
                SlotState::QuarantinedFreed if entry.alloc_ptr == addr => {
                    return Err(FreeError::DoubleFree)
                }
                _ => return Err(FreeError::InvalidFree),
            }
            let meta = &mut inner.metadata()[entry.metadata as usize];
            meta.dealloc = *info;
            meta.deallocation_occurred = true;
            inner.slots()[slot].state = SlotState::QuarantinedFreed;
            entry.metadata
        };

        let base = self.state.slot_to_addr(slot) as *mut u8;
        let slot_bytes = self.state.slot_bytes();
        unsafe {
            if poison {
                ptr::write_bytes(base, POISON_BYTE, slot_bytes);
            }
            let revoked = platform::mark_inaccessible(base, slot_bytes);
            debug_assert!(revoked, "failed to revoke access to a freed slot");
        }

        let mut inner = self.inner.lock();
        inner.free_slots.push_back(slot as u16);
        inner.free_metadata.push_back(idx);
        inner.num_allocated -= 1;
        Ok(())
    }

    /// Requested size of the live allocation that starts at `addr`.
    pub fn live_size(&self, addr: usize) -> Option<usize> {
        let slot = self.lookup(addr)?;
        let mut inner = self.inner.lock();
        let entry = inner.slots()[slot];
        if entry.state != SlotState::Allocated || entry.alloc_ptr != addr {
            return None;
        }
        Some(inner.metadata()[entry.metadata as usize].alloc_size)
    }

    pub fn slot_state(&self, slot: SlotId) -> Option<SlotState> {
        let mut inner = self.inner.lock();
        inner.slots().get(slot).map(|entry| entry.state)
    }

    /// Copy of the metadata record still linked to `slot`, if any.
    pub fn metadata_for_slot(&self, slot: SlotId) -> Option<SlotMetadata> {
        let mut inner = self.inner.lock();
        let idx = inner.slots().get(slot)?.metadata;
        if idx == INVALID_INDEX {
            return None;
        }
        Some(inner.metadata()[idx as usize])
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            allocated: inner.num_allocated,
            total_allocations: inner.total_allocations,
            free_slots: inner.free_slots.len(),
        }
    }
}

impl Default for SlotPool {
    fn default() -> Self {
        Self::new()
    }
}
