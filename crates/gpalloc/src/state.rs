//! Pool geometry and crash classification.
//!
//! `AllocatorState` is `#[repr(C)]` plain data so a crash handler can copy
//! it out of a dying process and answer "which slot does this faulting
//! address belong to, and what went wrong" with arithmetic alone.
//!
//! Layout of the reserved region, with `S = pages_per_slot`:
//!
//! ```text
//! [guard][S pages: slot 0][guard][S pages: slot 1][guard] ... [slot n-1][guard]
//! ^ pages_base_addr       ^ first_page_addr + stride                   pages_end_addr ^
//! ```

use crate::pool::metadata::{SlotId, SlotMetadata};
use core::sync::atomic::{AtomicUsize, Ordering};

/// What kind of memory error a faulting address most likely is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    UseAfterFree,
    BufferUnderflow,
    BufferOverflow,
    DoubleFree,
    FreeInvalidAddress,
    Unknown,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::UseAfterFree => "use-after-free",
            ErrorType::BufferUnderflow => "buffer-underflow",
            ErrorType::BufferOverflow => "buffer-overflow",
            ErrorType::DoubleFree => "double-free",
            ErrorType::FreeInvalidAddress => "free-invalid-address",
            ErrorType::Unknown => "unknown",
        }
    }
}

#[repr(C)]
pub struct AllocatorState {
    pub pages_base_addr: usize,
    pub pages_end_addr: usize,
    pub first_page_addr: usize,
    pub page_size: usize,
    pub pages_per_slot: usize,
    pub total_slots: usize,
    pub num_metadata: usize,
    /// Address of the `SlotMetadata` table.
    pub metadata_addr: usize,
    /// Address of the per-slot table (state, metadata index, last pointer).
    pub slot_table_addr: usize,
    /// Set right before aborting on a double free.
    pub double_free_address: AtomicUsize,
    /// Set right before aborting on a free of a pointer we never returned.
    pub free_invalid_address: AtomicUsize,
}

impl AllocatorState {
    /// A state that owns nothing; `pointer_is_mine` is false everywhere.
    pub const fn empty() -> Self {
        AllocatorState {
            pages_base_addr: 0,
            pages_end_addr: 0,
            first_page_addr: 0,
            page_size: 0,
            pages_per_slot: 0,
            total_slots: 0,
            num_metadata: 0,
            metadata_addr: 0,
            slot_table_addr: 0,
            double_free_address: AtomicUsize::new(0),
            free_invalid_address: AtomicUsize::new(0),
        }
    }

    /// Bytes to reserve for `total_slots` slots of `pages_per_slot` pages.
    pub const fn region_size(page_size: usize, pages_per_slot: usize, total_slots: usize) -> usize {
        page_size * (1 + total_slots * (pages_per_slot + 1))
    }

    pub fn new(base: usize, page_size: usize, pages_per_slot: usize, total_slots: usize) -> Self {
        AllocatorState {
            pages_base_addr: base,
            pages_end_addr: base + Self::region_size(page_size, pages_per_slot, total_slots),
            first_page_addr: base + page_size,
            page_size,
            pages_per_slot,
            total_slots,
            ..AllocatorState::empty()
        }
    }

    /// Usable bytes per slot.
    #[inline]
    pub fn slot_bytes(&self) -> usize {
        self.page_size * self.pages_per_slot
    }

    /// Distance between the starts of consecutive slots.
    #[inline]
    pub fn stride(&self) -> usize {
        self.slot_bytes() + self.page_size
    }

    /// Range test only; never touches memory.
    #[inline]
    pub fn pointer_is_mine(&self, addr: usize) -> bool {
        self.pages_base_addr <= addr && addr < self.pages_end_addr
    }

    #[inline]
    pub fn slot_to_addr(&self, slot: SlotId) -> usize {
        debug_assert!(slot < self.total_slots);
        self.first_page_addr + slot * self.stride()
    }

    /// The slot whose usable pages contain `addr`; `None` for guard pages
    /// and foreign addresses.
    pub fn addr_to_slot(&self, addr: usize) -> Option<SlotId> {
        if addr < self.first_page_addr || addr >= self.pages_end_addr {
            return None;
        }
        let offset = addr - self.first_page_addr;
        let slot = offset / self.stride();
        if offset % self.stride() >= self.slot_bytes() {
            return None;
        }
        Some(slot)
    }

    /// The slot a faulting address most plausibly belongs to. Guard pages
    /// are split at their midpoint: the lower half belongs to the slot
    /// before them (an overflow), the upper half to the slot after them (an
    /// underflow).
    pub fn nearest_slot(&self, addr: usize) -> Option<SlotId> {
        if !self.pointer_is_mine(addr) || self.total_slots == 0 {
            return None;
        }
        if addr < self.first_page_addr {
            return Some(0);
        }
        let offset = addr - self.first_page_addr;
        let slot = offset / self.stride();
        let within = offset % self.stride();
        if within < self.slot_bytes() {
            return Some(slot);
        }
        let into_guard = within - self.slot_bytes();
        if into_guard < self.page_size / 2 || slot + 1 >= self.total_slots {
            Some(slot)
        } else {
            Some(slot + 1)
        }
    }

    /// Classify an access to `addr`, given the metadata of its nearest slot.
    pub fn error_type(&self, addr: usize, meta: Option<&SlotMetadata>) -> ErrorType {
        if self.free_invalid_address.load(Ordering::Relaxed) != 0 {
            return ErrorType::FreeInvalidAddress;
        }
        if self.double_free_address.load(Ordering::Relaxed) != 0 {
            return ErrorType::DoubleFree;
        }
        let meta = match meta {
            Some(meta) if meta.is_used() => meta,
            _ => return ErrorType::Unknown,
        };
        if meta.deallocation_occurred {
            ErrorType::UseAfterFree
        } else if addr < meta.alloc_ptr {
            ErrorType::BufferUnderflow
        } else if addr >= meta.alloc_end() {
            ErrorType::BufferOverflow
        } else {
            ErrorType::Unknown
        }
    }
}
