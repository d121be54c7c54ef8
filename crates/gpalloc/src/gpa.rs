//! The guarded page allocator proper.
//!
//! Wraps a `SlotPool` with the pieces that make it useful as a bug
//! detector: allocation and free sites are captured on every operation,
//! corrupt frees abort with a dump of what is known about the slot, and a
//! crash handler can ask which allocation a faulting address belongs to.

use crate::config::{Settings, StackTraceCollector};
use crate::crash_key::FixedString;
use crate::error::InitError;
use crate::pool::metadata::{AllocationInfo, SlotId, SlotMetadata};
use crate::pool::{Decline, FreeError, PoolStats, SlotPool};
use crate::state::{AllocatorState, ErrorType};
use crate::{fatal, report};
use core::fmt::Write;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

/// Capacity of the crash key, `"<base hex>/<size hex>"`.
pub const CRASH_KEY_LEN: usize = 24;

/// Called the first time the pool runs out of slots, with the number of
/// allocations served until then.
pub type OutOfMemoryCallback = fn(allocations: usize);

/// What a crash handler learns about a faulting address.
#[derive(Debug, Clone, Copy)]
pub struct Diagnosis {
    pub error: ErrorType,
    pub slot: SlotId,
    /// Record still linked to the slot; `None` for a never-used slot or one
    /// whose record has been recycled.
    pub metadata: Option<SlotMetadata>,
}

pub struct GuardedPageAllocator {
    pool: SlotPool,
    oom_callback: Option<OutOfMemoryCallback>,
    oom_reported: AtomicBool,
    poison_on_free: bool,
    stack_trace: Option<StackTraceCollector>,
    crash_key: FixedString<CRASH_KEY_LEN>,
}

impl GuardedPageAllocator {
    /// An allocator with no pool; declines everything until `init`.
    pub const fn new() -> Self {
        GuardedPageAllocator {
            pool: SlotPool::new(),
            oom_callback: None,
            oom_reported: AtomicBool::new(false),
            poison_on_free: true,
            stack_trace: None,
            crash_key: FixedString::new(),
        }
    }

    pub fn init(
        &mut self,
        settings: &Settings,
        oom_callback: Option<OutOfMemoryCallback>,
    ) -> Result<(), InitError> {
        self.pool.reserve(settings)?;
        self.oom_callback = oom_callback;
        self.poison_on_free = settings.poison_on_free;
        self.stack_trace = settings.stack_trace;

        let state = self.pool.state();
        self.crash_key.clear();
        let _ = write!(
            self.crash_key,
            "{:x}/{:x}",
            state.pages_base_addr,
            state.pages_end_addr - state.pages_base_addr
        );
        Ok(())
    }

    /// Serve `size` bytes from a guarded slot, or decline with `None`.
    ///
    /// `alignment == 0` picks the default alignment for `size`.
    pub fn allocate(
        &self,
        size: usize,
        alignment: usize,
        type_name: Option<&'static str>,
    ) -> Option<NonNull<u8>> {
        let info = AllocationInfo::capture(self.stack_trace);
        match self.pool.acquire_slot(size, alignment, type_name, &info) {
            Ok(acquired) => Some(acquired.ptr),
            Err(Decline::Exhausted) => {
                self.report_out_of_memory();
                None
            }
            Err(_) => None,
        }
    }

    #[cold]
    fn report_out_of_memory(&self) {
        if let Some(callback) = self.oom_callback {
            if !self.oom_reported.swap(true, Ordering::Relaxed) {
                callback(self.pool.stats().total_allocations);
            }
        }
    }

    /// Free an allocation returned by `allocate`. Aborts the process on a
    /// double free or on any pointer that is not the start of a live
    /// allocation.
    ///
    /// # Safety
    /// `ptr` must satisfy `pointer_is_mine`. The memory becomes
    /// inaccessible: any later access through `ptr` faults.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let addr = ptr as usize;
        let state = self.pool.state();
        let slot = match self.pool.lookup(addr) {
            Some(slot) => slot,
            None => {
                state.free_invalid_address.store(addr, Ordering::Relaxed);
                self.abort_with_report(addr, format_args!("invalid free of {:#x}", addr));
            }
        };
        let info = AllocationInfo::capture(self.stack_trace);
        match self.pool.release_slot(slot, addr, &info, self.poison_on_free) {
            Ok(()) => {}
            Err(FreeError::DoubleFree) => {
                state.double_free_address.store(addr, Ordering::Relaxed);
                self.abort_with_report(addr, format_args!("double free detected at {:#x}", addr));
            }
            Err(FreeError::InvalidFree) => {
                state.free_invalid_address.store(addr, Ordering::Relaxed);
                self.abort_with_report(addr, format_args!("invalid free of {:#x}", addr));
            }
        }
    }

    /// Requested size of the live allocation at `ptr`. Aborts for any
    /// other pointer.
    pub fn get_requested_size(&self, ptr: *const u8) -> usize {
        let addr = ptr as usize;
        match self.pool.live_size(addr) {
            Some(size) => size,
            None => {
                self.pool
                    .state()
                    .free_invalid_address
                    .store(addr, Ordering::Relaxed);
                self.abort_with_report(
                    addr,
                    format_args!("size query on {:#x}, which is not a live allocation", addr),
                )
            }
        }
    }

    /// True for any address inside the reserved region, guard pages
    /// included. Never dereferences.
    #[inline]
    pub fn pointer_is_mine(&self, ptr: *const u8) -> bool {
        self.pool.contains(ptr as usize)
    }

    /// Largest request a slot can serve.
    #[inline]
    pub fn max_request(&self) -> usize {
        self.pool.max_request()
    }

    pub fn crash_key(&self) -> &str {
        self.crash_key.as_str()
    }

    /// Attribute a faulting address to its nearest slot and classify it.
    pub fn diagnose(&self, addr: usize) -> Option<Diagnosis> {
        let state = self.pool.state();
        let slot = state.nearest_slot(addr)?;
        let metadata = self.pool.metadata_for_slot(slot);
        Some(Diagnosis {
            error: state.error_type(addr, metadata.as_ref()),
            slot,
            metadata,
        })
    }

    pub fn state(&self) -> &AllocatorState {
        self.pool.state()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    #[cold]
    #[inline(never)]
    fn abort_with_report(&self, addr: usize, what: core::fmt::Arguments<'_>) -> ! {
        report!("gpalloc: {}\n", what);
        if let Some(diagnosis) = self.diagnose(addr) {
            report!(
                "gpalloc: {} in slot {} (pool {})\n",
                diagnosis.error.as_str(),
                diagnosis.slot,
                self.crash_key()
            );
            if let Some(meta) = diagnosis.metadata {
                report!(
                    "gpalloc: {:#x} is {} bytes{}{}\n",
                    meta.alloc_ptr,
                    meta.alloc_size,
                    if meta.type_name.is_some() { " of " } else { "" },
                    meta.type_name.unwrap_or("")
                );
                dump_site("allocated", &meta.alloc);
                if meta.deallocation_occurred {
                    dump_site("freed", &meta.dealloc);
                }
            }
        }
        fatal!("gpalloc: aborting\n")
    }
}

fn dump_site(what: &str, info: &AllocationInfo) {
    report!(
        "  {} by thread {} at {}ns\n",
        what,
        info.thread_id,
        info.timestamp_ns
    );
    for (i, frame) in info.trace().iter().enumerate() {
        report!("    #{} {:#x}\n", i, frame);
    }
}

impl Default for GuardedPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Placement;
    use core::sync::atomic::AtomicUsize;

    fn gpa(settings: Settings) -> GuardedPageAllocator {
        let mut gpa = GuardedPageAllocator::new();
        gpa.init(&settings, None).expect("init");
        gpa
    }

    fn with_placement(
        max: usize,
        metadata: usize,
        total: usize,
        placement: Placement,
    ) -> GuardedPageAllocator {
        gpa(Settings {
            placement,
            ..Settings::new(max, metadata, total, 1)
        })
    }

    #[test]
    fn serves_up_to_max_allocated_then_declines() {
        let gpa = gpa(Settings::new(10, 10, 30, 1));
        let page = gpa.max_request();
        let mut ptrs = Vec::new();
        for i in 0..10 {
            let p = gpa.allocate(16 + i, 0, None).expect("allocation");
            assert!(gpa.pointer_is_mine(p.as_ptr()));
            unsafe { core::ptr::write_bytes(p.as_ptr(), 0xAB, 16 + i) };
            ptrs.push(p.as_ptr() as usize / page);
        }
        ptrs.sort_unstable();
        ptrs.dedup();
        assert_eq!(ptrs.len(), 10, "every allocation has its own page");
        assert!(gpa.allocate(8, 0, None).is_none());
        assert_eq!(gpa.stats().allocated, 10);
    }

    #[test]
    fn full_pool_reuses_in_free_order() {
        let gpa = with_placement(3, 3, 3, Placement::Left);
        let a = gpa.allocate(8, 0, None).unwrap();
        let b = gpa.allocate(8, 0, None).unwrap();
        let c = gpa.allocate(8, 0, None).unwrap();
        unsafe {
            gpa.deallocate(c.as_ptr());
            gpa.deallocate(a.as_ptr());
            gpa.deallocate(b.as_ptr());
        }
        assert_eq!(gpa.allocate(8, 0, None), Some(c));
        assert_eq!(gpa.allocate(8, 0, None), Some(a));
        assert_eq!(gpa.allocate(8, 0, None), Some(b));
    }

    #[test]
    fn freed_slot_sits_out_the_spare_slots() {
        let (max, total) = (4, 12);
        let gpa = with_placement(max, max, total, Placement::Left);
        let victim = gpa.allocate(8, 0, None).unwrap();
        unsafe { gpa.deallocate(victim.as_ptr()) };
        let mut distance = 0;
        loop {
            let p = gpa.allocate(8, 0, None).unwrap();
            unsafe { gpa.deallocate(p.as_ptr()) };
            if p == victim {
                break;
            }
            distance += 1;
        }
        assert!(distance >= total - max, "reused after {distance}");
    }

    #[test]
    fn requested_size_is_not_rounded() {
        let gpa = gpa(Settings::new(4, 4, 4, 1));
        for size in [1, 7, 100, gpa.max_request()] {
            let p = gpa.allocate(size, 0, None).unwrap();
            assert_eq!(gpa.get_requested_size(p.as_ptr()), size);
            unsafe { gpa.deallocate(p.as_ptr()) };
        }
    }

    #[test]
    fn alignment_is_honoured() {
        let gpa = gpa(Settings::new(4, 4, 8, 1));
        for (size, align) in [(3, 0), (24, 8), (100, 64), (33, 4096)] {
            let p = gpa.allocate(size, align, None).unwrap().as_ptr() as usize;
            let expected = if align == 0 { 2 } else { align };
            assert_eq!(p % expected, 0, "size {size} align {align}");
            unsafe { gpa.deallocate(p as *mut u8) };
        }
    }

    #[test]
    fn membership_of_arbitrary_addresses() {
        let gpa = gpa(Settings::new(1, 1, 2, 1));
        for addr in [0usize, 1, 0x1000, usize::MAX, usize::MAX - 4095] {
            assert!(!gpa.pointer_is_mine(addr as *const u8));
        }
        let state = gpa.state();
        assert!(gpa.pointer_is_mine(state.pages_base_addr as *const u8));
        assert!(!gpa.pointer_is_mine(state.pages_end_addr as *const u8));
        assert!(!GuardedPageAllocator::new().pointer_is_mine(core::ptr::null()));
    }

    #[test]
    fn declines_without_side_effects() {
        let gpa = gpa(Settings::new(2, 2, 2, 1));
        assert!(gpa.allocate(0, 0, None).is_none());
        assert!(gpa.allocate(gpa.max_request() + 1, 0, None).is_none());
        assert!(gpa.allocate(8, 48, None).is_none());
        assert_eq!(gpa.stats().total_allocations, 0);
        assert!(GuardedPageAllocator::new().allocate(8, 0, None).is_none());
    }

    static OOM_CALLS: AtomicUsize = AtomicUsize::new(0);
    static OOM_SEEN: AtomicUsize = AtomicUsize::new(0);

    fn record_oom(allocations: usize) {
        OOM_CALLS.fetch_add(1, Ordering::SeqCst);
        OOM_SEEN.store(allocations, Ordering::SeqCst);
    }

    #[test]
    fn out_of_memory_callback_fires_once() {
        let mut gpa = GuardedPageAllocator::new();
        gpa.init(&Settings::new(2, 2, 4, 1), Some(record_oom)).unwrap();
        let a = gpa.allocate(8, 0, None).unwrap();
        let _b = gpa.allocate(8, 0, None).unwrap();
        assert!(gpa.allocate(8, 0, None).is_none());
        assert!(gpa.allocate(8, 0, None).is_none());
        unsafe { gpa.deallocate(a.as_ptr()) };
        let _c = gpa.allocate(8, 0, None).unwrap();
        assert!(gpa.allocate(8, 0, None).is_none());
        assert_eq!(OOM_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(OOM_SEEN.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn diagnoses_guard_page_accesses() {
        let gpa = with_placement(2, 2, 2, Placement::Right);
        let size = 64;
        let p = gpa.allocate(size, 0, Some("Widget")).unwrap().as_ptr() as usize;

        let overflow = gpa.diagnose(p + size).unwrap();
        assert_eq!(overflow.error, ErrorType::BufferOverflow);
        let meta = overflow.metadata.unwrap();
        assert_eq!(meta.alloc_ptr, p);
        assert_eq!(meta.type_name, Some("Widget"));

        let slot_start = gpa.state().slot_to_addr(overflow.slot);
        assert_eq!(
            gpa.diagnose(slot_start - 1).unwrap().error,
            ErrorType::BufferUnderflow
        );

        unsafe { gpa.deallocate(p as *mut u8) };
        let uaf = gpa.diagnose(p).unwrap();
        assert_eq!(uaf.error, ErrorType::UseAfterFree);
        assert!(uaf.metadata.unwrap().deallocation_occurred);

        assert!(gpa.diagnose(0x10).is_none());
    }

    #[test]
    fn crash_key_names_the_region() {
        let gpa = gpa(Settings::new(1, 1, 3, 1));
        let state = gpa.state();
        let key = gpa.crash_key();
        assert!(key.len() <= CRASH_KEY_LEN);
        let (base, size) = key.split_once('/').expect("base/size");
        assert_eq!(usize::from_str_radix(base, 16).unwrap(), state.pages_base_addr);
        assert_eq!(
            usize::from_str_radix(size, 16).unwrap(),
            state.pages_end_addr - state.pages_base_addr
        );
    }

    #[test]
    fn freed_memory_is_poisoned_before_reuse() {
        let gpa = with_placement(1, 1, 1, Placement::Left);
        let p = gpa.allocate(32, 0, None).unwrap();
        unsafe {
            core::ptr::write_bytes(p.as_ptr(), 0x11, 32);
            gpa.deallocate(p.as_ptr());
        }
        // The decommit drops the poison along with the pages on Linux;
        // either way the old contents must be gone.
        let q = gpa.allocate(32, 0, None).unwrap();
        assert_eq!(p, q);
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 32) };
        assert!(bytes.iter().all(|&b| b != 0x11));
    }
}
