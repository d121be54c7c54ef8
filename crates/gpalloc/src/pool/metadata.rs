use crate::config::StackTraceCollector;
use crate::platform;
use core::fmt;

/// Return addresses kept per allocation or free site.
pub const MAX_TRACE_FRAMES: usize = 16;

/// Marker for "no slot" / "no metadata record" in the u16 index tables.
pub const INVALID_INDEX: u16 = u16::MAX;

pub type SlotId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Never handed out. A freed slot does not come back here; reuse takes
    /// it straight from `QuarantinedFreed` to `Allocated`.
    Free = 0,
    Allocated = 1,
    /// Freed, inaccessible, waiting in the FIFO for reuse.
    QuarantinedFreed = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Who allocated or freed a slot, and when.
#[derive(Clone, Copy)]
pub struct AllocationInfo {
    pub thread_id: u64,
    pub timestamp_ns: u64,
    trace_len: usize,
    trace: [usize; MAX_TRACE_FRAMES],
}

impl AllocationInfo {
    pub const EMPTY: AllocationInfo = AllocationInfo {
        thread_id: 0,
        timestamp_ns: 0,
        trace_len: 0,
        trace: [0; MAX_TRACE_FRAMES],
    };

    /// Record the calling thread, the time and, if a collector is
    /// configured, the call stack.
    pub fn capture(collector: Option<StackTraceCollector>) -> Self {
        let mut info = AllocationInfo {
            thread_id: platform::thread_id(),
            timestamp_ns: platform::monotonic_nanos(),
            ..AllocationInfo::EMPTY
        };
        if let Some(collect) = collector {
            info.trace_len = collect(&mut info.trace).min(MAX_TRACE_FRAMES);
        }
        info
    }

    pub fn trace(&self) -> &[usize] {
        &self.trace[..self.trace_len]
    }
}

impl fmt::Debug for AllocationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationInfo")
            .field("thread_id", &self.thread_id)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("trace", &self.trace())
            .finish()
    }
}

/// Diagnostic record for one allocation. Survives the free, so a crash on a
/// quarantined slot can still name both sites.
#[derive(Debug, Clone, Copy)]
pub struct SlotMetadata {
    /// Slot this record currently describes, or `INVALID_INDEX`.
    pub slot: u16,
    pub alloc_ptr: usize,
    pub alloc_size: usize,
    pub side: Side,
    pub type_name: Option<&'static str>,
    pub alloc: AllocationInfo,
    pub dealloc: AllocationInfo,
    pub deallocation_occurred: bool,
}

impl SlotMetadata {
    pub const EMPTY: SlotMetadata = SlotMetadata {
        slot: INVALID_INDEX,
        alloc_ptr: 0,
        alloc_size: 0,
        side: Side::Left,
        type_name: None,
        alloc: AllocationInfo::EMPTY,
        dealloc: AllocationInfo::EMPTY,
        deallocation_occurred: false,
    };

    pub fn is_used(&self) -> bool {
        self.slot != INVALID_INDEX
    }

    /// One past the last requested byte.
    pub fn alloc_end(&self) -> usize {
        self.alloc_ptr + self.alloc_size
    }
}

/// Per-slot bookkeeping kept next to the metadata table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotEntry {
    pub state: SlotState,
    /// Metadata record linked to this slot, or `INVALID_INDEX` once the
    /// record has been handed to a newer allocation.
    pub metadata: u16,
    /// Pointer most recently returned from this slot.
    pub alloc_ptr: usize,
}

impl SlotEntry {
    pub const EMPTY: SlotEntry = SlotEntry {
        state: SlotState::Free,
        metadata: INVALID_INDEX,
        alloc_ptr: 0,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_trace(frames: &mut [usize]) -> usize {
        for (i, f) in frames.iter_mut().enumerate().take(3) {
            *f = 0x1000 + i;
        }
        3
    }

    fn greedy_trace(frames: &mut [usize]) -> usize {
        frames.len() + 10
    }

    #[test]
    fn capture_records_thread_and_trace() {
        let info = AllocationInfo::capture(Some(fake_trace));
        assert_eq!(info.thread_id, platform::thread_id());
        assert!(info.timestamp_ns > 0);
        assert_eq!(info.trace(), &[0x1000, 0x1001, 0x1002]);

        let bare = AllocationInfo::capture(None);
        assert!(bare.trace().is_empty());
    }

    #[test]
    fn collector_cannot_overrun_the_trace() {
        let info = AllocationInfo::capture(Some(greedy_trace));
        assert_eq!(info.trace().len(), MAX_TRACE_FRAMES);
    }

    #[test]
    fn empty_record_is_unused() {
        assert!(!SlotMetadata::EMPTY.is_used());
        let mut meta = SlotMetadata::EMPTY;
        meta.slot = 3;
        meta.alloc_ptr = 0x4000;
        meta.alloc_size = 64;
        assert!(meta.is_used());
        assert_eq!(meta.alloc_end(), 0x4040);
    }
}
