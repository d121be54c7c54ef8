#![no_main]

use gpalloc::{GuardedPageAllocator, Placement, Settings};
use libfuzzer_sys::fuzz_target;
use std::ptr::NonNull;

/// Interprets a byte slice as a sequence of pool operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=allocate, 1=free, 2=size query, 3=diagnose)
///   byte 1-2: size (little-endian u16)
///   byte 3: tracked index; the top two bits pick the alignment for allocate
///
/// Only well-formed frees are issued: bad frees abort by design.
const MAX_TRACKED: usize = 64;

fuzz_target!(|data: &[u8]| {
    let placement = match data.first().map(|b| b >> 6) {
        Some(0) => Placement::Left,
        Some(1) => Placement::Right,
        Some(2) => Placement::Alternate,
        _ => Placement::Random,
    };
    let mut gpa = GuardedPageAllocator::new();
    let settings = Settings {
        placement,
        ..Settings::new(16, 32, 48, 1)
    };
    gpa.init(&settings, None).expect("init");

    let mut tracked: [Option<(NonNull<u8>, usize, u8)>; MAX_TRACKED] = [None; MAX_TRACKED];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let idx = (data[i + 3] as usize) % MAX_TRACKED;
        let align = match data[i + 3] >> 6 {
            0 => 0,
            1 => 8,
            2 => 64,
            _ => 4096,
        };
        let tag = data[i];
        i += 4;

        match opcode {
            0 => {
                if let Some((p, _, _)) = tracked[idx].take() {
                    unsafe { gpa.deallocate(p.as_ptr()) };
                }
                if let Some(p) = gpa.allocate(size, align, None) {
                    assert!(gpa.pointer_is_mine(p.as_ptr()));
                    if align != 0 {
                        assert_eq!(p.as_ptr() as usize % align, 0);
                    }
                    unsafe { std::ptr::write_bytes(p.as_ptr(), tag, size) };
                    tracked[idx] = Some((p, size, tag));
                }
            }
            1 => {
                if let Some((p, size, tag)) = tracked[idx].take() {
                    let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
                    assert!(bytes.iter().all(|&b| b == tag));
                    unsafe { gpa.deallocate(p.as_ptr()) };
                }
            }
            2 => {
                if let Some((p, size, _)) = tracked[idx] {
                    assert_eq!(gpa.get_requested_size(p.as_ptr()), size);
                }
            }
            _ => {
                if let Some((p, size, _)) = tracked[idx] {
                    let diagnosis = gpa.diagnose(p.as_ptr() as usize + size).expect("in pool");
                    let meta = diagnosis.metadata.expect("live record");
                    assert_eq!(meta.alloc_ptr, p.as_ptr() as usize);
                }
            }
        }
    }

    let live = tracked.iter().filter(|t| t.is_some()).count();
    assert_eq!(gpa.stats().allocated, live);
    for (p, _, _) in tracked.iter().flatten() {
        unsafe { gpa.deallocate(p.as_ptr()) };
    }
});
