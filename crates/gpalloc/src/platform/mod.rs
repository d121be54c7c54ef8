//! Virtual memory, clocks and thread identity.
//!
//! Everything here is callable from inside an allocator: no function in this
//! module allocates from the process heap.

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

use crate::util::is_aligned;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// An owned range of address space, unmapped on drop.
///
/// The process-wide allocator lives in a `static` and is never dropped, so
/// only standalone instances (tests, tools) ever give their regions back.
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is plain address space; synchronising access to its contents
// is the owner's job.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Reserve `len` bytes of inaccessible, uncommitted address space.
    pub fn reserve(len: usize) -> Option<Region> {
        debug_assert!(len != 0 && is_aligned(len, page_size()));
        let ptr = unsafe { sys::reserve(len) };
        NonNull::new(ptr).map(|ptr| Region { ptr, len })
    }

    /// Map `len` bytes of zeroed read-write memory.
    pub fn map(len: usize) -> Option<Region> {
        debug_assert!(len != 0 && is_aligned(len, page_size()));
        let ptr = unsafe { sys::map_anonymous(len) };
        NonNull::new(ptr).map(|ptr| Region { ptr, len })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { sys::unmap(self.ptr.as_ptr(), self.len) };
    }
}

/// Make a committed-on-demand range readable and writable.
/// Returns false if the kernel refused (out of commit charge or mappings).
///
/// # Safety
/// `ptr` and `size` must be page-aligned and inside a live `Region`.
#[inline]
pub unsafe fn mark_read_write(ptr: *mut u8, size: usize) -> bool {
    sys::protect_read_write(ptr, size)
}

/// Revoke all access to a range and hand its physical pages back.
///
/// # Safety
/// `ptr` and `size` must be page-aligned and inside a live `Region`.
#[inline]
pub unsafe fn mark_inaccessible(ptr: *mut u8, size: usize) -> bool {
    let ok = sys::protect_none(ptr, size);
    sys::decommit(ptr, size);
    ok
}

/// OS page size, read once with sysconf and cached.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

#[inline]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let ps = if ps > 0 { ps as usize } else { 4096 };
    PAGE_SIZE.store(ps, Ordering::Relaxed);
    ps
}

/// Cheap identifier of the calling thread.
#[inline]
pub fn thread_id() -> u64 {
    sys::thread_id()
}

/// Monotonic clock in nanoseconds.
pub fn monotonic_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(ts.tv_nsec as u64)
}

/// Fast, non-cryptographic random u64.
///
/// Mixes a global counter with the address of a stack slot through the
/// splitmix64 finalizer; good enough for sampling and placement coin flips.
pub fn fast_random_u64() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let stack_addr = &count as *const _ as u64;
    let mut x = stack_addr
        .wrapping_mul(0x517cc1b727220a95)
        .wrapping_add(count.wrapping_mul(0x9E3779B97F4A7C15));
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}

/// Uniform double in (0, 1].
#[inline]
pub fn random_unit() -> f64 {
    const SCALE: f64 = 1.0 / (1u64 << 53) as f64;
    ((fast_random_u64() >> 11) + 1) as f64 * SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(page_size() >= 4096);
    }

    #[test]
    fn reserved_region_can_be_committed_and_revoked() {
        let ps = page_size();
        let region = Region::reserve(ps * 3).expect("reserve");
        unsafe {
            let middle = region.as_ptr().add(ps);
            assert!(mark_read_write(middle, ps));
            middle.write(0xAB);
            assert_eq!(middle.read(), 0xAB);
            assert!(mark_inaccessible(middle, ps));
            assert!(mark_read_write(middle, ps));
        }
    }

    #[test]
    fn random_unit_stays_in_range() {
        for _ in 0..10_000 {
            let u = random_unit();
            assert!(u > 0.0 && u <= 1.0);
        }
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
    }
}
