use core::ptr;
use core::sync::atomic::AtomicI32;

/// Reserve inaccessible address space without committing memory.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn reserve(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Map anonymous read-write memory.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// # Safety
/// `ptr` must come from `reserve` or `map_anonymous` with the same `size`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// # Safety
/// Region must be mapped and page-aligned.
pub unsafe fn protect_none(ptr: *mut u8, size: usize) -> bool {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE) == 0
}

/// # Safety
/// Region must be mapped and page-aligned.
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) -> bool {
    libc::mprotect(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    ) == 0
}

/// Drop the physical pages backing a range. MADV_DONTNEED guarantees
/// zero-filled pages the next time the range is made accessible.
///
/// # Safety
/// Region must be mapped and page-aligned.
pub unsafe fn decommit(ptr: *mut u8, size: usize) {
    let ret = libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED);
    debug_assert!(ret == 0, "madvise(MADV_DONTNEED) failed");
}

/// Kernel thread id, cached in TLS to avoid a syscall per allocation.
#[inline]
pub fn thread_id() -> u64 {
    use std::cell::Cell;

    thread_local! {
        static CACHED_TID: Cell<u64> = const { Cell::new(0) };
    }

    CACHED_TID
        .try_with(|tid| {
            let cached = tid.get();
            if cached != 0 {
                return cached;
            }
            let new_tid = unsafe { libc::syscall(libc::SYS_gettid) as u64 };
            tid.set(new_tid);
            new_tid
        })
        .unwrap_or(0)
}

/// Sleep while `*word == expected`.
pub fn futex_wait(word: &AtomicI32, expected: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicI32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ptr::null::<libc::timespec>(),
        );
    }
}

/// Wake one waiter sleeping on `word`.
pub fn futex_wake_one(word: &AtomicI32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicI32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1i32,
        );
    }
}
