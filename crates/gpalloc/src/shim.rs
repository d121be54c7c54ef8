//! Process-wide installation.
//!
//! One `GuardedPageAllocator` lives in a static for the life of the
//! process. `install` sets it up and then hands three hook functions to
//! whatever allocator wants to sample into it. The hooks are registered
//! only after setup finishes, so they reach the singleton without any
//! readiness check.

use crate::config::{self, Settings};
use crate::crash_key::CrashKeyString;
use crate::error::InitError;
use crate::gpa::{GuardedPageAllocator, OutOfMemoryCallback, CRASH_KEY_LEN};
use crate::sampling::SamplingState;
use core::cell::{Cell, UnsafeCell};
use core::ops::BitOr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};

/// Options a caller passes along with an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags(u32);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);
    /// Caller copes with a null result.
    pub const RETURN_NULL: AllocFlags = AllocFlags(1 << 0);
    /// Memory must be zeroed.
    pub const ZERO_FILL: AllocFlags = AllocFlags(1 << 1);

    const KNOWN: u32 = Self::RETURN_NULL.0 | Self::ZERO_FILL.0;

    pub const fn from_bits(bits: u32) -> Self {
        AllocFlags(bits)
    }

    pub const fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// No bits outside `RETURN_NULL | ZERO_FILL`.
    pub const fn is_supported(self) -> bool {
        self.0 & !Self::KNOWN == 0
    }
}

impl BitOr for AllocFlags {
    type Output = AllocFlags;

    fn bitor(self, rhs: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | rhs.0)
    }
}

/// Serve a request from the guarded pool, or `None` to leave it to the
/// caller's own allocator.
pub type AllocateHook =
    fn(size: usize, flags: AllocFlags, type_name: Option<&'static str>) -> Option<NonNull<u8>>;

/// Free `ptr` if it belongs to the guarded pool. Returns false for foreign
/// pointers, which the caller must free itself.
pub type FreeHook = unsafe fn(ptr: *mut u8) -> bool;

/// Requested size of a guarded allocation; `None` for foreign pointers.
pub type SizeHook = fn(ptr: *const u8) -> Option<usize>;

#[derive(Clone, Copy)]
pub struct Hooks {
    pub allocate: AllocateHook,
    pub free: FreeHook,
    pub size: SizeHook,
}

/// Something that routes its allocations through a set of hooks. Receives
/// them once, at the end of a successful `install`.
pub trait OverrideHooks {
    fn set_override_hooks(&self, hooks: Hooks);
}

const UNINSTALLED: u8 = 0;
const INSTALLING: u8 = 1;
const INSTALLED: u8 = 2;
const FAILED: u8 = 3;

static INSTALL_STATE: AtomicU8 = AtomicU8::new(UNINSTALLED);

struct GpaHolder(UnsafeCell<GuardedPageAllocator>);

// Mutated only by the thread that wins UNINSTALLED -> INSTALLING, before
// any hook can run.
unsafe impl Sync for GpaHolder {}

static GPA: GpaHolder = GpaHolder(UnsafeCell::new(GuardedPageAllocator::new()));

std::thread_local! {
    static SAMPLES_LEFT: Cell<usize> = const { Cell::new(0) };
}

static SAMPLING: SamplingState = SamplingState::new(&SAMPLES_LEFT);

/// `"<pool base hex>/<pool size hex>"` of the installed pool, for crash
/// reports.
pub static POOL_CRASH_KEY: CrashKeyString<CRASH_KEY_LEN> = CrashKeyString::new("gpalloc-pool");

/// Set up the process-wide guarded allocator and register its hooks with
/// `registry`.
///
/// Runs at most once per process. A failed install is final: the hooks
/// are never registered and later calls report `AlreadyInstalled`.
pub fn install(
    settings: &Settings,
    oom_callback: Option<OutOfMemoryCallback>,
    registry: &dyn OverrideHooks,
) -> Result<&'static GuardedPageAllocator, InitError> {
    if INSTALL_STATE
        .compare_exchange(UNINSTALLED, INSTALLING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(InitError::AlreadyInstalled);
    }

    if config::is_disabled() {
        INSTALL_STATE.store(FAILED, Ordering::Release);
        return Err(InitError::Disabled);
    }

    // Exclusive: we won the CAS and no hook has been handed out yet.
    let gpa = unsafe { &mut *GPA.0.get() };
    if let Err(err) = gpa.init(settings, oom_callback) {
        INSTALL_STATE.store(FAILED, Ordering::Release);
        return Err(err);
    }
    POOL_CRASH_KEY.set(gpa.crash_key());
    SAMPLING.init(settings.sampling_frequency);
    INSTALL_STATE.store(INSTALLED, Ordering::Release);

    registry.set_override_hooks(Hooks {
        allocate: allocate_hook,
        free: free_hook,
        size: size_hook,
    });
    Ok(singleton())
}

/// The installed allocator, for tests and tools that need to inspect it.
pub fn gpa_for_testing() -> Option<&'static GuardedPageAllocator> {
    if INSTALL_STATE.load(Ordering::Acquire) == INSTALLED {
        Some(singleton())
    } else {
        None
    }
}

#[inline(always)]
fn singleton() -> &'static GuardedPageAllocator {
    unsafe { &*GPA.0.get() }
}

fn allocate_hook(
    size: usize,
    flags: AllocFlags,
    type_name: Option<&'static str>,
) -> Option<NonNull<u8>> {
    if !SAMPLING.sample() {
        return None;
    }
    if !flags.is_supported() {
        return None;
    }
    let ptr = singleton().allocate(size, 0, type_name)?;
    if flags.contains(AllocFlags::ZERO_FILL) {
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, size) };
    }
    Some(ptr)
}

unsafe fn free_hook(ptr: *mut u8) -> bool {
    let gpa = singleton();
    if !gpa.pointer_is_mine(ptr) {
        return false;
    }
    gpa.deallocate(ptr);
    true
}

fn size_hook(ptr: *const u8) -> Option<usize> {
    let gpa = singleton();
    if !gpa.pointer_is_mine(ptr) {
        return None;
    }
    Some(gpa.get_requested_size(ptr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let both = AllocFlags::RETURN_NULL | AllocFlags::ZERO_FILL;
        assert!(both.contains(AllocFlags::ZERO_FILL));
        assert!(both.contains(AllocFlags::RETURN_NULL));
        assert!(!AllocFlags::RETURN_NULL.contains(AllocFlags::ZERO_FILL));
        assert!(AllocFlags::NONE.contains(AllocFlags::NONE));
        assert_eq!(AllocFlags::default(), AllocFlags::NONE);
    }

    #[test]
    fn unknown_flags_are_unsupported() {
        assert!(AllocFlags::NONE.is_supported());
        assert!((AllocFlags::RETURN_NULL | AllocFlags::ZERO_FILL).is_supported());
        assert!(!AllocFlags::from_bits(1 << 5).is_supported());
        assert!(!(AllocFlags::ZERO_FILL | AllocFlags::from_bits(1 << 31)).is_supported());
    }
}
