//! `#[global_allocator]` support.
//!
//! `SampledAlloc` wraps another `GlobalAlloc` and sends a sample of its
//! allocations to the guarded pool once `install` has registered the
//! hooks. Until then, and for everything not sampled, it is the wrapped
//! allocator.
//!
//! ```rust,ignore
//! use gpalloc::{install, SampledAlloc, Settings};
//! use std::alloc::System;
//!
//! #[global_allocator]
//! static GLOBAL: SampledAlloc<System> = SampledAlloc::new(System);
//!
//! fn main() {
//!     install(&Settings::from_env(), None, &GLOBAL).ok();
//! }
//! ```

use crate::shim::{AllocFlags, AllocateHook, FreeHook, Hooks, OverrideHooks, SizeHook};
use crate::util::default_alignment;
use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicUsize, Ordering};

pub struct SampledAlloc<A> {
    inner: A,
    allocate: AtomicUsize,
    free: AtomicUsize,
    size: AtomicUsize,
}

impl<A> SampledAlloc<A> {
    pub const fn new(inner: A) -> Self {
        SampledAlloc {
            inner,
            allocate: AtomicUsize::new(0),
            free: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        }
    }

    /// Whether hooks have been registered.
    pub fn is_hooked(&self) -> bool {
        self.allocate.load(Ordering::Acquire) != 0
    }

    #[inline]
    fn allocate_hook(&self) -> Option<AllocateHook> {
        let f = self.allocate.load(Ordering::Acquire);
        if f == 0 {
            return None;
        }
        Some(unsafe { core::mem::transmute::<usize, AllocateHook>(f) })
    }

    #[inline]
    fn free_hook(&self) -> Option<FreeHook> {
        let f = self.free.load(Ordering::Acquire);
        if f == 0 {
            return None;
        }
        Some(unsafe { core::mem::transmute::<usize, FreeHook>(f) })
    }

    #[inline]
    fn size_hook(&self) -> Option<SizeHook> {
        let f = self.size.load(Ordering::Acquire);
        if f == 0 {
            return None;
        }
        Some(unsafe { core::mem::transmute::<usize, SizeHook>(f) })
    }

    /// Offer `layout` to the guarded pool. Only layouts whose alignment the
    /// pool's default placement already satisfies are offered.
    #[inline]
    fn try_sampled(&self, layout: Layout, flags: AllocFlags) -> Option<*mut u8> {
        let allocate = self.allocate_hook()?;
        let size = layout.size();
        if size == 0 || layout.align() > default_alignment(size) {
            return None;
        }
        allocate(size, flags, None).map(|p| p.as_ptr())
    }
}

impl<A> OverrideHooks for SampledAlloc<A> {
    /// Set once; later registrations are ignored.
    fn set_override_hooks(&self, hooks: Hooks) {
        if self.is_hooked() {
            return;
        }
        self.free.store(hooks.free as usize, Ordering::Release);
        self.size.store(hooks.size as usize, Ordering::Release);
        // Published last: a visible allocate hook implies the other two.
        self.allocate.store(hooks.allocate as usize, Ordering::Release);
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for SampledAlloc<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if let Some(ptr) = self.try_sampled(layout, AllocFlags::NONE) {
            return ptr;
        }
        self.inner.alloc(layout)
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if let Some(ptr) = self.try_sampled(layout, AllocFlags::ZERO_FILL) {
            return ptr;
        }
        self.inner.alloc_zeroed(layout)
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(free) = self.free_hook() {
            if free(ptr) {
                return;
            }
        }
        self.inner.dealloc(ptr, layout)
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_size = match self.size_hook().and_then(|size| size(ptr)) {
            Some(old_size) => old_size,
            None => return self.inner.realloc(ptr, layout, new_size),
        };

        // Guarded allocations never grow in place: move to a fresh block.
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new_ptr = self.alloc(new_layout);
        if !new_ptr.is_null() {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
            self.dealloc(ptr, layout);
        }
        new_ptr
    }
}
