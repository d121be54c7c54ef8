//! gpalloc: a sampled guarded-page allocator.
//!
//! A small fraction of heap allocations is served from a pool of slots
//! that each sit between inaccessible guard pages. Overflows and underflows
//! of a sampled allocation fault on the guard page; freed slots are made
//! inaccessible and quarantined FIFO, so use-after-free faults too. Frees
//! that cannot be right (double frees, foreign pointers into the pool)
//! abort with a report naming the allocation and free sites.

extern crate libc;

pub mod config;
pub mod crash_key;
pub mod diag;
pub mod error;
pub mod gpa;
pub mod platform;
pub mod pool;
pub mod sampling;
pub mod shim;
pub mod state;
pub mod sync;
pub mod util;

#[cfg(feature = "global-allocator")]
pub mod global_alloc;

pub use config::{Placement, Settings, StackTraceCollector};
pub use crash_key::CrashKeyString;
pub use error::InitError;
pub use gpa::{Diagnosis, GuardedPageAllocator, OutOfMemoryCallback};
pub use pool::metadata::{AllocationInfo, SlotMetadata, SlotState};
pub use pool::PoolStats;
pub use shim::{gpa_for_testing, install, AllocFlags, Hooks, OverrideHooks, POOL_CRASH_KEY};
pub use state::{AllocatorState, ErrorType};

#[cfg(feature = "global-allocator")]
pub use global_alloc::SampledAlloc;
