use crate::error::InitError;

/// Upper bound on metadata records; indices are stored as u16.
pub const MAX_METADATA: usize = 2048;

/// Upper bound on slots in the pool; indices are stored as u16.
pub const MAX_SLOTS: usize = 8192;

/// Upper bound on the pages backing a single slot.
pub const MAX_PAGES_PER_SLOT: usize = 16;

pub const DEFAULT_MAX_ALLOCATIONS: usize = 70;
pub const DEFAULT_NUM_METADATA: usize = 255;
pub const DEFAULT_TOTAL_PAGES: usize = 512;
pub const DEFAULT_SAMPLING_FREQUENCY: usize = 1000;

/// Where inside its slot an allocation is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Flip a coin per allocation.
    Random,
    /// Left, right, left, ... across the whole pool.
    Alternate,
    /// Always at the slot start; underflows hit the leading guard page.
    Left,
    /// Always ending at the trailing guard page; overflows fault on the
    /// first byte past the (aligned) end.
    Right,
}

/// Fills `frames` with return addresses of the current call stack and
/// returns how many were written. Called from inside allocation hooks: it
/// must not allocate.
pub type StackTraceCollector = fn(frames: &mut [usize]) -> usize;

/// Everything needed to set up the guarded pool and the sampling gate.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Slots that may be live at the same time.
    pub max_allocated_pages: usize,
    /// Metadata records; extra records keep free-site history for
    /// quarantined slots.
    pub num_metadata: usize,
    /// Slots reserved in the pool, each `pages_per_slot` pages plus a guard.
    pub total_pages: usize,
    /// One in `sampling_frequency` hook calls is serviced by the pool.
    pub sampling_frequency: usize,
    pub pages_per_slot: usize,
    pub placement: Placement,
    pub poison_on_free: bool,
    pub stack_trace: Option<StackTraceCollector>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_allocated_pages: DEFAULT_MAX_ALLOCATIONS,
            num_metadata: DEFAULT_NUM_METADATA,
            total_pages: DEFAULT_TOTAL_PAGES,
            sampling_frequency: DEFAULT_SAMPLING_FREQUENCY,
            pages_per_slot: 1,
            placement: Placement::Random,
            poison_on_free: true,
            stack_trace: None,
        }
    }
}

impl Settings {
    /// Settings for the four sizing knobs, defaults for the rest.
    pub fn new(
        max_allocated_pages: usize,
        num_metadata: usize,
        total_pages: usize,
        sampling_frequency: usize,
    ) -> Self {
        Settings {
            max_allocated_pages,
            num_metadata,
            total_pages,
            sampling_frequency,
            ..Settings::default()
        }
    }

    /// Defaults overridden by `GPALLOC_*` environment variables.
    ///
    /// Reads the environment through `getenv` and parses by hand, so it is
    /// usable before the process heap is ready. Unparseable values are
    /// ignored.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        unsafe {
            if let Some(v) = getenv_usize(b"GPALLOC_MAX_ALLOCATIONS\0") {
                settings.max_allocated_pages = v;
            }
            if let Some(v) = getenv_usize(b"GPALLOC_NUM_METADATA\0") {
                settings.num_metadata = v;
            }
            if let Some(v) = getenv_usize(b"GPALLOC_TOTAL_PAGES\0") {
                settings.total_pages = v;
            }
            if let Some(v) = getenv_usize(b"GPALLOC_SAMPLING_FREQUENCY\0") {
                settings.sampling_frequency = v;
            }
            if let Some(v) = getenv_usize(b"GPALLOC_PAGES_PER_SLOT\0") {
                settings.pages_per_slot = v;
            }
        }
        settings
    }

    /// Check the pool geometry: `0 < max_allocated_pages <= num_metadata <=
    /// total_pages`, all within the index limits.
    pub fn validate(&self) -> Result<(), InitError> {
        if self.max_allocated_pages == 0 {
            return Err(InitError::NoAllocations);
        }
        if self.max_allocated_pages > self.num_metadata {
            return Err(InitError::MoreAllocationsThanMetadata {
                max_allocated: self.max_allocated_pages,
                num_metadata: self.num_metadata,
            });
        }
        if self.num_metadata > MAX_METADATA {
            return Err(InitError::TooManyMetadata(self.num_metadata));
        }
        if self.num_metadata > self.total_pages {
            return Err(InitError::MoreMetadataThanSlots {
                num_metadata: self.num_metadata,
                total_pages: self.total_pages,
            });
        }
        if self.total_pages > MAX_SLOTS {
            return Err(InitError::TooManySlots(self.total_pages));
        }
        if self.pages_per_slot == 0 || self.pages_per_slot > MAX_PAGES_PER_SLOT {
            return Err(InitError::BadSlotPages(self.pages_per_slot));
        }
        if self.sampling_frequency == 0 {
            return Err(InitError::ZeroSamplingFrequency);
        }
        Ok(())
    }
}

/// Kill switch: `GPALLOC_DISABLE` set to anything.
pub fn is_disabled() -> bool {
    let key = b"GPALLOC_DISABLE\0".as_ptr() as *const libc::c_char;
    unsafe { !libc::getenv(key).is_null() }
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// `key` must be NUL-terminated. Calls libc::getenv, which races with
/// concurrent setenv.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    debug_assert_eq!(key.last(), Some(&0));
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }
    parse_usize(core::ffi::CStr::from_ptr(val).to_bytes())
}

fn parse_usize(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }
    let mut result: usize = 0;
    for &byte in digits {
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
    }
    Some(result)
}
