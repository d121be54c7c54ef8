use thiserror::Error;

/// Reasons the guarded allocator could not be set up.
///
/// These are the only recoverable errors in the crate: declined allocations
/// are not errors, and detected corruption aborts the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("max_allocated_pages must be non-zero")]
    NoAllocations,
    #[error("max_allocated_pages ({max_allocated}) exceeds num_metadata ({num_metadata})")]
    MoreAllocationsThanMetadata {
        max_allocated: usize,
        num_metadata: usize,
    },
    #[error("num_metadata ({num_metadata}) exceeds total_pages ({total_pages})")]
    MoreMetadataThanSlots {
        num_metadata: usize,
        total_pages: usize,
    },
    #[error("num_metadata ({0}) exceeds the supported maximum ({max})", max = crate::config::MAX_METADATA)]
    TooManyMetadata(usize),
    #[error("total_pages ({0}) exceeds the supported maximum ({max})", max = crate::config::MAX_SLOTS)]
    TooManySlots(usize),
    #[error("pages_per_slot ({0}) must be between 1 and {max}", max = crate::config::MAX_PAGES_PER_SLOT)]
    BadSlotPages(usize),
    #[error("sampling_frequency must be non-zero")]
    ZeroSamplingFrequency,
    #[error("failed to reserve {bytes} bytes of address space")]
    Reserve { bytes: usize },
    #[error("failed to map {bytes} bytes for allocator metadata")]
    MetadataMap { bytes: usize },
    #[error("guarded allocator is already installed")]
    AlreadyInstalled,
    #[error("guarded allocator disabled by GPALLOC_DISABLE")]
    Disabled,
}
