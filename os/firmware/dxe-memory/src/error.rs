use fw_memory_addresses::PhysicalAddress;
use uefi::Status;

/// What a pool free found instead of an intact allocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CorruptionKind {
    #[error("pool head signature mismatch")]
    HeadSignature,
    #[error("pool tail signature mismatch")]
    TailSignature,
    #[error("pool head and tail sizes differ")]
    SizeMismatch,
    #[error("pool block is already on a free list")]
    DoubleFree,
}

/// Errors of the page-range tracker.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryMapError {
    #[error("invalid range {start}..={end}")]
    InvalidRange {
        start: PhysicalAddress,
        end: PhysicalAddress,
    },
    #[error("range is already tracked")]
    AlreadyTracked,
    #[error("range is not covered by a compatible entry")]
    NotFound,
    #[error("bootstrap descriptor stack exhausted at depth {depth}")]
    ScratchExhausted { depth: usize },
    #[error("no memory left for map descriptors")]
    DescriptorExhausted,
}

/// Errors reported by the page protection backend.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ProtectionError {
    #[error("page {0} could not be remapped")]
    Rejected(PhysicalAddress),
    #[error("page protection is not supported")]
    Unsupported,
}

/// Errors returned by the memory services.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("not found")]
    NotFound,
    #[error("out of resources")]
    OutOfResources,
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    #[error("pool corruption detected: {0}")]
    Corruption(CorruptionKind),
}

impl MemoryError {
    /// The UEFI status reported to callers.
    ///
    /// Corruption is surfaced as `INVALID_PARAMETER`.
    #[must_use]
    pub const fn status(self) -> Status {
        match self {
            Self::InvalidParameter | Self::Corruption(_) => Status::INVALID_PARAMETER,
            Self::NotFound => Status::NOT_FOUND,
            Self::OutOfResources => Status::OUT_OF_RESOURCES,
            Self::BufferTooSmall { .. } => Status::BUFFER_TOO_SMALL,
        }
    }
}

impl From<MemoryMapError> for MemoryError {
    fn from(value: MemoryMapError) -> Self {
        match value {
            MemoryMapError::InvalidRange { .. } | MemoryMapError::AlreadyTracked => {
                Self::InvalidParameter
            }
            MemoryMapError::NotFound => Self::NotFound,
            MemoryMapError::ScratchExhausted { .. } | MemoryMapError::DescriptorExhausted => {
                Self::OutOfResources
            }
        }
    }
}

impl From<CorruptionKind> for MemoryError {
    fn from(value: CorruptionKind) -> Self {
        Self::Corruption(value)
    }
}

impl From<MemoryError> for Status {
    fn from(value: MemoryError) -> Self {
        value.status()
    }
}
