//! # CPP Error Handling
//!
//! Error types for the CPP bus layer.
//!
//! Errors fall into four groups:
//! - configuration errors (bad identifiers, misaligned offsets, out-of-range
//!   lengths), never retried
//! - resource-state errors (caller misuse of an area or mutex)
//! - transient device errors reported by the transport backend
//! - consistency errors (a mutex key that does not match the device)

use core::fmt;

use crate::id::InterfaceId;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// CPP Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// CPP unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Offset or address not aligned to the access width
    Misaligned {
        /// Offending offset or address
        offset: u64,
        /// Required alignment in bytes
        align: u32,
    },
    /// Access does not fit inside the reserved window
    OutOfRange {
        /// Start offset of the access
        offset: u64,
        /// Length of the access
        length: usize,
        /// Size of the reserved window
        size: usize,
    },
    /// Operation not supported by this device or transport
    Unsupported,

    // =========================================================================
    // Resource-State Errors
    // =========================================================================
    /// Area is acquired (cannot be acquired again or freed)
    AreaAcquired,
    /// Area has not been acquired
    AreaNotAcquired,
    /// Handle closed while areas were still acquired
    AreasOutstanding {
        /// Number of areas still acquired
        acquired: usize,
    },
    /// Mutex is not held by the caller
    NotOwner {
        /// Holder named by the device word, when it was read
        owner: Option<InterfaceId>,
    },
    /// Recursive lock depth exhausted
    DepthOverflow,

    // =========================================================================
    // Transient Device Errors
    // =========================================================================
    /// Backend reported a failure
    Transport(TransportError),
    /// Lock is held elsewhere
    WouldBlock,
    /// Lock not acquired before the deadline
    Timeout,
    /// Lock wait cancelled by the caller
    Cancelled,

    // =========================================================================
    // Consistency Errors
    // =========================================================================
    /// Key stored on the device differs from the requested key
    KeyMismatch {
        /// Key requested by the caller
        expected: u32,
        /// Key found on the device (or in the local cache)
        found: u32,
    },
    /// Lock word is neither locked nor unlocked
    CorruptLock {
        /// Raw lock word
        value: u32,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Configuration
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::Misaligned { offset, align } => {
                write!(f, "offset {:#x} not aligned to {} bytes", offset, align)
            },
            Self::OutOfRange {
                offset,
                length,
                size,
            } => write!(
                f,
                "access {:#x}+{:#x} exceeds area size {:#x}",
                offset, length, size
            ),
            Self::Unsupported => write!(f, "operation not supported"),

            // Resource state
            Self::AreaAcquired => write!(f, "area is acquired"),
            Self::AreaNotAcquired => write!(f, "area is not acquired"),
            Self::AreasOutstanding { acquired } => {
                write!(f, "{} areas still acquired at close", acquired)
            },
            Self::NotOwner { owner: Some(owner) } => {
                write!(f, "mutex held by interface {}", owner)
            },
            Self::NotOwner { owner: None } => write!(f, "mutex is not held by caller"),
            Self::DepthOverflow => write!(f, "mutex recursion depth exhausted"),

            // Transient
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::WouldBlock => write!(f, "mutex is locked"),
            Self::Timeout => write!(f, "timed out waiting for mutex"),
            Self::Cancelled => write!(f, "mutex wait cancelled"),

            // Consistency
            Self::KeyMismatch { expected, found } => write!(
                f,
                "mutex key mismatch: expected {:#010x}, found {:#010x}",
                expected, found
            ),
            Self::CorruptLock { value } => write!(f, "corrupt mutex word {:#010x}", value),
        }
    }
}

impl std::error::Error for Error {}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Backend failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Backend could not bind to the host device
    InitFailed,
    /// No window/BAR available to back the area
    NoResources,
    /// Acquiring hardware resources failed
    AcquireFailed,
    /// Releasing hardware resources failed
    ReleaseFailed,
    /// Bus read failed
    ReadFailed,
    /// Bus write failed
    WriteFailed,
    /// Backend-specific error code
    Code(i32),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitFailed => write!(f, "init failed"),
            Self::NoResources => write!(f, "no resources"),
            Self::AcquireFailed => write!(f, "acquire failed"),
            Self::ReleaseFailed => write!(f, "release failed"),
            Self::ReadFailed => write!(f, "read failed"),
            Self::WriteFailed => write!(f, "write failed"),
            Self::Code(code) => write!(f, "code {}", code),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl Error {
    /// True for lock contention that a retry may resolve
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}
