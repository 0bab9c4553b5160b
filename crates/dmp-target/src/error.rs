//! Target error types

use thiserror::Error;

/// Errors reported while registering or unregistering volumes.
///
/// The I/O path never fails: remapping and statistics recording have no
/// error cases, and transport failures are reported through the request's
/// completion instead.
#[derive(Error, Debug)]
pub enum TargetError {
    /// Wrong number of table arguments
    #[error("Invalid arguments count: expected 1, got {0}")]
    InvalidArguments(usize),

    /// Room for the descriptor could not be reserved
    #[error("dmp-constructor: Cannot allocate linear context")]
    AllocationFailure,

    /// The underlying device could not be resolved or opened
    #[error("dmp-constructor: Device lookup failed: {device}: {source}")]
    DeviceLookupFailed {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// A volume with this name is already registered
    #[error("Volume already exists: {0}")]
    VolumeExists(String),

    /// No volume with this name is registered
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),
}

impl TargetError {
    /// Negative errno handed back to the registration caller
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidArguments(_) | Self::DeviceLookupFailed { .. } => -libc::EINVAL,
            Self::AllocationFailure => -libc::ENOMEM,
            Self::VolumeExists(_) => -libc::EEXIST,
            Self::VolumeNotFound(_) => -libc::ENXIO,
        }
    }
}

/// Result type for target operations
pub type TargetResult<T> = Result<T, TargetError>;
