use core::fmt;

use crate::handle::ExtendedHandle;

/// Error taxonomy returned by every public operation.
///
/// Every variant that can be attributed to a particular sensor or sector
/// carries that context so a caller can map it to a log line without the
/// engine ever printing on its own behalf.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The RAM pool is exhausted and the tiered controller could not free
    /// enough sectors to satisfy the request.
    NoSpace { sensor: Option<u32> },
    /// A handle outside the valid RAM/disk ranges, or the null handle used
    /// where a live sector was expected.
    InvalidHandle { handle: ExtendedHandle },
    /// `length > capacity` was passed to a read/write call.
    InvalidLength { handle: ExtendedHandle, length: usize, capacity: usize },
    /// The handle does not currently name a live sector (freed, quarantined,
    /// or never allocated).
    NotFound { handle: ExtendedHandle },
    /// The underlying filesystem returned an error.
    Io(std::io::Error),
    /// A disk file's header or payload checksum did not match.
    ChecksumMismatch { handle: ExtendedHandle },
    /// An invariant was violated. In debug builds this is fail-stop; in
    /// release builds the caller receives this instead and the offending
    /// chain is quarantined.
    CorruptState { sensor: Option<u32>, detail: &'static str },
}

impl Error {
    /// Sensor id this error can be attributed to, if any.
    pub fn sensor(&self) -> Option<u32> {
        match self {
            Error::NoSpace { sensor } => *sensor,
            Error::CorruptState { sensor, .. } => *sensor,
            _ => None,
        }
    }

    /// Handle this error can be attributed to, if any.
    pub fn handle(&self) -> Option<ExtendedHandle> {
        match self {
            Error::InvalidHandle { handle }
            | Error::InvalidLength { handle, .. }
            | Error::NotFound { handle }
            | Error::ChecksumMismatch { handle } => Some(*handle),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoSpace { sensor } => write!(f, "no space left in RAM pool (sensor {:?})", sensor),
            Error::InvalidHandle { handle } => write!(f, "invalid handle {}", handle),
            Error::InvalidLength { handle, length, capacity } => {
                write!(f, "invalid length {} > capacity {} for handle {}", length, capacity, handle)
            }
            Error::NotFound { handle } => write!(f, "handle {} not found", handle),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::ChecksumMismatch { handle } => write!(f, "checksum mismatch for handle {}", handle),
            Error::CorruptState { sensor, detail } => {
                write!(f, "corrupt allocator state (sensor {:?}): {}", sensor, detail)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
