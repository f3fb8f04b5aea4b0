//! Error types for the raster block cache.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// The result type used throughout rastercache.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for block cache operations.
///
/// Errors are `Clone` so that a band can keep the first write-back failure in
/// a sticky slot and hand out copies of it on every later flush.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A block buffer could not be allocated.
    #[error("Out of memory: cannot allocate {bytes} bytes for block buffer")]
    OutOfMemory {
        /// Size of the failed allocation.
        bytes: usize,
    },

    /// A band failed to write back a dirty block.
    #[error("Write-back of block ({x}, {y}) failed: {message}")]
    WriteBack {
        /// Block column.
        x: u32,
        /// Block row.
        y: u32,
        /// Description of the underlying failure.
        message: String,
    },

    /// Internal bookkeeping was found in a state that must never happen.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O error occurred in a band's backing store.
    #[error("IO error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl Error {
    /// Creates a new write-back error.
    pub fn write_back(x: u32, y: u32, msg: impl Into<String>) -> Self {
        Error::WriteBack { x, y, message: msg.into() }
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Reports a broken invariant.
    ///
    /// Debug builds abort right here. Release builds hand the error back so the
    /// caller can refuse the operation.
    #[track_caller]
    pub fn invariant_violation(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        debug_assert!(false, "invariant violation: {}", msg);
        log::error!("invariant violation: {}", msg);
        Error::InvariantViolation(msg)
    }

    /// Returns true for [`Error::InvariantViolation`].
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}
