// src/error.rs

//! Error types for the runtime.
//!
//! Only recoverable failures live here. Channel contract violations (committing
//! more than `rooms()`/`count()` reported) are bugs in the caller and panic at
//! the point of violation instead.

use std::io;

/// Rejected channel geometry at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Capacity must be at least 2 so one slot can stay reserved.
    #[error("channel capacity {0} is too small (minimum 2)")]
    ZeroCapacity(usize),
    /// Cursor arithmetic masks with `size - 1`.
    #[error("channel capacity {0} is not a power of two")]
    CapacityNotPowerOfTwo(usize),
    /// The shadow region cannot be longer than the ring itself.
    #[error("channel threshold {threshold} exceeds capacity {size}")]
    ThresholdTooLarge { size: usize, threshold: usize },
    #[error("channel needs at least one reader")]
    NoReaders,
}

/// Failure of an [`OsThread`](crate::os::thread::OsThread).
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("thread '{name}' panicked: {message}")]
    Panicked { name: String, message: String },
    /// The thread was cancelled and unwound at a cancellation point.
    #[error("thread '{0}' was cancelled")]
    Cancelled(String),
}

/// Misuse of the scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Actors can only be registered before the loop starts.
    #[error("cannot register actors after the scheduler has started")]
    AlreadyRunning,
}

/// Failure of a byte-transfer adapter.
///
/// Everything except `Io` is a named, expected condition the caller may react
/// to (retry a connect, stop on end of stream).
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("address in use: {0}")]
    AddressInUse(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    /// End of stream. Not a failure for a source that has finished looping.
    #[error("end of stream")]
    Eof,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransferError {
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, TransferError::Eof)
    }
}

/// Result type for byte-transfer adapters.
pub type TransferResult<T> = Result<T, TransferError>;
