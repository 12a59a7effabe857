//! Recorder error types.

use thiserror::Error;

/// Errors that can occur in recorder operations.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// The record id is not present in the store.
    ///
    /// Seen by writers that keep updating after a `clear()`; such updates
    /// are expected to be dropped, not retried.
    #[error("Unknown record id: {0}")]
    UnknownId(u64),
}

/// Result type for recorder operations.
pub type Result<T> = std::result::Result<T, RecorderError>;
