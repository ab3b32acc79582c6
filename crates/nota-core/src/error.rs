//! Failure kinds reported through the observer.

use thiserror::Error;

/// Why streaming the payload stopped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveFailure {
    #[error("TIMEOUT")]
    Timeout,
    #[error("SIZE OVERFLOW")]
    Overflow,
    #[error("SIZE MISMATCH")]
    SizeMismatch,
    #[error("STORAGE WRITE")]
    Write,
}

/// Error kinds surfaced to the `error` callback.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    /// Challenge response did not match.
    #[error("Auth Failed")]
    Auth,
    /// Storage refused to reserve the image.
    #[error("Begin Failed")]
    Begin,
    /// Streaming the payload failed.
    #[error("Receive Failed: {0}")]
    Receive(ReceiveFailure),
    /// The upload did not end in a verified image.
    #[error("End Failed")]
    End,
}
