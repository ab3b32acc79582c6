//! Firmware storage abstraction.
//!
//! The update receiver writes through `StorageSink` only and never branches
//! on the backend in use.

use thiserror::Error;

use crate::protocol::UpdateKind;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not enough space: requested {requested} bytes, capacity {capacity}")]
    Space { requested: usize, capacity: usize },

    #[error("Invalid size: {0}")]
    Size(usize),

    #[error("Region not open")]
    NotOpen,

    #[error("Write failed at offset {offset}")]
    Write { offset: usize },

    #[error("Unsupported update kind: {0}")]
    UnsupportedKind(UpdateKind),

    #[error("Incomplete image: {written} of {expected} bytes")]
    Incomplete { written: usize, expected: usize },

    #[error("MD5 Check Failed: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Nothing staged to apply")]
    NothingStaged,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Place firmware bytes are durably written.
pub trait StorageSink {
    /// Largest image the sink can hold.
    fn capacity(&self) -> usize;

    /// Reserve `size` bytes for an image of the given kind.
    fn open(&mut self, size: usize, kind: UpdateKind) -> Result<(), StorageError>;

    /// Append a chunk. Any failure is fatal to the upload.
    fn write(&mut self, chunk: &[u8]) -> Result<usize, StorageError>;

    /// Expected MD5 of the complete image, for sinks that verify.
    fn set_expected_digest(&mut self, _digest: &str) {}

    /// Whether `set_expected_digest` is honored.
    fn verifies_digest(&self) -> bool {
        false
    }

    /// Finalize the image. Verification failures surface here.
    fn close(&mut self) -> Result<(), StorageError>;

    /// Move a staged image into the execution region. No-op for sinks that
    /// write in place.
    fn apply(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Drop whatever was written since `open`.
    fn abort(&mut self);

    /// Description of the most recent failure.
    fn last_error(&self) -> Option<String>;
}

impl<S: StorageSink + ?Sized> StorageSink for Box<S> {
    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    fn open(&mut self, size: usize, kind: UpdateKind) -> Result<(), StorageError> {
        (**self).open(size, kind)
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, StorageError> {
        (**self).write(chunk)
    }

    fn set_expected_digest(&mut self, digest: &str) {
        (**self).set_expected_digest(digest)
    }

    fn verifies_digest(&self) -> bool {
        (**self).verifies_digest()
    }

    fn close(&mut self) -> Result<(), StorageError> {
        (**self).close()
    }

    fn apply(&mut self) -> Result<(), StorageError> {
        (**self).apply()
    }

    fn abort(&mut self) {
        (**self).abort()
    }

    fn last_error(&self) -> Option<String> {
        (**self).last_error()
    }
}
