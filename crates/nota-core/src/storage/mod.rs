//! Firmware storage sinks.

pub mod staged;
pub mod traits;
pub mod verifying;

pub use staged::StagedStorage;
pub use traits::{StorageError, StorageSink};
pub use verifying::{CommittedImage, VerifyingStorage};
