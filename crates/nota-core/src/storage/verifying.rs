//! In-place update sink that verifies the image digest on close.
//!
//! Buffers the image in RAM, hashes it while streaming and only commits it
//! (optionally to a file per update kind) when the size and MD5 match.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::traits::{StorageError, StorageSink};
use crate::digest::DigestWriter;
use crate::protocol::UpdateKind;

struct OpenImage {
    kind: UpdateKind,
    size: usize,
    data: Vec<u8>,
    digest: DigestWriter,
}

/// Image committed by the last successful `close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedImage {
    pub kind: UpdateKind,
    pub data: Vec<u8>,
    pub digest: String,
}

pub struct VerifyingStorage {
    capacity: usize,
    outputs: Vec<(UpdateKind, PathBuf)>,
    current: Option<OpenImage>,
    expected_digest: Option<String>,
    committed: Option<CommittedImage>,
    last_error: Option<String>,
}

impl VerifyingStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            outputs: Vec::new(),
            current: None,
            expected_digest: None,
            committed: None,
            last_error: None,
        }
    }

    /// Persist committed images of `kind` to `path`.
    pub fn with_output(mut self, kind: UpdateKind, path: impl Into<PathBuf>) -> Self {
        self.outputs.push((kind, path.into()));
        self
    }

    pub fn committed(&self) -> Option<&CommittedImage> {
        self.committed.as_ref()
    }

    /// Bytes written since the last `open`.
    pub fn written(&self) -> usize {
        self.current.as_ref().map_or(0, |img| img.data.len())
    }

    fn fail<T>(&mut self, err: StorageError) -> Result<T, StorageError> {
        warn!(error = %err, "Storage failure");
        self.last_error = Some(err.to_string());
        Err(err)
    }
}

impl StorageSink for VerifyingStorage {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn open(&mut self, size: usize, kind: UpdateKind) -> Result<(), StorageError> {
        self.last_error = None;
        self.expected_digest = None;
        if size == 0 {
            return self.fail(StorageError::Size(size));
        }
        if size > self.capacity {
            return self.fail(StorageError::Space {
                requested: size,
                capacity: self.capacity,
            });
        }
        debug!(size, %kind, "Opened verifying region");
        self.current = Some(OpenImage {
            kind,
            size,
            data: Vec::with_capacity(size),
            digest: DigestWriter::new(),
        });
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, StorageError> {
        let Some(img) = self.current.as_mut() else {
            return self.fail(StorageError::NotOpen);
        };
        if img.data.len() + chunk.len() > img.size {
            let requested = img.data.len() + chunk.len();
            let capacity = img.size;
            return self.fail(StorageError::Space {
                requested,
                capacity,
            });
        }
        img.data.extend_from_slice(chunk);
        img.digest.update(chunk);
        Ok(chunk.len())
    }

    fn set_expected_digest(&mut self, digest: &str) {
        self.expected_digest = Some(digest.to_ascii_lowercase());
    }

    fn verifies_digest(&self) -> bool {
        true
    }

    fn close(&mut self) -> Result<(), StorageError> {
        let Some(img) = self.current.take() else {
            return self.fail(StorageError::NotOpen);
        };
        if img.data.len() != img.size {
            return self.fail(StorageError::Incomplete {
                written: img.data.len(),
                expected: img.size,
            });
        }
        let actual = img.digest.finish_hex();
        if let Some(expected) = self.expected_digest.take()
            && expected != actual
        {
            return self.fail(StorageError::DigestMismatch { expected, actual });
        }

        let output = self
            .outputs
            .iter()
            .find(|(k, _)| *k == img.kind)
            .map(|(_, path)| path.clone());
        if let Some(path) = output {
            if let Err(e) = std::fs::write(&path, &img.data) {
                return self.fail(e.into());
            }
            info!(path = %path.display(), bytes = img.data.len(), "Image persisted");
        }

        self.committed = Some(CommittedImage {
            kind: img.kind,
            data: img.data,
            digest: actual,
        });
        Ok(())
    }

    fn abort(&mut self) {
        if self.current.take().is_some() {
            debug!("Discarded partial image");
        }
        self.expected_digest = None;
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }
}
