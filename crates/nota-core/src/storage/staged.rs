//! Staged flash region sink.
//!
//! Models a part that cannot rewrite the running image in place: the upload
//! is programmed word by word into a separate erased region, and `apply`
//! copies the region over the execution image once the session is over.

use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, warn};

use super::traits::{StorageError, StorageSink};
use crate::protocol::UpdateKind;

const ERASED: u8 = 0xFF;
const WORD: usize = 4;

pub struct StagedStorage {
    region: Vec<u8>,
    image: Vec<u8>,
    image_path: Option<PathBuf>,
    declared: usize,
    received: usize,
    program_index: usize,
    word: u32,
    word_fill: usize,
    open: bool,
    staged: Option<usize>,
    last_error: Option<String>,
}

impl StagedStorage {
    /// Region of `capacity` bytes, rounded down to whole words.
    pub fn new(capacity: usize) -> Self {
        Self {
            region: vec![ERASED; capacity - capacity % WORD],
            image: Vec::new(),
            image_path: None,
            declared: 0,
            received: 0,
            program_index: 0,
            word: 0,
            word_fill: 0,
            open: false,
            staged: None,
            last_error: None,
        }
    }

    /// Write the execution image to `path` on `apply`.
    pub fn with_image_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = Some(path.into());
        self
    }

    /// Current execution image.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Bytes staged by the last successful `close`.
    pub fn staged(&self) -> Option<&[u8]> {
        self.staged.map(|len| &self.region[..len])
    }

    fn fail<T>(&mut self, err: StorageError) -> Result<T, StorageError> {
        warn!(error = %err, "Storage failure");
        self.last_error = Some(err.to_string());
        Err(err)
    }

    fn erase(&mut self) {
        self.region.fill(ERASED);
    }

    /// Program one word. Flash cells can only clear bits, so the word must
    /// land on erased cells to read back correctly.
    fn program_word(&mut self, word: u32) -> Result<(), StorageError> {
        let offset = self.program_index;
        let Some(cell) = self.region.get_mut(offset..offset + WORD) else {
            return self.fail(StorageError::Write { offset });
        };
        let current = LittleEndian::read_u32(cell);
        LittleEndian::write_u32(cell, current & word);
        if LittleEndian::read_u32(cell) != word {
            return self.fail(StorageError::Write { offset });
        }
        self.program_index += WORD;
        Ok(())
    }
}

impl StorageSink for StagedStorage {
    fn capacity(&self) -> usize {
        self.region.len()
    }

    fn open(&mut self, size: usize, kind: UpdateKind) -> Result<(), StorageError> {
        self.last_error = None;
        if kind != UpdateKind::Flash {
            return self.fail(StorageError::UnsupportedKind(kind));
        }
        if size == 0 {
            return self.fail(StorageError::Size(size));
        }
        if size > self.region.len() {
            return self.fail(StorageError::Space {
                requested: size,
                capacity: self.region.len(),
            });
        }
        self.erase();
        self.declared = size;
        self.received = 0;
        self.program_index = 0;
        self.word = 0;
        self.word_fill = 0;
        self.staged = None;
        self.open = true;
        debug!(size, "Staging region erased");
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, StorageError> {
        if !self.open {
            return self.fail(StorageError::NotOpen);
        }
        for &b in chunk {
            self.word |= (b as u32) << (self.word_fill * 8);
            self.word_fill += 1;
            if self.word_fill == WORD {
                let word = self.word;
                self.program_word(word)?;
                self.word = 0;
                self.word_fill = 0;
            }
            self.received += 1;
        }
        Ok(chunk.len())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if !self.open {
            return self.fail(StorageError::NotOpen);
        }
        if self.word_fill > 0 {
            // Pad the tail with erased bytes.
            let pad = u32::MAX << (self.word_fill * 8);
            let word = self.word | pad;
            self.program_word(word)?;
            self.word = 0;
            self.word_fill = 0;
        }
        let written = self.received;
        self.open = false;
        if written != self.declared {
            return self.fail(StorageError::Incomplete {
                written,
                expected: self.declared,
            });
        }
        self.staged = Some(self.declared);
        Ok(())
    }

    fn apply(&mut self) -> Result<(), StorageError> {
        let Some(len) = self.staged.take() else {
            return self.fail(StorageError::NothingStaged);
        };
        self.image = self.region[..len].to_vec();
        if let Some(path) = self.image_path.clone()
            && let Err(e) = std::fs::write(&path, &self.image)
        {
            return self.fail(e.into());
        }
        info!(bytes = len, "Staged image applied");
        Ok(())
    }

    fn abort(&mut self) {
        self.open = false;
        self.staged = None;
        self.word = 0;
        self.word_fill = 0;
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_and_apply() {
        let mut sink = StagedStorage::new(64);
        sink.open(6, UpdateKind::Flash).unwrap();
        sink.write(b"abc").unwrap();
        sink.write(b"def").unwrap();
        sink.close().unwrap();
        assert_eq!(sink.staged().unwrap(), b"abcdef");
        assert!(sink.image().is_empty());

        sink.apply().unwrap();
        assert_eq!(sink.image(), b"abcdef");
        assert!(matches!(sink.apply(), Err(StorageError::NothingStaged)));
    }

    #[test]
    fn test_capacity_rounded_to_words() {
        let sink = StagedStorage::new(10);
        assert_eq!(sink.capacity(), 8);
    }

    #[test]
    fn test_rejects_filesystem_and_oversize() {
        let mut sink = StagedStorage::new(8);
        assert!(matches!(
            sink.open(4, UpdateKind::Filesystem),
            Err(StorageError::UnsupportedKind(_))
        ));
        assert!(matches!(
            sink.open(9, UpdateKind::Flash),
            Err(StorageError::Space { .. })
        ));
    }

    #[test]
    fn test_write_past_region_fails() {
        let mut sink = StagedStorage::new(8);
        sink.open(8, UpdateKind::Flash).unwrap();
        sink.write(b"12345678").unwrap();
        assert!(matches!(
            sink.write(b"9abc"),
            Err(StorageError::Write { offset: 8 })
        ));
        assert!(sink.last_error().is_some());
    }

    #[test]
    fn test_short_image_incomplete() {
        let mut sink = StagedStorage::new(16);
        sink.open(8, UpdateKind::Flash).unwrap();
        sink.write(b"1234").unwrap();
        assert!(matches!(
            sink.close(),
            Err(StorageError::Incomplete { written: 4, expected: 8 })
        ));
    }

    #[test]
    fn test_apply_writes_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware.bin");
        let mut sink = StagedStorage::new(16).with_image_file(&path);
        sink.open(5, UpdateKind::Flash).unwrap();
        sink.write(b"hello").unwrap();
        sink.close().unwrap();
        sink.apply().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }
}
