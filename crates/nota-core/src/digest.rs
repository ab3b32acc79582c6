//! MD5 content digests rendered as 32 lowercase hex characters.
//!
//! Used for the password digest, nonce generation, the challenge response
//! and end-to-end image verification.

use md5::{Digest, Md5};

/// Length of a rendered digest.
pub const DIGEST_HEX_LEN: usize = 32;

/// Digest of a raw buffer.
pub fn md5_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Md5::digest(data.as_ref()))
}

/// Digest of the decimal rendering of a clock value.
///
/// Only used to derive nonces that a peer cannot predict.
pub fn md5_of_micros(micros: u64) -> String {
    md5_hex(micros.to_string())
}

/// Whether `text` looks like a rendered digest (32 hex characters).
pub fn is_digest(text: &str) -> bool {
    text.len() == DIGEST_HEX_LEN && text.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Challenge response expected from a peer that knows the password digest.
pub fn challenge_response(password_digest: &str, nonce: &str, cnonce: &str) -> String {
    md5_hex(format!("{password_digest}:{nonce}:{cnonce}"))
}

/// Incremental digest over streamed data.
#[derive(Default, Clone)]
pub struct DigestWriter {
    hasher: Md5,
    len: u64,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
