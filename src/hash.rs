// src/hash.rs

//! SHA-256 hashing for content addressing and fingerprints
//!
//! Every object in the store, every cached package commit, and the
//! reproducibility fingerprint of a composed tree are identified by a
//! lowercase hex SHA-256 digest.

use sha2::{Digest, Sha256};
use std::io::{self, Read};

/// Length of a hex-encoded SHA-256 digest
pub const SHA256_HEX_LEN: usize = 64;

/// Compute the SHA-256 of a byte slice as lowercase hex
pub fn sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the SHA-256 of everything a reader yields
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Check whether a string looks like a hex SHA-256 digest
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == SHA256_HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Incremental SHA-256 hasher
///
/// Fingerprints are built from several fields; each `update_str` call
/// appends a NUL separator so adjacent fields cannot run together.
#[derive(Default)]
pub struct Hasher {
    state: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes
    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
    }

    /// Feed a string field followed by a NUL separator
    pub fn update_str(&mut self, s: &str) {
        self.state.update(s.as_bytes());
        self.state.update([0u8]);
    }

    /// Finish and return the lowercase hex digest
    pub fn finalize(self) -> String {
        hex::encode(self.state.finalize())
    }
}
