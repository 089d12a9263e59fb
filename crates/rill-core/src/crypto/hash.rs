//! 384-bit content hashing.
//!
//! Every content address on the network — blob hash, stream hash, SD hash —
//! is the lowercase-hex SHA-384 of some byte sequence. The digest width is
//! fixed network-wide; the hex rendering is always 96 characters.

use sha2::{Digest, Sha384};

/// Width of a raw content digest in bytes.
pub const DIGEST_SIZE: usize = 48;

/// Width of a hex-rendered content digest in characters.
pub const HEX_DIGEST_SIZE: usize = DIGEST_SIZE * 2;

/// Incremental SHA-384 hasher for content addressing.
///
/// The stream-hash construction feeds both ASCII hex strings and raw digests
/// through the same primitive, so the raw [`finalize`](Self::finalize) and the
/// hex [`finalize_hex`](Self::finalize_hex) forms are both part of the public
/// surface.
#[derive(Clone, Debug, Default)]
pub struct ContentHasher(Sha384);

impl ContentHasher {
    #[must_use]
    pub fn new() -> Self {
        Self(Sha384::new())
    }

    /// Absorb more input.
    pub fn update(&mut self, bytes: impl AsRef<[u8]>) {
        self.0.update(bytes.as_ref());
    }

    /// The raw 48-byte digest.
    #[must_use]
    pub fn finalize(self) -> [u8; DIGEST_SIZE] {
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&self.0.finalize());
        digest
    }

    /// The digest as 96 lowercase hex characters.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex::encode(self.finalize())
    }
}

/// Hex content address of a single byte sequence.
#[must_use]
pub fn hash_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(bytes);
    hasher.finalize_hex()
}

#[cfg(test)]
mod tests {
    use super::*;

    // NIST FIPS 180-2 test vectors for SHA-384.
    const ABC_DIGEST: &str = "cb00753f45a35e8bb5a03d699ac65007272c32ab0eded1631a8b605a43ff5bed8086072ba1e7cc2358baeca134c825a7";
    const EMPTY_DIGEST: &str = "38b060a751ac96384cd9327eb1b1e36a21fdb71114be07434c0cc7bf63f6e1da274edebfe76f65fbd51ad2f14898b95b";

    #[test]
    fn known_vector_abc() {
        assert_eq!(hash_hex(b"abc"), ABC_DIGEST);
    }

    #[test]
    fn known_vector_empty() {
        assert_eq!(hash_hex(b""), EMPTY_DIGEST);
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut hasher = ContentHasher::new();
        hasher.update(b"ab");
        hasher.update(b"c");
        assert_eq!(hasher.finalize_hex(), hash_hex(b"abc"));
    }

    #[test]
    fn digest_widths() {
        let mut hasher = ContentHasher::new();
        hasher.update(b"width check");
        let hex = hasher.finalize_hex();
        assert_eq!(hex.len(), HEX_DIGEST_SIZE);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
