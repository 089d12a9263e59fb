//! Per-blob descriptor records.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::cipher::AES_BLOCK_SIZE;
use crate::crypto::hash::HEX_DIGEST_SIZE;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlobInfoError {
    #[error("iv is not 16 hex-encoded bytes: {iv:?}")]
    InvalidIv { iv: String },
    #[error("blob hash is not a 96-character hex digest: {hash:?}")]
    InvalidHash { hash: String },
    #[error("data blob of length {length} is missing its blob hash")]
    MissingHash { length: u64 },
    #[error("zero-length blob must not carry a blob hash")]
    UnexpectedHash,
}

/// One entry in a stream's blob sequence.
///
/// Within a stream, `blob_num` is dense from zero and exactly one entry has
/// `length == 0`: the terminator, which closes the stream, carries an IV but
/// no hash. Field order is lexicographic and load-bearing — the canonical
/// descriptor serialization emits keys in declaration order, and every SD
/// hash on the network depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    /// Ciphertext digest, present on every data blob and absent on the
    /// terminator. Doubles as the blob's file name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_hash: Option<String>,
    /// Position in the stream.
    pub blob_num: u32,
    /// CBC initialization vector, lowercase hex.
    pub iv: String,
    /// Ciphertext length in bytes. Zero only on the terminator.
    pub length: u64,
}

impl BlobInfo {
    /// Build a validated record: the IV must be 16 hex-encoded bytes and the
    /// hash must be present exactly when `length > 0` (and be a well-formed
    /// digest when it is).
    pub fn new(
        blob_num: u32,
        length: u64,
        iv: String,
        blob_hash: Option<String>,
    ) -> Result<Self, BlobInfoError> {
        if iv.len() != AES_BLOCK_SIZE * 2 || hex::decode(&iv).is_err() {
            return Err(BlobInfoError::InvalidIv { iv });
        }
        match (&blob_hash, length) {
            (None, l) if l > 0 => return Err(BlobInfoError::MissingHash { length }),
            (Some(_), 0) => return Err(BlobInfoError::UnexpectedHash),
            (Some(hash), _) if hash.len() != HEX_DIGEST_SIZE || hex::decode(hash).is_err() => {
                return Err(BlobInfoError::InvalidHash { hash: hash.clone() });
            }
            _ => {}
        }
        Ok(Self { blob_hash, blob_num, iv, length })
    }

    /// The zero-length entry that closes a stream. Carries an IV only.
    #[must_use]
    pub fn terminator(blob_num: u32, iv: &[u8; AES_BLOCK_SIZE]) -> Self {
        Self { blob_hash: None, blob_num, iv: hex::encode(iv), length: 0 }
    }

    #[must_use]
    pub fn is_terminator(&self) -> bool {
        self.length == 0
    }
}
