//! Content-addressed encrypted blobs.
//!
//! A blob is one AES-CBC-encrypted fragment of a source file, stored at
//! `<blob_dir>/<blob_hash>` where the hash is the digest of the ciphertext.
//! Streams reference blobs through [`BlobInfo`] records and close with a
//! zero-length terminator entry.

pub mod file;
pub mod file_async;
pub mod info;

/// Largest blob the network accepts, in ciphertext bytes. Fixed network-wide.
pub const MAX_BLOB_SIZE: usize = 2 * 1024 * 1024;

/// Largest plaintext chunk that fits in one blob. The reserved byte keeps a
/// full chunk's PKCS#7 padding inside [`MAX_BLOB_SIZE`] and every data blob's
/// ciphertext non-empty.
pub const MAX_BLOB_DATA_SIZE: usize = MAX_BLOB_SIZE - 1;

pub use file::{BlobReadError, BlobWriteError, WroteBlob, read_blob, write_blob};
pub use file_async::create_from_unencrypted;
pub use info::{BlobInfo, BlobInfoError};

impl From<WroteBlob> for BlobInfo {
    fn from(wrote: WroteBlob) -> Self {
        Self {
            blob_hash: Some(wrote.blob_hash),
            blob_num: wrote.blob_num,
            iv: hex::encode(wrote.iv),
            length: wrote.length,
        }
    }
}
