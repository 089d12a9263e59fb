//! On-disk blob files.
//!
//! A blob file's name is the hex digest of its bytes, so the blob directory
//! is a flat content-addressed namespace: concurrent writers of the same
//! content race harmlessly, and a file that no longer matches its name has
//! been corrupted. Writes go through a temporary file in the same directory,
//! are synced, then renamed into place; a failed or cancelled write never
//! leaves bytes under the content address.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{trace, warn};

use crate::blob::MAX_BLOB_DATA_SIZE;
use crate::crypto::cipher::{AES_BLOCK_SIZE, KEY_SIZE, encrypt_blob};
use crate::crypto::hash::hash_hex;

#[derive(Error, Debug)]
pub enum BlobWriteError {
    /// The plaintext chunk cannot fit in one blob once padded.
    #[error("plaintext chunk of {len} bytes exceeds the {limit}-byte blob payload limit")]
    PlaintextTooLarge { len: usize, limit: usize },
    /// The blob directory's filesystem is out of space.
    #[error("no space left on device writing blob {blob_hash}")]
    DiskFull { blob_hash: String },
    #[error("io error writing blob: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum BlobReadError {
    #[error("blob {blob_hash} is not in the blob directory")]
    NotFound { blob_hash: String },
    /// The file's bytes no longer hash to its name.
    #[error("blob file {blob_hash} hashes to {actual}")]
    HashMismatch { blob_hash: String, actual: String },
    #[error("io error reading blob: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one blob write, reported back to the assembler.
#[derive(Debug, Clone)]
pub struct WroteBlob {
    pub blob_hash: String,
    pub iv: [u8; AES_BLOCK_SIZE],
    pub length: u64,
    pub blob_num: u32,
}

/// Encrypt `plaintext` under (`key`, `iv`) and store the ciphertext at
/// `<blob_dir>/<blob_hash>`.
///
/// If the target file already exists the write is skipped and the blob is
/// still reported: names are content addresses, so an existing file with
/// this name already holds these bytes.
pub fn write_blob(
    blob_dir: &Path,
    key: &[u8; KEY_SIZE],
    iv: &[u8; AES_BLOCK_SIZE],
    plaintext: &[u8],
    blob_num: u32,
) -> Result<WroteBlob, BlobWriteError> {
    if plaintext.len() > MAX_BLOB_DATA_SIZE {
        return Err(BlobWriteError::PlaintextTooLarge {
            len: plaintext.len(),
            limit: MAX_BLOB_DATA_SIZE,
        });
    }

    let ciphertext = encrypt_blob(key, iv, plaintext);
    let blob_hash = hash_hex(&ciphertext);
    let target = blob_dir.join(&blob_hash);

    if target.exists() {
        trace!(%blob_hash, blob_num, "blob already on disk, skipping write");
    } else {
        write_atomic(blob_dir, &target, &ciphertext).map_err(|e| classify_io(e, &blob_hash))?;
        trace!(%blob_hash, blob_num, length = ciphertext.len(), "wrote blob");
    }

    Ok(WroteBlob { blob_hash, iv: *iv, length: ciphertext.len() as u64, blob_num })
}

/// Read a blob's ciphertext and verify it still matches its content address.
pub fn read_blob(blob_dir: &Path, blob_hash: &str) -> Result<Vec<u8>, BlobReadError> {
    let path = blob_dir.join(blob_hash);
    let ciphertext = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BlobReadError::NotFound { blob_hash: blob_hash.to_owned() });
        }
        Err(e) => return Err(e.into()),
    };

    let actual = hash_hex(&ciphertext);
    if actual != blob_hash {
        warn!(expected = %blob_hash, %actual, "blob file failed its integrity check");
        return Err(BlobReadError::HashMismatch { blob_hash: blob_hash.to_owned(), actual });
    }
    Ok(ciphertext)
}

/// Write `bytes` to `target` via a synced temporary file in `dir`.
///
/// The tempfile unlinks on drop, so an interrupted write leaves nothing
/// visible at `target`.
pub(crate) fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

fn classify_io(e: io::Error, blob_hash: &str) -> BlobWriteError {
    if e.kind() == io::ErrorKind::StorageFull {
        BlobWriteError::DiskFull { blob_hash: blob_hash.to_owned() }
    } else {
        BlobWriteError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use tempfile::TempDir;

    const KEY: [u8; KEY_SIZE] = hex!("00000000000000000000000000000000");
    const IV: [u8; AES_BLOCK_SIZE] = hex!("00000000000000000000000000000000");

    #[test]
    fn writes_file_named_after_ciphertext_digest() {
        let dir = TempDir::new().unwrap();
        let wrote = write_blob(dir.path(), &KEY, &IV, &[b'A'; 48], 0).unwrap();

        assert_eq!(wrote.length, 64);
        assert_eq!(wrote.blob_num, 0);
        let on_disk = fs::read(dir.path().join(&wrote.blob_hash)).unwrap();
        assert_eq!(on_disk.len(), 64);
        assert_eq!(hash_hex(&on_disk), wrote.blob_hash);
        assert_eq!(on_disk.len() % AES_BLOCK_SIZE, 0);
    }

    #[test]
    fn rejects_oversized_plaintext() {
        let dir = TempDir::new().unwrap();
        let too_big = vec![0u8; MAX_BLOB_DATA_SIZE + 1];
        let err = write_blob(dir.path(), &KEY, &IV, &too_big, 0).unwrap_err();
        assert!(matches!(err, BlobWriteError::PlaintextTooLarge { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn accepts_largest_allowed_plaintext() {
        let dir = TempDir::new().unwrap();
        let chunk = vec![0x5au8; MAX_BLOB_DATA_SIZE];
        let wrote = write_blob(dir.path(), &KEY, &IV, &chunk, 0).unwrap();
        assert_eq!(wrote.length as usize, crate::blob::MAX_BLOB_SIZE);
    }

    #[test]
    fn duplicate_write_is_skipped_and_still_reported() {
        let dir = TempDir::new().unwrap();
        let first = write_blob(dir.path(), &KEY, &IV, b"same bytes", 0).unwrap();
        let second = write_blob(dir.path(), &KEY, &IV, b"same bytes", 7).unwrap();
        assert_eq!(first.blob_hash, second.blob_hash);
        assert_eq!(second.blob_num, 7);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn read_verifies_the_content_address() {
        let dir = TempDir::new().unwrap();
        let wrote = write_blob(dir.path(), &KEY, &IV, b"payload", 0).unwrap();

        let bytes = read_blob(dir.path(), &wrote.blob_hash).unwrap();
        assert_eq!(hash_hex(&bytes), wrote.blob_hash);

        fs::write(dir.path().join(&wrote.blob_hash), b"tampered").unwrap();
        let err = read_blob(dir.path(), &wrote.blob_hash).unwrap_err();
        assert!(matches!(err, BlobReadError::HashMismatch { .. }));
    }

    #[test]
    fn missing_blob_reads_as_not_found() {
        let dir = TempDir::new().unwrap();
        let err = read_blob(dir.path(), &"0".repeat(96)).unwrap_err();
        assert!(matches!(err, BlobReadError::NotFound { .. }));
    }
}
