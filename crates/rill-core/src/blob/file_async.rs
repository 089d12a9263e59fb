//! Async blob writing.
//!
//! Encryption plus the blob-file write is blocking work; this wrapper moves
//! it onto the runtime's blocking pool so the event loop stays responsive.

use std::panic;
use std::path::PathBuf;

use tokio::task;

use crate::blob::file::{BlobWriteError, WroteBlob, write_blob};
use crate::crypto::cipher::{AES_BLOCK_SIZE, KEY_SIZE};

/// Async version of [`write_blob`]: encrypt a plaintext chunk and store it
/// under its content address. Takes owned buffers because the work is handed
/// to the blocking pool.
pub async fn create_from_unencrypted(
    blob_dir: PathBuf,
    key: [u8; KEY_SIZE],
    iv: [u8; AES_BLOCK_SIZE],
    plaintext: Vec<u8>,
    blob_num: u32,
) -> Result<WroteBlob, BlobWriteError> {
    let joined =
        task::spawn_blocking(move || write_blob(&blob_dir, &key, &iv, &plaintext, blob_num)).await;
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
        Err(e) => Err(BlobWriteError::Io(std::io::Error::other(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::hash_hex;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_blob_off_the_event_loop() {
        let dir = TempDir::new().unwrap();
        let wrote = create_from_unencrypted(
            dir.path().to_owned(),
            [0u8; KEY_SIZE],
            [0u8; AES_BLOCK_SIZE],
            b"async payload".to_vec(),
            3,
        )
        .await
        .unwrap();

        assert_eq!(wrote.blob_num, 3);
        let on_disk = std::fs::read(dir.path().join(&wrote.blob_hash)).unwrap();
        assert_eq!(hash_hex(&on_disk), wrote.blob_hash);
    }
}
