//! Stream reassembly.
//!
//! The inverse of assembly: read each data blob of a validated descriptor,
//! decrypt it under the stream key and the blob's IV, strip the padding, and
//! concatenate the plaintext into an output file. Blob reads verify the
//! content address before any ciphertext reaches the cipher.

use std::panic;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task;
use tracing::{debug, instrument};

use crate::blob::file::{BlobReadError, read_blob};
use crate::blob::info::BlobInfo;
use crate::crypto::cipher::{AES_BLOCK_SIZE, CipherError, KEY_SIZE, decrypt_blob};
use crate::stream::descriptor::StreamDescriptor;

/// Blobs decrypted ahead of the writer.
const READ_AHEAD: usize = 4;

#[derive(Error, Debug)]
pub enum ReassemblyError {
    #[error(transparent)]
    BlobRead(#[from] BlobReadError),
    #[error("blob {blob_num} failed to decrypt: {source}")]
    Decrypt { blob_num: u32, source: CipherError },
    #[error("stream key is not 16 hex-encoded bytes")]
    InvalidKey,
    #[error("blob {blob_num} iv is not 16 hex-encoded bytes")]
    InvalidIv { blob_num: u32 },
    #[error("data blob {blob_num} has no blob hash")]
    MissingBlobHash { blob_num: u32 },
    #[error("io error writing output: {0}")]
    Io(#[from] std::io::Error),
}

/// Decrypt every data blob of `descriptor` in `blob_num` order and write the
/// plaintext to `output_path`. Returns the number of plaintext bytes written.
#[instrument(skip_all, fields(stream_hash = descriptor.stream_hash()))]
pub async fn reassemble_stream(
    descriptor: &StreamDescriptor,
    blob_dir: &Path,
    output_path: &Path,
) -> Result<u64, ReassemblyError> {
    let key: [u8; KEY_SIZE] =
        parse_hex_array(descriptor.key()).ok_or(ReassemblyError::InvalidKey)?;

    let mut output = tokio::fs::File::create(output_path).await?;
    let mut written = 0u64;

    let data_blobs: Vec<BlobInfo> =
        descriptor.blobs().iter().filter(|blob| !blob.is_terminator()).cloned().collect();
    let mut chunks = stream::iter(
        data_blobs.into_iter().map(|blob| fetch_chunk(blob_dir.to_owned(), key, blob)),
    )
    .buffered(READ_AHEAD);

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        output.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    output.flush().await?;

    debug!(bytes = written, "reassembled stream");
    Ok(written)
}

/// Read and decrypt one blob on the blocking pool.
async fn fetch_chunk(
    blob_dir: PathBuf,
    key: [u8; KEY_SIZE],
    blob: BlobInfo,
) -> Result<Vec<u8>, ReassemblyError> {
    let blob_num = blob.blob_num;
    let iv: [u8; AES_BLOCK_SIZE] =
        parse_hex_array(&blob.iv).ok_or(ReassemblyError::InvalidIv { blob_num })?;
    let blob_hash = blob.blob_hash.ok_or(ReassemblyError::MissingBlobHash { blob_num })?;

    let joined = task::spawn_blocking(move || {
        let ciphertext = read_blob(&blob_dir, &blob_hash)?;
        decrypt_blob(&key, &iv, &ciphertext)
            .map_err(|source| ReassemblyError::Decrypt { blob_num, source })
    })
    .await;
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
        Err(e) => Err(ReassemblyError::Io(std::io::Error::other(e))),
    }
}

fn parse_hex_array<const N: usize>(hex_str: &str) -> Option<[u8; N]> {
    hex::decode(hex_str).ok()?.try_into().ok()
}
