//! Stream descriptors and their content addresses.
//!
//! A stream descriptor binds an ordered blob sequence to a stream identity.
//! Its canonical serialization is a UTF-8 JSON object with lexicographically
//! sorted keys and no insignificant whitespace; the SD hash is the digest of
//! exactly those bytes, and the stream hash is derived from the descriptor
//! fields through a two-layer construction. Both are network-visible
//! addresses: any change to the serialization or to the hash feed forks every
//! stream identity on the network.

use std::io;
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task;
use tracing::{debug, instrument, warn};

use crate::blob::file::write_atomic;
use crate::blob::info::{BlobInfo, BlobInfoError};
use crate::crypto::hash::{ContentHasher, DIGEST_SIZE, hash_hex};
use crate::storage::{ManifestStore, StoreError, StreamRow};

/// Stream type tag embedded in every descriptor.
pub const STREAM_TYPE: &str = "lbryfile";

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("invalid stream descriptor: does not end with a zero-length blob")]
    MissingTerminator,
    #[error("invalid stream descriptor: contains a zero-length data blob")]
    ZeroLengthDataBlob,
    #[error("invalid stream descriptor: terminator must not carry a blob hash")]
    TerminatorHasHash,
    #[error("invalid stream descriptor: data blob {blob_num} is missing its blob hash")]
    MissingBlobHash { blob_num: u32 },
    #[error("invalid stream descriptor: blob numbers are not dense from zero")]
    NonDenseBlobNumbers,
    #[error("invalid stream descriptor: blob {blob_num}: {source}")]
    InvalidBlob { blob_num: u32, source: BlobInfoError },
    #[error("invalid stream descriptor: {field} is not hex-encoded UTF-8")]
    InvalidHexField { field: &'static str },
    #[error("invalid stream descriptor: stream hash does not match stream metadata")]
    StreamHashMismatch,
    #[error("invalid stream descriptor: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum SdBlobWriteError {
    /// A file already sits at the SD blob's content address. Content-addressed
    /// files are never overwritten.
    #[error("sd blob {sd_hash} already exists")]
    SdBlobExists { sd_hash: String },
    #[error("io error writing sd blob: {0}")]
    Io(#[from] io::Error),
}

/// Canonical wire form of a descriptor.
///
/// Key order falls out of field order, which must stay lexicographic:
/// `serde_json` emits struct fields in declaration order, and the SD hash is
/// computed over exactly these bytes. `stream_name` and `suggested_file_name`
/// hold the hex of the UTF-8 name bytes, never the raw strings.
#[derive(Serialize, Deserialize)]
struct SdBlob {
    blobs: Vec<BlobInfo>,
    key: String,
    stream_hash: String,
    stream_name: String,
    stream_type: String,
    suggested_file_name: String,
}

/// A stream's metadata: names, key, and the ordered blob sequence, bound
/// together by the stream hash.
///
/// The stream hash is derived once at construction; the SD hash is derived
/// from the canonical serialization on first request and cached. Constructors
/// other than ingest trust the caller to supply a blob list satisfying the
/// stream invariants (dense `blob_num`, single trailing terminator).
#[derive(Debug)]
pub struct StreamDescriptor {
    stream_name: String,
    key: String,
    suggested_file_name: String,
    blobs: Vec<BlobInfo>,
    stream_hash: String,
    sd_hash: OnceLock<String>,
}

impl PartialEq for StreamDescriptor {
    fn eq(&self, other: &Self) -> bool {
        // The sd_hash cell is a cache of derived state, not identity.
        self.stream_name == other.stream_name
            && self.key == other.key
            && self.suggested_file_name == other.suggested_file_name
            && self.blobs == other.blobs
            && self.stream_hash == other.stream_hash
    }
}

impl Eq for StreamDescriptor {}

impl Clone for StreamDescriptor {
    fn clone(&self) -> Self {
        Self {
            stream_name: self.stream_name.clone(),
            key: self.key.clone(),
            suggested_file_name: self.suggested_file_name.clone(),
            blobs: self.blobs.clone(),
            stream_hash: self.stream_hash.clone(),
            sd_hash: self.sd_hash.clone(),
        }
    }
}

impl StreamDescriptor {
    /// Build a descriptor from its parts, deriving the stream hash.
    ///
    /// `key` is the AES key rendered as 32 lowercase hex characters.
    #[must_use]
    pub fn new(
        stream_name: impl Into<String>,
        key: impl Into<String>,
        suggested_file_name: impl Into<String>,
        blobs: Vec<BlobInfo>,
    ) -> Self {
        let stream_name = stream_name.into();
        let key = key.into();
        let suggested_file_name = suggested_file_name.into();
        let stream_hash = calculate_stream_hash(
            &hex::encode(stream_name.as_bytes()),
            &key,
            &hex::encode(suggested_file_name.as_bytes()),
            &blobs,
        );
        Self { stream_name, key, suggested_file_name, blobs, stream_hash, sd_hash: OnceLock::new() }
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// The AES key as 32 lowercase hex characters.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn suggested_file_name(&self) -> &str {
        &self.suggested_file_name
    }

    /// The ordered blob sequence, terminator last.
    #[must_use]
    pub fn blobs(&self) -> &[BlobInfo] {
        &self.blobs
    }

    #[must_use]
    pub fn stream_hash(&self) -> &str {
        &self.stream_hash
    }

    /// The canonical JSON bytes: sorted keys, no insignificant whitespace,
    /// hex-encoded names. These are exactly the bytes of the SD blob.
    #[must_use]
    pub fn canonical_json(&self) -> Vec<u8> {
        let wire = SdBlob {
            blobs: self.blobs.clone(),
            key: self.key.clone(),
            stream_hash: self.stream_hash.clone(),
            stream_name: hex::encode(self.stream_name.as_bytes()),
            stream_type: STREAM_TYPE.to_owned(),
            suggested_file_name: hex::encode(self.suggested_file_name.as_bytes()),
        };
        serde_json::to_vec(&wire).expect("descriptor serialization cannot fail")
    }

    /// The SD hash: digest of the canonical JSON, computed once and cached.
    pub fn sd_hash(&self) -> &str {
        self.sd_hash.get_or_init(|| hash_hex(self.canonical_json()))
    }

    /// Write the SD blob to `<blob_dir>/<sd_hash>` through a synced tempfile
    /// and atomic rename. Refuses to overwrite an existing file at the
    /// content address.
    #[instrument(skip(self, blob_dir), fields(stream_hash = %self.stream_hash))]
    pub async fn write_sd_blob(&self, blob_dir: &Path) -> Result<PathBuf, SdBlobWriteError> {
        let bytes = self.canonical_json();
        let sd_hash = self.sd_hash().to_owned();
        let dir = blob_dir.to_owned();
        let joined = task::spawn_blocking(move || {
            let target = dir.join(&sd_hash);
            if target.exists() {
                warn!(%sd_hash, "sd blob already exists, refusing to overwrite");
                return Err(SdBlobWriteError::SdBlobExists { sd_hash });
            }
            write_atomic(&dir, &target, &bytes)?;
            debug!(%sd_hash, length = bytes.len(), "wrote sd blob");
            Ok(target)
        })
        .await;
        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
            Err(e) => Err(SdBlobWriteError::Io(io::Error::other(e))),
        }
    }

    /// Persist this stream's manifest: upsert the content-addressed blob rows,
    /// then store the stream and its join rows in one transaction.
    pub async fn save_to_store(&self, store: &ManifestStore) -> Result<(), StoreError> {
        store.add_known_blobs(&self.blobs).await?;
        store.store_stream(StreamRow::from_descriptor(self)).await
    }

    /// Parse and validate an SD blob.
    ///
    /// Validation order: JSON decode, terminator present, no zero-length data
    /// blob, terminator hashless, every data blob hashed, `blob_num` dense
    /// from zero, every blob's fields well-formed, names hex-decode to UTF-8,
    /// and finally the embedded stream hash must equal the one re-derived
    /// from the decoded fields.
    #[instrument(skip(bytes), fields(len = bytes.len()))]
    pub fn from_stream_descriptor_blob(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let decoded: SdBlob = serde_json::from_slice(bytes)?;

        let Some((terminator, data_blobs)) = decoded.blobs.split_last() else {
            return Err(DescriptorError::MissingTerminator);
        };
        if terminator.length != 0 {
            warn!("stream descriptor does not end with a zero-length blob");
            return Err(DescriptorError::MissingTerminator);
        }
        if data_blobs.iter().any(|blob| blob.length == 0) {
            return Err(DescriptorError::ZeroLengthDataBlob);
        }
        if terminator.blob_hash.is_some() {
            return Err(DescriptorError::TerminatorHasHash);
        }
        if let Some(blob) = data_blobs.iter().find(|blob| blob.blob_hash.is_none()) {
            return Err(DescriptorError::MissingBlobHash { blob_num: blob.blob_num });
        }
        if decoded.blobs.iter().enumerate().any(|(i, blob)| blob.blob_num as usize != i) {
            return Err(DescriptorError::NonDenseBlobNumbers);
        }

        // Serde bypassed the BlobInfo constructor; re-derive each record so a
        // malformed iv or blob_hash cannot ride in on a self-consistent
        // stream hash.
        let mut blobs = Vec::with_capacity(decoded.blobs.len());
        for blob in decoded.blobs {
            let blob_num = blob.blob_num;
            blobs.push(
                BlobInfo::new(blob.blob_num, blob.length, blob.iv, blob.blob_hash)
                    .map_err(|source| DescriptorError::InvalidBlob { blob_num, source })?,
            );
        }

        let stream_name = decode_hex_utf8("stream_name", &decoded.stream_name)?;
        let suggested_file_name =
            decode_hex_utf8("suggested_file_name", &decoded.suggested_file_name)?;

        let derived = calculate_stream_hash(
            &decoded.stream_name,
            &decoded.key,
            &decoded.suggested_file_name,
            &blobs,
        );
        if derived != decoded.stream_hash {
            warn!(embedded = %decoded.stream_hash, %derived, "stream hash mismatch on ingest");
            return Err(DescriptorError::StreamHashMismatch);
        }

        Ok(Self {
            stream_name,
            key: decoded.key,
            suggested_file_name,
            blobs,
            stream_hash: decoded.stream_hash,
            sd_hash: OnceLock::new(),
        })
    }
}

/// Derive the stream hash from hex-rendered names and key plus the blob list.
///
/// Feed discipline, fixed network-wide and deliberately mixed:
/// - `stream_name`, `suggested_file_name`: hex of their UTF-8 bytes, as ASCII
/// - `key`: the ASCII of its hex rendering (never the raw key bytes)
/// - per blob: `blob_hash` hex (data blobs only), then `blob_num` and
///   `length` as decimal ASCII, with the `iv` hex between them
/// - each per-blob digest folds into the inner accumulator as raw 48 bytes,
///   and the inner digest folds into the outer hash as raw 48 bytes
///
/// `reference_vector_pins_the_hash_construction` holds a known-answer vector
/// for this construction; it must never be updated to match new output.
pub(crate) fn calculate_stream_hash(
    hex_stream_name: &str,
    key_hex: &str,
    hex_suggested_file_name: &str,
    blobs: &[BlobInfo],
) -> String {
    let mut outer = ContentHasher::new();
    outer.update(hex_stream_name);
    outer.update(key_hex);
    outer.update(hex_suggested_file_name);

    let mut inner = ContentHasher::new();
    for blob in blobs {
        inner.update(blob_digest(blob));
    }
    outer.update(inner.finalize());
    outer.finalize_hex()
}

fn blob_digest(blob: &BlobInfo) -> [u8; DIGEST_SIZE] {
    let mut hasher = ContentHasher::new();
    if blob.length != 0 {
        if let Some(blob_hash) = &blob.blob_hash {
            hasher.update(blob_hash);
        }
    }
    hasher.update(blob.blob_num.to_string());
    hasher.update(&blob.iv);
    hasher.update(blob.length.to_string());
    hasher.finalize()
}

fn decode_hex_utf8(field: &'static str, value: &str) -> Result<String, DescriptorError> {
    let bytes = hex::decode(value).map_err(|_| DescriptorError::InvalidHexField { field })?;
    String::from_utf8(bytes).map_err(|_| DescriptorError::InvalidHexField { field })
}
