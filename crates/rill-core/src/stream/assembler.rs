//! Stream creation.
//!
//! The assembler chunks a source file, encrypts and writes each chunk as a
//! content-addressed blob with bounded parallelism, then emits the stream's
//! descriptor, SD blob, and manifest rows. Blob writes may finish in any
//! order; the assembler re-imposes `blob_num` order before the descriptor is
//! built.

use std::io;
use std::path::PathBuf;

use rand::RngCore;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, instrument};

use crate::blob::MAX_BLOB_DATA_SIZE;
use crate::blob::file::{BlobWriteError, WroteBlob};
use crate::blob::file_async::create_from_unencrypted;
use crate::blob::info::BlobInfo;
use crate::crypto::cipher::{AES_BLOCK_SIZE, KEY_SIZE};
use crate::storage::{ManifestStore, StoreError};
use crate::stream::descriptor::{SdBlobWriteError, StreamDescriptor};

/// Default bound on concurrently in-flight encrypt-and-write tasks.
pub const DEFAULT_CREATE_LIMIT: usize = 20;

/// Infinite CSPRNG IV sequence; the default for [`StreamAssembler`].
pub fn random_iv_generator() -> impl Iterator<Item = [u8; AES_BLOCK_SIZE]> + Send {
    std::iter::repeat_with(|| {
        let mut iv = [0u8; AES_BLOCK_SIZE];
        rand::rng().fill_bytes(&mut iv);
        iv
    })
}

#[derive(Error, Debug)]
pub enum StreamCreationError {
    #[error("blob write failed: {0}")]
    BlobWrite(#[from] BlobWriteError),
    /// A file already sits at the SD blob's content address.
    #[error("sd blob {sd_hash} already exists")]
    SdBlobExists { sd_hash: String },
    /// The supplied IV sequence ran out before the terminator drew its IV.
    #[error("iv sequence ended before the stream was fully assembled")]
    IvSequenceExhausted,
    #[error("source path has no UTF-8 file name: {path:?}")]
    InvalidFileName { path: PathBuf },
    #[error("io error reading source file: {0}")]
    Io(#[from] io::Error),
    #[error("blob write task failed: {0}")]
    Task(#[from] JoinError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SdBlobWriteError> for StreamCreationError {
    fn from(e: SdBlobWriteError) -> Self {
        match e {
            SdBlobWriteError::SdBlobExists { sd_hash } => Self::SdBlobExists { sd_hash },
            SdBlobWriteError::Io(e) => Self::Io(e),
        }
    }
}

/// Builder for one stream-creation run.
///
/// ```no_run
/// use rill_core::{ManifestStore, StreamAssembler};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = ManifestStore::open("manifest.sqlite").await?;
/// let descriptor = StreamAssembler::new("blobs", "video.mp4")
///     .create_limit(8)
///     .create(&store)
///     .await?;
/// println!("published {}", descriptor.sd_hash());
/// # Ok(())
/// # }
/// ```
pub struct StreamAssembler {
    blob_dir: PathBuf,
    file_path: PathBuf,
    key: Option<[u8; KEY_SIZE]>,
    ivs: Box<dyn Iterator<Item = [u8; AES_BLOCK_SIZE]> + Send>,
    create_limit: usize,
}

impl StreamAssembler {
    pub fn new(blob_dir: impl Into<PathBuf>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            blob_dir: blob_dir.into(),
            file_path: file_path.into(),
            key: None,
            ivs: Box::new(random_iv_generator()),
            create_limit: DEFAULT_CREATE_LIMIT,
        }
    }

    /// Fix the stream key instead of sampling a fresh one.
    #[must_use]
    pub fn key(mut self, key: [u8; KEY_SIZE]) -> Self {
        self.key = Some(key);
        self
    }

    /// Replace the CSPRNG IV sequence. One IV is consumed per data blob plus
    /// one for the terminator; the terminator draw is observable in the
    /// stream hash.
    #[must_use]
    pub fn iv_sequence(
        mut self,
        ivs: impl Iterator<Item = [u8; AES_BLOCK_SIZE]> + Send + 'static,
    ) -> Self {
        self.ivs = Box::new(ivs);
        self
    }

    /// Bound on concurrently in-flight encrypt-and-write tasks, which also
    /// bounds buffered chunk memory.
    #[must_use]
    pub fn create_limit(mut self, limit: usize) -> Self {
        self.create_limit = limit.max(1);
        self
    }

    /// Run the assembly: chunk the source file, write its blobs, emit the SD
    /// blob, and persist the manifest.
    ///
    /// On a blob-write failure the remaining batch is aborted; blobs already
    /// on disk stay (they are content-addressed and harmless). A store
    /// failure after the SD write leaves the SD blob on disk; retrying with
    /// the same inputs is safe.
    #[instrument(skip_all, fields(file = %self.file_path.display()))]
    pub async fn create(
        mut self,
        store: &ManifestStore,
    ) -> Result<StreamDescriptor, StreamCreationError> {
        let key = self.key.unwrap_or_else(|| {
            let mut key = [0u8; KEY_SIZE];
            rand::rng().fill_bytes(&mut key);
            key
        });

        let stream_name = self
            .file_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StreamCreationError::InvalidFileName { path: self.file_path.clone() })?
            .to_owned();

        let mut source = File::open(&self.file_path).await?;
        let mut blobs: Vec<BlobInfo> = Vec::new();
        let mut batch: JoinSet<Result<WroteBlob, BlobWriteError>> = JoinSet::new();
        let mut blob_num: u32 = 0;

        loop {
            let chunk = read_chunk(&mut source).await?;
            if chunk.is_empty() {
                break;
            }
            let iv = self.ivs.next().ok_or(StreamCreationError::IvSequenceExhausted)?;
            batch.spawn(create_from_unencrypted(self.blob_dir.clone(), key, iv, chunk, blob_num));
            blob_num += 1;

            // The chunker never reads ahead past the batch window.
            if batch.len() >= self.create_limit {
                drain_batch(&mut batch, &mut blobs).await?;
            }
        }
        drain_batch(&mut batch, &mut blobs).await?;

        // Completion order is nondeterministic under parallelism.
        blobs.sort_by_key(|blob| blob.blob_num);

        let terminator_iv = self.ivs.next().ok_or(StreamCreationError::IvSequenceExhausted)?;
        blobs.push(BlobInfo::terminator(blob_num, &terminator_iv));

        let descriptor =
            StreamDescriptor::new(stream_name.clone(), hex::encode(key), stream_name, blobs);
        debug!(
            stream_hash = descriptor.stream_hash(),
            data_blobs = descriptor.blobs().len() - 1,
            "assembled stream"
        );

        descriptor.write_sd_blob(&self.blob_dir).await?;
        descriptor.save_to_store(store).await?;

        info!(
            stream_hash = descriptor.stream_hash(),
            sd_hash = descriptor.sd_hash(),
            "stream created"
        );
        Ok(descriptor)
    }
}

/// Read the next plaintext chunk: exactly `MAX_BLOB_DATA_SIZE` bytes except
/// at end of file, where the final chunk may be short. An empty chunk means
/// the source is exhausted and is never emitted as a blob.
async fn read_chunk(source: &mut File) -> io::Result<Vec<u8>> {
    let mut chunk = vec![0u8; MAX_BLOB_DATA_SIZE];
    let mut filled = 0;
    while filled < chunk.len() {
        let n = source.read(&mut chunk[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    chunk.truncate(filled);
    Ok(chunk)
}

/// Await every task in the batch, collecting results in completion order.
/// The first failure aborts the rest of the batch; already-started blocking
/// writes run to completion and their files remain as orphans.
async fn drain_batch(
    batch: &mut JoinSet<Result<WroteBlob, BlobWriteError>>,
    blobs: &mut Vec<BlobInfo>,
) -> Result<(), StreamCreationError> {
    while let Some(joined) = batch.join_next().await {
        match joined {
            Ok(Ok(wrote)) => blobs.push(wrote.into()),
            Ok(Err(e)) => {
                batch.abort_all();
                return Err(e.into());
            }
            Err(e) => {
                batch.abort_all();
                return Err(StreamCreationError::Task(e));
            }
        }
    }
    Ok(())
}
